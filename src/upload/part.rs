//! Part uploader
//!
//! Uploads one planned byte range as one part. Every attempt re-reads the
//! range from the data source, so a retry never depends on a stream that
//! was partially consumed.
//!
//! # Retries
//!
//! - Transient failures (network errors, 5xx, 408, 429) are repeated under
//!   the [`RetryPolicy`] with backoff.
//! - An ETag that contradicts the locally computed MD5 is repeated once,
//!   immediately, and is fatal the second time.
//! - Every other failure is fatal for the part.

use super::checksum::PartDigest;
use super::planner::PartSpec;
use super::retry::RetryPolicy;
use super::session::SessionRef;
use super::source::DataSource;
use super::{PartFailure, PartResult, UploadError};
use crate::metrics;
use crate::s3::MultipartApi;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Uploads single parts of a multipart upload
#[derive(Clone)]
pub struct PartUploader {
    api: Arc<dyn MultipartApi>,
    retry: RetryPolicy,
    verify_checksums: bool,
}

impl PartUploader {
    pub fn new(api: Arc<dyn MultipartApi>, retry: RetryPolicy, verify_checksums: bool) -> Self {
        Self {
            api,
            retry,
            verify_checksums,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Upload `spec` from `source` into the upload named by `target`
    #[tracing::instrument(
        name = "upload.part",
        skip(self, target, source, cancel),
        fields(
            s3.upload_id = %target.upload_id,
            s3.part_number = spec.part_number,
            upload.bytes = spec.length,
            s3.etag = tracing::field::Empty,
            upload.attempts = tracing::field::Empty
        ),
        err
    )]
    pub async fn upload(
        &self,
        target: &SessionRef,
        spec: PartSpec,
        source: &dyn DataSource,
        cancel: &CancellationToken,
    ) -> Result<PartResult, PartFailure> {
        let fail = |cause: UploadError| {
            metrics::record_part_failure(cause.kind());
            PartFailure {
                part_number: spec.part_number,
                cause,
            }
        };

        let start = Instant::now();
        let mut attempt = 0u32;
        let mut integrity_retried = false;

        loop {
            if cancel.is_cancelled() {
                return Err(fail(UploadError::Cancelled));
            }
            attempt += 1;

            let body = source
                .read_range(spec.offset, spec.length)
                .await
                .map_err(|e| fail(UploadError::IoError(e)))?;
            let digest = self.verify_checksums.then(|| PartDigest::compute(&body));
            let content_md5 = digest.map(|d| d.content_md5());

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(fail(UploadError::Cancelled)),
                response = self.api.upload_part(
                    &target.bucket,
                    &target.key,
                    &target.upload_id,
                    spec.part_number,
                    body,
                    content_md5.as_deref(),
                ) => response,
            };

            match response {
                Ok(response) => {
                    if let Some(digest) = digest {
                        if digest.matches_etag(&response.etag) == Some(false) {
                            let err = UploadError::IntegrityError {
                                part_number: spec.part_number,
                                expected: digest.hex(),
                                actual: response.etag.clone(),
                            };
                            if integrity_retried {
                                return Err(fail(err));
                            }
                            integrity_retried = true;
                            metrics::record_part_retry("integrity");
                            tracing::warn!(
                                part_number = spec.part_number,
                                error = %err,
                                "Part ETag does not match local MD5, uploading again"
                            );
                            continue;
                        }
                    }

                    let span = tracing::Span::current();
                    span.record("s3.etag", response.etag.as_str());
                    span.record("upload.attempts", attempt);
                    metrics::record_part_success(spec.length, start.elapsed().as_secs_f64());

                    return Ok(PartResult {
                        part_number: spec.part_number,
                        etag: response.etag,
                        size: spec.length,
                        server_side_encryption: response.server_side_encryption,
                    });
                }
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    metrics::record_part_retry("transient");
                    tracing::warn!(
                        part_number = spec.part_number,
                        attempt = attempt,
                        error = %e,
                        "Transient part failure, retrying"
                    );
                    self.retry.backoff(attempt, cancel).await.map_err(fail)?;
                }
                Err(e) => {
                    tracing::Span::current().record("upload.attempts", attempt);
                    return Err(fail(UploadError::from_client(e, attempt)));
                }
            }
        }
    }
}

//! PutObject handler
//!
//! Handles objects below the multipart threshold, including empty objects,
//! with a single request.
//!
//! # Example
//!
//! ```no_run
//! use kumo_uploadr::s3::{S3Client, S3ClientConfig};
//! use kumo_uploadr::upload::put_object::PutObjectHandler;
//! use kumo_uploadr::upload::{BytesSource, RetryPolicy, UploadRequest};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = S3Client::new(S3ClientConfig::default())?;
//! let handler = PutObjectHandler::new(Arc::new(client), RetryPolicy::default(), true);
//!
//! let source = BytesSource::new("Hello, World!");
//! let request = UploadRequest::new("my-bucket", "hello.txt");
//! let result = handler.upload(&request, &source, &CancellationToken::new()).await?;
//! println!("Uploaded with ETag: {}", result.etag);
//! # Ok(())
//! # }
//! ```

use super::checksum::PartDigest;
use super::retry::RetryPolicy;
use super::source::DataSource;
use super::{CompletedUpload, UploadError, UploadRequest};
use crate::metrics;
use crate::s3::MultipartApi;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Single-request upload handler
pub struct PutObjectHandler {
    api: Arc<dyn MultipartApi>,
    retry: RetryPolicy,
    verify_checksums: bool,
}

impl PutObjectHandler {
    pub fn new(api: Arc<dyn MultipartApi>, retry: RetryPolicy, verify_checksums: bool) -> Self {
        Self {
            api,
            retry,
            verify_checksums,
        }
    }

    #[tracing::instrument(
        name = "upload.put_object",
        skip(self, request, source, cancel),
        fields(
            s3.bucket = %request.bucket,
            s3.key = %request.key,
            http.content_type = ?request.options.content_type,
            upload.bytes = source.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    pub async fn upload(
        &self,
        request: &UploadRequest,
        source: &dyn DataSource,
        cancel: &CancellationToken,
    ) -> Result<CompletedUpload, UploadError> {
        let size = source.len();
        let start_time = Instant::now();
        let result = self.put_with_retry(request, source, cancel).await;

        let duration = start_time.elapsed();
        metrics::record_upload_duration("put_object", duration.as_secs_f64());

        match result {
            Ok(response) => {
                metrics::record_upload_success("put_object", size);
                tracing::Span::current().record("s3.etag", response.etag.as_str());
                tracing::info!(
                    etag = %response.etag,
                    bytes_written = size,
                    duration_ms = duration.as_millis(),
                    "PutObject upload completed"
                );

                Ok(CompletedUpload {
                    bucket: request.bucket.clone(),
                    key: request.key.clone(),
                    upload_id: None,
                    etag: response.etag,
                    location: None,
                    size,
                    parts: Vec::new(),
                    reused_parts: 0,
                    server_side_encryption: response.server_side_encryption,
                })
            }
            Err(e) => {
                metrics::record_upload_failure("put_object", e.kind());
                tracing::error!(
                    error = %e,
                    duration_ms = duration.as_millis(),
                    "PutObject upload failed"
                );
                Err(e)
            }
        }
    }

    async fn put_with_retry(
        &self,
        request: &UploadRequest,
        source: &dyn DataSource,
        cancel: &CancellationToken,
    ) -> Result<crate::s3::S3PutObjectResponse, UploadError> {
        let body = source.read_range(0, source.len()).await?;
        let digest = self.verify_checksums.then(|| PartDigest::compute(&body));
        let content_md5 = digest.map(|d| d.content_md5());

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            attempt += 1;

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                response = self.api.put_object(
                    &request.bucket,
                    &request.key,
                    body.clone(),
                    &request.options,
                    content_md5.as_deref(),
                ) => response,
            };

            match response {
                Ok(response) => {
                    if let Some(digest) = digest {
                        if digest.matches_etag(&response.etag) == Some(false) {
                            return Err(UploadError::IntegrityError {
                                part_number: 1,
                                expected: digest.hex(),
                                actual: response.etag,
                            });
                        }
                    }
                    return Ok(response);
                }
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    tracing::warn!(attempt = attempt, error = %e, "PutObject failed, retrying");
                    self.retry.backoff(attempt, cancel).await?;
                }
                Err(e) => return Err(UploadError::from_client(e, attempt)),
            }
        }
    }
}

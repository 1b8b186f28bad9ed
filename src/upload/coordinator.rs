//! Upload coordinator
//!
//! Drives one upload attempt end to end:
//!
//! 1. Objects below the multipart threshold, and objects whose plan has a
//!    single part, go through [`PutObjectHandler`].
//! 2. Larger objects are planned, initiated, and their parts fanned out to
//!    [`PartUploader`] under a semaphore of `concurrent_parts` permits.
//! 3. The first terminal part failure stops scheduling. Parts already in
//!    flight settle, then the upload is aborted.
//! 4. Otherwise the parts are submitted in ascending order to complete the
//!    object.
//!
//! Cancellation stops scheduling at once, cuts in-flight requests short and
//! always ends in an abort, never a completion.
//!
//! # Example
//!
//! ```no_run
//! use kumo_uploadr::config::Config;
//! use kumo_uploadr::s3::{S3Client, S3ClientConfig};
//! use kumo_uploadr::upload::{FileSource, UploadCoordinator, UploadOutcome, UploadRequest};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let client = Arc::new(S3Client::new(S3ClientConfig::from(&config.service))?);
//! let coordinator = UploadCoordinator::from_config(client, &config);
//!
//! let source = Arc::new(FileSource::open("big.bin").await?);
//! let request = UploadRequest::new("my-bucket", "big.bin");
//! match coordinator.run(&request, source, CancellationToken::new()).await? {
//!     UploadOutcome::Completed(done) => println!("ETag {}", done.etag),
//!     UploadOutcome::Failed(failed) => eprintln!("failed: {}", failed.describe()),
//! }
//! # Ok(())
//! # }
//! ```

use super::checksum::{etags_equal, PartDigest};
use super::part::PartUploader;
use super::planner::{PartPlanner, PartSpec, PlannerLimits, UploadPlan};
use super::put_object::PutObjectHandler;
use super::resume::{list_uploaded_parts, reconcile, UploadedPart};
use super::retry::RetryPolicy;
use super::session::{SessionRef, UploadEvent, UploadSession};
use super::source::DataSource;
use super::{
    CleanupError, CleanupOutcome, CompletedUpload, FailedUpload, FailureReason, PartFailure,
    PartResult, UploadError, UploadOptions, UploadOutcome, UploadRequest,
};
use crate::config::{CompleteFailurePolicy, Config, UploadConfig};
use crate::metrics;
use crate::s3::{MultipartApi, S3ClientError, S3CompletedPart};
use futures::TryStreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Coordinates multipart uploads against one service
pub struct UploadCoordinator {
    api: Arc<dyn MultipartApi>,
    config: UploadConfig,
    planner: PartPlanner,
    retry: RetryPolicy,
    uploader: PartUploader,
    single: PutObjectHandler,
}

impl UploadCoordinator {
    pub fn new(api: Arc<dyn MultipartApi>, config: UploadConfig, retry: RetryPolicy) -> Self {
        let planner = PartPlanner::new(PlannerLimits {
            min_part_size: config.min_part_size,
            ..PlannerLimits::default()
        });
        let uploader = PartUploader::new(api.clone(), retry, config.verify_checksums);
        let single = PutObjectHandler::new(api.clone(), retry, config.verify_checksums);
        Self {
            api,
            config,
            planner,
            retry,
            uploader,
            single,
        }
    }

    pub fn from_config(api: Arc<dyn MultipartApi>, config: &Config) -> Self {
        Self::new(api, config.upload.clone(), RetryPolicy::from(&config.retry))
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// The plan this coordinator would use for an object of `object_size` bytes
    pub fn plan(&self, object_size: u64) -> Result<UploadPlan, UploadError> {
        self.planner
            .plan(object_size, self.config.part_size, self.config.max_parts)
    }

    /// Whether an object of `object_size` bytes goes through a single request:
    /// empty, below the multipart threshold, or planned as one part
    pub fn is_single_request(&self, object_size: u64) -> bool {
        object_size == 0
            || object_size < self.config.multipart_threshold
            || self
                .plan(object_size)
                .is_ok_and(|plan| plan.is_single_part())
    }

    /// Upload `source` as `request.bucket`/`request.key`.
    ///
    /// Errors before an upload id exists (planning, initiation, single
    /// request uploads) are returned as `Err`. Once a multipart upload is
    /// open every result is an [`UploadOutcome`].
    #[tracing::instrument(
        name = "upload.run",
        skip(self, request, source, cancel),
        fields(
            s3.bucket = %request.bucket,
            s3.key = %request.key,
            upload.bytes = source.len(),
            s3.upload_id = tracing::field::Empty,
            upload.parts = tracing::field::Empty
        ),
        err
    )]
    pub async fn run(
        &self,
        request: &UploadRequest,
        source: Arc<dyn DataSource>,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let size = source.len();
        if self.is_single_request(size) {
            let completed = self.single.upload(request, source.as_ref(), &cancel).await?;
            return Ok(UploadOutcome::Completed(completed));
        }

        let plan = self.plan(size)?;
        tracing::Span::current().record("upload.parts", plan.part_count());

        // Initiate runs to completion; `drive` aborts if `cancel` fired meanwhile
        let created = self
            .with_retry(&CancellationToken::new(), || {
                self.api
                    .create_multipart_upload(&request.bucket, &request.key, &request.options)
            })
            .await
            .inspect_err(|e| metrics::record_upload_failure("multipart", e.kind()))?;

        tracing::Span::current().record("s3.upload_id", created.upload_id.as_str());
        tracing::info!(
            upload_id = %created.upload_id,
            parts = plan.part_count(),
            part_size = plan.part_size(),
            "Initiated multipart upload"
        );

        let session_ref = SessionRef::new(&request.bucket, &request.key, created.upload_id);
        let mut session = UploadSession::new(session_ref, plan, request.options.clone());
        session.set_server_side_encryption(created.server_side_encryption);
        session.apply(UploadEvent::Initiated)?;

        let pending = session.plan().parts().to_vec();
        self.drive(session, pending, source, cancel, 0).await
    }

    /// Continue an upload that already holds parts on the service.
    ///
    /// The object is replanned from `source`; stored parts whose size (and,
    /// with checksum verification on, content) match the new plan are kept
    /// and only the rest are uploaded.
    #[tracing::instrument(
        name = "upload.resume",
        skip(self, source, cancel),
        fields(
            s3.bucket = %session_ref.bucket,
            s3.key = %session_ref.key,
            s3.upload_id = %session_ref.upload_id,
            upload.bytes = source.len(),
            upload.reused_parts = tracing::field::Empty
        ),
        err
    )]
    pub async fn resume(
        &self,
        session_ref: SessionRef,
        source: Arc<dyn DataSource>,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let plan = self.plan(source.len())?;
        let uploaded = tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            listed = self.list_parts(&session_ref) => listed?,
        };

        let mut reconciliation = reconcile(&plan, &uploaded);
        if self.config.verify_checksums {
            self.verify_reusable(
                &mut reconciliation.reusable,
                &mut reconciliation.pending,
                &plan,
                source.as_ref(),
            )
            .await?;
        }

        let reused = reconciliation.reusable.len();
        tracing::Span::current().record("upload.reused_parts", reused);
        tracing::info!(
            reused = reused,
            pending = reconciliation.pending.len(),
            invalidated = reconciliation.invalidated.len(),
            "Resuming multipart upload"
        );
        metrics::record_reused_parts(reused);

        let mut session = UploadSession::new(session_ref, plan, UploadOptions::default());
        session.apply(UploadEvent::Resumed)?;
        for part in reconciliation.reusable {
            session.ledger().record(part);
        }

        self.drive(session, reconciliation.pending, source, cancel, reused)
            .await
    }

    /// Complete a retained upload from parts the caller holds
    #[tracing::instrument(
        name = "upload.complete",
        skip(self, parts),
        fields(
            s3.upload_id = %session_ref.upload_id,
            upload.parts = parts.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    pub async fn complete(
        &self,
        session_ref: &SessionRef,
        parts: &[PartResult],
    ) -> Result<CompletedUpload, UploadError> {
        if parts.is_empty() {
            return Err(UploadError::IncompleteParts(Vec::new()));
        }

        let mut parts = parts.to_vec();
        parts.sort_by_key(|p| p.part_number);
        parts.dedup_by_key(|p| p.part_number);

        let submitted: Vec<S3CompletedPart> = parts
            .iter()
            .map(|p| S3CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect();

        let response = self
            .with_retry(&CancellationToken::new(), || {
                self.api.complete_multipart_upload(
                    &session_ref.bucket,
                    &session_ref.key,
                    &session_ref.upload_id,
                    &submitted,
                )
            })
            .await?;
        tracing::Span::current().record("s3.etag", response.etag.as_str());

        Ok(CompletedUpload {
            bucket: session_ref.bucket.clone(),
            key: session_ref.key.clone(),
            upload_id: Some(session_ref.upload_id.clone()),
            etag: response.etag,
            location: response.location,
            size: parts.iter().map(|p| p.size).sum(),
            parts,
            reused_parts: 0,
            server_side_encryption: response.server_side_encryption,
        })
    }

    /// Abort an upload and discard its stored parts
    #[tracing::instrument(
        name = "upload.abort",
        skip(self),
        fields(s3.upload_id = %session_ref.upload_id),
        err
    )]
    pub async fn abort(&self, session_ref: &SessionRef) -> Result<(), UploadError> {
        let result = self
            .with_retry(&CancellationToken::new(), || {
                self.api.abort_multipart_upload(
                    &session_ref.bucket,
                    &session_ref.key,
                    &session_ref.upload_id,
                )
            })
            .await;
        metrics::record_abort(result.is_ok());
        result
    }

    /// Every part stored for `session_ref`, ascending
    pub async fn list_parts(
        &self,
        session_ref: &SessionRef,
    ) -> Result<Vec<UploadedPart>, UploadError> {
        list_uploaded_parts(
            self.api.clone(),
            session_ref.clone(),
            self.config.list_page_size,
        )
        .try_collect()
        .await
    }

    async fn drive(
        &self,
        mut session: UploadSession,
        pending: Vec<PartSpec>,
        source: Arc<dyn DataSource>,
        cancel: CancellationToken,
        reused: usize,
    ) -> Result<UploadOutcome, UploadError> {
        let start = Instant::now();
        let mut failures = self.upload_parts(&session, pending, source, &cancel).await;
        failures.sort_by_key(|f| f.part_number);

        if cancel.is_cancelled() {
            tracing::warn!(upload_id = %session.upload_id(), "Upload cancelled, aborting");
            return self
                .fail(session, FailureReason::Cancelled, failures, start)
                .await;
        }
        if !failures.is_empty() {
            tracing::error!(
                upload_id = %session.upload_id(),
                failed_parts = failures.len(),
                first_failure = %failures[0],
                "Part upload failed, aborting"
            );
            return self
                .fail(session, FailureReason::PartsFailed, failures, start)
                .await;
        }

        if self.config.verify_before_complete {
            let verified = tokio::select! {
                _ = cancel.cancelled() => Err(UploadError::Cancelled),
                verified = self.verify_stored_parts(&session) => verified,
            };
            match verified {
                Ok(()) => {}
                Err(UploadError::Cancelled) => {
                    tracing::warn!(upload_id = %session.upload_id(), "Upload cancelled, aborting");
                    return self
                        .fail(session, FailureReason::Cancelled, Vec::new(), start)
                        .await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Stored parts do not match the plan, aborting");
                    return self
                        .fail(session, FailureReason::VerificationFailed(e), Vec::new(), start)
                        .await;
                }
            }
        }

        self.finish(session, reused, &cancel, start).await
    }

    /// Fan `pending` out to the part uploader and return every terminal failure
    async fn upload_parts(
        &self,
        session: &UploadSession,
        pending: Vec<PartSpec>,
        source: Arc<dyn DataSource>,
        cancel: &CancellationToken,
    ) -> Vec<PartFailure> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrent_parts.max(1)));
        let failed = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut task_parts = HashMap::new();

        for spec in pending {
            if failed.load(Ordering::SeqCst) || cancel.is_cancelled() {
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            // a failing task flags before releasing its permit
            if failed.load(Ordering::SeqCst) || cancel.is_cancelled() {
                break;
            }

            let uploader = self.uploader.clone();
            let target = session.session_ref().clone();
            let ledger = session.ledger().clone();
            let source = source.clone();
            let cancel = cancel.clone();
            let failed = failed.clone();

            let handle = tasks.spawn(async move {
                let result = uploader.upload(&target, spec, source.as_ref(), &cancel).await;
                match &result {
                    Ok(part) => {
                        ledger.record(part.clone());
                    }
                    Err(_) => failed.store(true, Ordering::SeqCst),
                }
                drop(permit);
                result
            });
            task_parts.insert(handle.id(), spec.part_number);
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((_, Err(failure))) => failures.push(failure),
                Err(e) => {
                    let part_number = task_parts.get(&e.id()).copied().unwrap_or_default();
                    failures.push(PartFailure {
                        part_number,
                        cause: UploadError::ClientError(format!("part task failed: {e}")),
                    });
                }
            }
        }
        failures
    }

    /// Re-read reusable parts and move those whose content changed to `pending`
    async fn verify_reusable(
        &self,
        reusable: &mut Vec<PartResult>,
        pending: &mut Vec<PartSpec>,
        plan: &UploadPlan,
        source: &dyn DataSource,
    ) -> Result<(), UploadError> {
        let mut kept = Vec::with_capacity(reusable.len());
        for part in reusable.drain(..) {
            let Some(spec) = plan.part(part.part_number) else {
                continue;
            };
            let body = source.read_range(spec.offset, spec.length).await?;
            if PartDigest::compute(&body).matches_etag(&part.etag) == Some(false) {
                tracing::warn!(
                    part_number = part.part_number,
                    "Stored part differs from local data, uploading again"
                );
                pending.push(*spec);
            } else {
                kept.push(part);
            }
        }
        *reusable = kept;
        pending.sort_by_key(|p| p.part_number);
        Ok(())
    }

    /// Check that the service holds every planned part with the recorded size and ETag
    async fn verify_stored_parts(&self, session: &UploadSession) -> Result<(), UploadError> {
        let stored: HashMap<u32, UploadedPart> = self
            .list_parts(session.session_ref())
            .await?
            .into_iter()
            .map(|p| (p.part_number, p))
            .collect();

        let mismatched: Vec<u32> = session
            .plan()
            .parts()
            .iter()
            .filter(|spec| {
                let recorded = session.ledger().get(spec.part_number);
                match (stored.get(&spec.part_number), recorded) {
                    (Some(listed), Some(recorded)) => {
                        listed.size != spec.length || !etags_equal(&listed.etag, &recorded.etag)
                    }
                    _ => true,
                }
            })
            .map(|spec| spec.part_number)
            .collect();

        if mismatched.is_empty() {
            Ok(())
        } else {
            Err(UploadError::IncompleteParts(mismatched))
        }
    }

    async fn finish(
        &self,
        mut session: UploadSession,
        reused: usize,
        cancel: &CancellationToken,
        start: Instant,
    ) -> Result<UploadOutcome, UploadError> {
        let submitted = match session.completion_parts() {
            Ok(parts) => parts,
            Err(e) => {
                return self
                    .fail(session, FailureReason::VerificationFailed(e), Vec::new(), start)
                    .await
            }
        };

        // Last point where cancellation can still prevent completion
        if cancel.is_cancelled() {
            tracing::warn!(upload_id = %session.upload_id(), "Upload cancelled, aborting");
            return self
                .fail(session, FailureReason::Cancelled, Vec::new(), start)
                .await;
        }

        session.apply(UploadEvent::BeginComplete)?;
        let session_ref = session.session_ref().clone();
        let result = self
            .with_retry(&CancellationToken::new(), || {
                self.api.complete_multipart_upload(
                    &session_ref.bucket,
                    &session_ref.key,
                    &session_ref.upload_id,
                    &submitted,
                )
            })
            .await;

        match result {
            Ok(response) => {
                session.apply(UploadEvent::CompleteSucceeded)?;
                let parts: Vec<PartResult> = session
                    .ledger()
                    .sorted()
                    .into_iter()
                    .filter(|p| session.plan().part(p.part_number).is_some())
                    .collect();
                let size = session.plan().object_size();

                metrics::record_upload_duration("multipart", start.elapsed().as_secs_f64());
                metrics::record_upload_success("multipart", size);
                metrics::record_multipart_parts(parts.len());
                tracing::info!(
                    upload_id = %session_ref.upload_id,
                    etag = %response.etag,
                    parts = parts.len(),
                    reused = reused,
                    duration_ms = start.elapsed().as_millis(),
                    "Completed multipart upload"
                );

                let server_side_encryption = response
                    .server_side_encryption
                    .or_else(|| session.server_side_encryption().map(str::to_string));
                Ok(UploadOutcome::Completed(CompletedUpload {
                    bucket: session_ref.bucket,
                    key: session_ref.key,
                    upload_id: Some(session_ref.upload_id),
                    etag: response.etag,
                    location: response.location,
                    size,
                    parts,
                    reused_parts: reused,
                    server_side_encryption,
                }))
            }
            Err(e) => {
                session.apply(UploadEvent::CompleteFailed)?;
                tracing::error!(error = %e, "CompleteMultipartUpload failed");
                match self.config.on_complete_failure {
                    CompleteFailurePolicy::Abort => {
                        self.fail(session, FailureReason::CompleteFailed(e), Vec::new(), start)
                            .await
                    }
                    CompleteFailurePolicy::Retain => {
                        metrics::record_upload_failure("multipart", e.kind());
                        Ok(UploadOutcome::Failed(FailedUpload {
                            session: session_ref.clone(),
                            reason: FailureReason::CompleteFailed(e),
                            failures: Vec::new(),
                            completed_parts: session.ledger().sorted(),
                            cleanup: CleanupOutcome::Retained(session_ref),
                        }))
                    }
                }
            }
        }
    }

    /// Abort the session and build the failed outcome
    async fn fail(
        &self,
        mut session: UploadSession,
        reason: FailureReason,
        failures: Vec<PartFailure>,
        start: Instant,
    ) -> Result<UploadOutcome, UploadError> {
        let kind = match &reason {
            FailureReason::PartsFailed => failures.first().map_or("parts", |f| f.cause.kind()),
            FailureReason::Cancelled => "cancelled",
            FailureReason::VerificationFailed(e) | FailureReason::CompleteFailed(e) => e.kind(),
        };
        metrics::record_upload_duration("multipart", start.elapsed().as_secs_f64());
        metrics::record_upload_failure("multipart", kind);

        session.apply(UploadEvent::BeginAbort)?;
        let session_ref = session.session_ref().clone();
        let cleanup = match self.abort(&session_ref).await {
            Ok(()) => {
                session.apply(UploadEvent::AbortSucceeded)?;
                tracing::info!(upload_id = %session_ref.upload_id, "Aborted multipart upload");
                CleanupOutcome::Aborted
            }
            Err(cause) => {
                session.apply(UploadEvent::AbortFailed)?;
                tracing::error!(
                    upload_id = %session_ref.upload_id,
                    error = %cause,
                    "Abort failed, parts may remain on the service"
                );
                CleanupOutcome::AbortFailed(CleanupError {
                    upload_id: session_ref.upload_id.clone(),
                    cause,
                })
            }
        };

        Ok(UploadOutcome::Failed(FailedUpload {
            session: session_ref,
            reason,
            failures,
            completed_parts: session.ledger().sorted(),
            cleanup,
        }))
    }

    /// Repeat a single service call while it fails transiently
    async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, S3ClientError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                result = call() => result,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    tracing::warn!(attempt = attempt, error = %e, "Service call failed, retrying");
                    self.retry.backoff(attempt, cancel).await?;
                }
                Err(e) => return Err(UploadError::from_client(e, attempt)),
            }
        }
    }
}

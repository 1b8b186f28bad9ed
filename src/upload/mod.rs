//! Upload module
//!
//! The multipart upload engine: planning, per-part transfer with integrity
//! checks and retry, coordination of one upload attempt, and resumption of
//! uploads that already hold parts on the service.
//!
//! # Outcomes
//!
//! Every attempt ends in exactly one [`UploadOutcome`]. A failed attempt
//! carries every part failure it saw together with what happened to the
//! remote upload afterwards (aborted, abort failed, or retained for the
//! caller).

use crate::s3::S3ClientError;
use serde::Serialize;
use thiserror::Error;

pub mod checksum;
pub mod coordinator;
pub mod part;
pub mod planner;
pub mod put_object;
pub mod resume;
pub mod retry;
pub mod session;
pub mod source;

pub use crate::s3::ObjectOptions as UploadOptions;
pub use coordinator::UploadCoordinator;
pub use part::PartUploader;
pub use planner::{PartPlanner, PartSpec, PlannerLimits, UploadPlan};
pub use resume::{list_uploaded_parts, list_uploaded_parts_from, reconcile, Reconciliation};
pub use retry::RetryPolicy;
pub use session::{SessionRef, UploadSession, UploadState};
pub use source::{BytesSource, DataSource, FileSource};

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Planning error: {0}")]
    PlanningError(String),

    #[error("Transient transport error after {attempts} attempt(s): {message}")]
    TransientTransportError { attempts: u32, message: String },

    #[error("Integrity check failed for part {part_number}: local MD5 {expected}, service ETag {actual}")]
    IntegrityError {
        part_number: u32,
        expected: String,
        actual: String,
    },

    #[error("Service rejected request ({status} {code}): {message}")]
    ServiceRejection {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    #[error("Malformed service response: {0}")]
    MalformedResponse(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Parts missing at completion: {0:?}")]
    IncompleteParts(Vec<u32>),

    #[error("Client error: {0}")]
    ClientError(String),
}

impl UploadError {
    /// Classify a wire-level failure after `attempts` tries
    pub fn from_client(err: S3ClientError, attempts: u32) -> Self {
        if err.is_retryable() {
            return UploadError::TransientTransportError {
                attempts,
                message: err.to_string(),
            };
        }
        match err {
            S3ClientError::ServiceError {
                status,
                code,
                message,
                request_id,
            } => UploadError::ServiceRejection {
                status,
                code,
                message,
                request_id,
            },
            S3ClientError::ResponseError(message) => UploadError::MalformedResponse(message),
            S3ClientError::ConfigError(message)
            | S3ClientError::SigningError(message)
            | S3ClientError::RequestError(message) => UploadError::ClientError(message),
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::PlanningError(_) => "planning",
            UploadError::TransientTransportError { .. } => "transient",
            UploadError::IntegrityError { .. } => "integrity",
            UploadError::ServiceRejection { .. } => "rejected",
            UploadError::MalformedResponse(_) => "malformed_response",
            UploadError::IoError(_) => "io",
            UploadError::Cancelled => "cancelled",
            UploadError::InvalidTransition(_) => "invalid_transition",
            UploadError::IncompleteParts(_) => "incomplete_parts",
            UploadError::ClientError(_) => "client",
        }
    }
}

impl From<S3ClientError> for UploadError {
    fn from(err: S3ClientError) -> Self {
        UploadError::from_client(err, 1)
    }
}

/// Abort failure that followed an earlier failure
#[derive(Error, Debug)]
#[error("Failed to abort upload {upload_id}: {cause}")]
pub struct CleanupError {
    pub upload_id: String,
    #[source]
    pub cause: UploadError,
}

/// A part accepted by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartResult {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_side_encryption: Option<String>,
}

/// A part that could not be uploaded
#[derive(Error, Debug)]
#[error("Part {part_number} failed: {cause}")]
pub struct PartFailure {
    pub part_number: u32,
    #[source]
    pub cause: UploadError,
}

/// What the caller asks to upload
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub bucket: String,
    pub key: String,
    pub options: UploadOptions,
}

impl UploadRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            options: UploadOptions::default(),
        }
    }

    pub fn with_options(mut self, options: UploadOptions) -> Self {
        self.options = options;
        self
    }
}

/// A finished upload
#[derive(Debug, Clone, Serialize)]
pub struct CompletedUpload {
    pub bucket: String,
    pub key: String,
    /// None for single-request uploads
    pub upload_id: Option<String>,
    pub etag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub size: u64,
    /// Ascending by part number
    pub parts: Vec<PartResult>,
    /// Parts found on the service and not uploaded again
    pub reused_parts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_side_encryption: Option<String>,
}

/// Why an attempt did not complete
#[derive(Debug)]
pub enum FailureReason {
    /// One or more parts failed terminally
    PartsFailed,
    /// The caller cancelled the attempt
    Cancelled,
    /// Listing before completion found parts missing or different
    VerificationFailed(UploadError),
    /// The service refused to assemble the object
    CompleteFailed(UploadError),
}

/// What happened to the remote upload after a failure
#[derive(Debug)]
pub enum CleanupOutcome {
    Aborted,
    AbortFailed(CleanupError),
    /// Left open so completion can be retried
    Retained(SessionRef),
}

/// A failed attempt
#[derive(Debug)]
pub struct FailedUpload {
    pub session: SessionRef,
    pub reason: FailureReason,
    /// Every terminal part failure, ascending by part number
    pub failures: Vec<PartFailure>,
    /// Parts the service accepted before the attempt stopped
    pub completed_parts: Vec<PartResult>,
    pub cleanup: CleanupOutcome,
}

impl FailedUpload {
    /// The part failure that stopped the attempt, if a part caused it
    pub fn first_failure(&self) -> Option<&PartFailure> {
        self.failures.first()
    }

    pub fn cleanup_failed(&self) -> bool {
        matches!(self.cleanup, CleanupOutcome::AbortFailed(_))
    }

    /// Human readable cause
    pub fn describe(&self) -> String {
        match &self.reason {
            FailureReason::PartsFailed => self
                .failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
            FailureReason::Cancelled => UploadError::Cancelled.to_string(),
            FailureReason::VerificationFailed(e) | FailureReason::CompleteFailed(e) => e.to_string(),
        }
    }
}

/// Result of one upload attempt
#[derive(Debug)]
pub enum UploadOutcome {
    Completed(CompletedUpload),
    Failed(FailedUpload),
}

impl UploadOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, UploadOutcome::Completed(_))
    }

    pub fn completed(&self) -> Option<&CompletedUpload> {
        match self {
            UploadOutcome::Completed(c) => Some(c),
            UploadOutcome::Failed(_) => None,
        }
    }

    pub fn failed(&self) -> Option<&FailedUpload> {
        match self {
            UploadOutcome::Completed(_) => None,
            UploadOutcome::Failed(f) => Some(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_client_errors() {
        let err = UploadError::from_client(
            S3ClientError::ServiceError {
                status: 503,
                code: "SlowDown".into(),
                message: "slow down".into(),
                request_id: None,
            },
            3,
        );
        assert!(matches!(
            err,
            UploadError::TransientTransportError { attempts: 3, .. }
        ));

        let err = UploadError::from(S3ClientError::RequestError("connection reset".into()));
        assert_eq!(err.kind(), "transient");
    }

    #[test]
    fn test_rejection_keeps_service_details() {
        let err = UploadError::from(S3ClientError::ServiceError {
            status: 400,
            code: "InvalidArgument".into(),
            message: "bad sse".into(),
            request_id: Some("req-1".into()),
        });
        match err {
            UploadError::ServiceRejection {
                status,
                code,
                request_id,
                ..
            } => {
                assert_eq!(status, 400);
                assert_eq!(code, "InvalidArgument");
                assert_eq!(request_id.as_deref(), Some("req-1"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_response() {
        let err = UploadError::from(S3ClientError::ResponseError("no UploadId".into()));
        assert!(matches!(err, UploadError::MalformedResponse(_)));
    }

    #[test]
    fn test_cleanup_error_display() {
        let err = CleanupError {
            upload_id: "u-1".into(),
            cause: UploadError::Cancelled,
        };
        assert_eq!(err.to_string(), "Failed to abort upload u-1: Upload cancelled");
    }

    #[test]
    fn test_failed_upload_describe() {
        let failed = FailedUpload {
            session: SessionRef::new("b", "k", "u"),
            reason: FailureReason::PartsFailed,
            failures: vec![PartFailure {
                part_number: 2,
                cause: UploadError::IncompleteParts(vec![2]),
            }],
            completed_parts: Vec::new(),
            cleanup: CleanupOutcome::Aborted,
        };
        assert!(failed.describe().starts_with("Part 2 failed"));
        assert!(!failed.cleanup_failed());
        assert_eq!(failed.first_failure().map(|f| f.part_number), Some(2));
    }
}

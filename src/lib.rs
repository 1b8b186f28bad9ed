//! Kumo Uploadr Library
//!
//! Resumable, concurrent multipart uploads to S3-compatible object storage.
//!
//! # Features
//!
//! - **Planned Parts**: Uniform part sizes within the service's part limits
//! - **Bounded Concurrency**: Parts fan out under a fixed number of permits
//! - **Integrity**: Per-part `Content-MD5` and ETag verification
//! - **Resume**: Continue an upload id by reusing parts already stored
//! - **Clean Failures**: Failed uploads are aborted and every cause is reported
//!
//! # Example
//!
//! ```no_run
//! use kumo_uploadr::config::Config;
//! use kumo_uploadr::s3::{S3Client, S3ClientConfig};
//! use kumo_uploadr::upload::{FileSource, UploadCoordinator, UploadRequest};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let client = Arc::new(S3Client::new(S3ClientConfig::from(&config.service))?);
//!     let coordinator = UploadCoordinator::from_config(client, &config);
//!
//!     let source = Arc::new(FileSource::open("backup.tar").await?);
//!     let request = UploadRequest::new("backups", "2024/backup.tar");
//!     let outcome = coordinator.run(&request, source, CancellationToken::new()).await?;
//!     println!("completed: {}", outcome.is_completed());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod metrics;
pub mod s3;
pub mod telemetry;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use upload::{UploadCoordinator, UploadError, UploadOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

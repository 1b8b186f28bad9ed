//! Kumo Uploadr - resumable multipart uploads to S3-compatible storage
//!
//! Every subcommand prints its result as JSON on stdout; logs go to stderr.

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use kumo_uploadr::config::Config;
use kumo_uploadr::metrics::textfile;
use kumo_uploadr::s3::{S3Client, S3ClientConfig};
use kumo_uploadr::telemetry;
use kumo_uploadr::upload::{
    CleanupOutcome, FileSource, PartPlanner, PlannerLimits, SessionRef, UploadCoordinator,
    UploadOptions, UploadOutcome, UploadRequest,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Kumo Uploadr - resumable multipart uploads to S3-compatible storage
#[derive(Parser, Debug)]
#[command(name = "kumo-uploadr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file, using multipart above the configured threshold
    Upload {
        bucket: String,
        key: String,
        file: PathBuf,
        #[command(flatten)]
        object: ObjectArgs,
    },
    /// Continue an interrupted multipart upload
    Resume {
        bucket: String,
        key: String,
        upload_id: String,
        file: PathBuf,
    },
    /// Abort a multipart upload and discard its parts
    Abort {
        bucket: String,
        key: String,
        upload_id: String,
    },
    /// List the parts stored for a multipart upload
    ListParts {
        bucket: String,
        key: String,
        upload_id: String,
    },
    /// Show how an object of SIZE bytes would be split into parts
    Plan { size: u64 },
}

/// Object-level settings sent when an upload starts
#[derive(ClapArgs, Debug, Default)]
struct ObjectArgs {
    #[arg(long)]
    storage_class: Option<String>,
    /// Server-side encryption algorithm, e.g. AES256
    #[arg(long)]
    sse: Option<String>,
    #[arg(long)]
    content_type: Option<String>,
    #[arg(long)]
    content_disposition: Option<String>,
    #[arg(long)]
    content_encoding: Option<String>,
    #[arg(long)]
    cache_control: Option<String>,
    /// User metadata as NAME=VALUE, repeatable
    #[arg(long = "meta", value_parser = parse_key_val)]
    metadata: Vec<(String, String)>,
}

impl From<ObjectArgs> for UploadOptions {
    fn from(args: ObjectArgs) -> Self {
        UploadOptions {
            storage_class: args.storage_class,
            server_side_encryption: args.sse,
            content_type: args.content_type,
            content_disposition: args.content_disposition,
            content_encoding: args.content_encoding,
            cache_control: args.cache_control,
            metadata: args.metadata.into_iter().collect::<BTreeMap<_, _>>(),
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    if name.is_empty() {
        return Err(format!("metadata name is empty in '{s}'"));
    }
    Ok((name.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    telemetry::init_subscriber(&config.logging)?;

    info!("Starting Kumo Uploadr v{}", kumo_uploadr::VERSION);

    let result = execute(args.command, &config).await;

    if config.metrics.enabled {
        if let Some(path) = &config.metrics.textfile {
            if let Err(e) = textfile::write(path) {
                warn!(error = %e, path = %path.display(), "Failed to write metrics textfile");
            }
        }
    }

    if !result? {
        std::process::exit(1);
    }
    Ok(())
}

/// Run one subcommand; `Ok(false)` means it ran but did not succeed
async fn execute(command: Command, config: &Config) -> anyhow::Result<bool> {
    match command {
        Command::Plan { size } => {
            print_plan(size, config)?;
            Ok(true)
        }
        Command::Upload {
            bucket,
            key,
            file,
            object,
        } => {
            let coordinator = coordinator(config)?;
            let source = Arc::new(FileSource::open(&file).await?);
            let request = UploadRequest::new(bucket, key).with_options(object.into());

            let cancel = cancel_on_interrupt();
            let outcome = coordinator.run(&request, source, cancel).await?;
            print_outcome(&outcome)?;
            Ok(outcome.is_completed())
        }
        Command::Resume {
            bucket,
            key,
            upload_id,
            file,
        } => {
            let coordinator = coordinator(config)?;
            let source = Arc::new(FileSource::open(&file).await?);
            let session = SessionRef::new(bucket, key, upload_id);

            let cancel = cancel_on_interrupt();
            let outcome = coordinator.resume(session, source, cancel).await?;
            print_outcome(&outcome)?;
            Ok(outcome.is_completed())
        }
        Command::Abort {
            bucket,
            key,
            upload_id,
        } => {
            let session = SessionRef::new(bucket, key, upload_id);
            coordinator(config)?.abort(&session).await?;
            print_json(&json!({ "status": "aborted", "session": session }))?;
            Ok(true)
        }
        Command::ListParts {
            bucket,
            key,
            upload_id,
        } => {
            let session = SessionRef::new(bucket, key, upload_id);
            let parts = coordinator(config)?.list_parts(&session).await?;
            print_json(&json!({ "session": session, "parts": parts }))?;
            Ok(true)
        }
    }
}

fn coordinator(config: &Config) -> anyhow::Result<UploadCoordinator> {
    let client = S3Client::new(S3ClientConfig::from(&config.service))?;
    Ok(UploadCoordinator::from_config(Arc::new(client), config))
}

/// Cancel the returned token on Ctrl-C
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling upload");
            token.cancel();
        }
    });
    cancel
}

fn print_plan(size: u64, config: &Config) -> anyhow::Result<()> {
    let planner = PartPlanner::new(PlannerLimits {
        min_part_size: config.upload.min_part_size,
        ..PlannerLimits::default()
    });
    let single_request = size == 0 || size < config.upload.multipart_threshold;
    if size == 0 {
        return print_json(&json!({
            "object_size": 0,
            "single_request": true,
            "part_count": 0,
            "parts": [],
        }));
    }

    let plan = planner.plan(size, config.upload.part_size, config.upload.max_parts)?;
    print_json(&json!({
        "object_size": plan.object_size(),
        "single_request": single_request || plan.is_single_part(),
        "part_size": plan.part_size(),
        "part_count": plan.part_count(),
        "parts": plan.parts(),
    }))
}

fn print_outcome(outcome: &UploadOutcome) -> anyhow::Result<()> {
    let value = match outcome {
        UploadOutcome::Completed(done) => {
            let mut value = serde_json::to_value(done)?;
            value["status"] = json!("completed");
            value
        }
        UploadOutcome::Failed(failed) => {
            let cleanup = match &failed.cleanup {
                CleanupOutcome::Aborted => json!({ "status": "aborted" }),
                CleanupOutcome::AbortFailed(e) => {
                    json!({ "status": "abort_failed", "error": e.to_string() })
                }
                CleanupOutcome::Retained(session) => {
                    json!({ "status": "retained", "session": session })
                }
            };
            let failures: Vec<_> = failed
                .failures
                .iter()
                .map(|f| json!({ "part_number": f.part_number, "error": f.cause.to_string() }))
                .collect();
            json!({
                "status": "failed",
                "session": failed.session,
                "reason": failed.describe(),
                "failures": failures,
                "completed_parts": failed.completed_parts,
                "cleanup": cleanup,
            })
        }
    };
    print_json(&value)
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("owner=ops=team").unwrap(),
            ("owner".to_string(), "ops=team".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=value").is_err());
    }

    #[test]
    fn test_cli_parses_upload() {
        let args = Args::try_parse_from([
            "kumo-uploadr",
            "upload",
            "bucket",
            "key",
            "file.bin",
            "--sse",
            "AES256",
            "--meta",
            "a=b",
        ])
        .unwrap();
        match args.command {
            Command::Upload { object, .. } => {
                let options = UploadOptions::from(object);
                assert_eq!(options.server_side_encryption.as_deref(), Some("AES256"));
                assert_eq!(options.metadata.get("a").map(String::as_str), Some("b"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

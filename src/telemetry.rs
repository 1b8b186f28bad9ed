//! Logging subscriber setup
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, else the configured level)
//!   └── Fmt Layer (text or JSON, on stderr)
//! ```
//!
//! Logs go to stderr so that command output on stdout stays machine
//! readable.
//!
//! # Example
//!
//! ```no_run
//! use kumo_uploadr::config::LoggingConfig;
//! use kumo_uploadr::telemetry::init_subscriber;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! init_subscriber(&LoggingConfig::default())?;
//! tracing::info!("logging is ready");
//! # Ok(())
//! # }
//! ```

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Subscriber setup errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    FilterError(String),

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    InitError(String),
}

/// Build the filter: RUST_LOG when set, otherwise `config.level`
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| TelemetryError::FilterError(format!("{}: {}", config.level, e))),
    }
}

/// Install the global subscriber
pub fn init_subscriber(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let env_filter = env_filter(config)?;

    let result = if config.format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_writer(std::io::stderr);
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true)
            .with_writer(std::io::stderr);
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
    };

    result.map_err(|e| TelemetryError::InitError(e.to_string()))
}

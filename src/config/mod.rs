//! Configuration module for Kumo Uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation. Every section has defaults,
//! so an empty file (or no file at all) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = env_var_pattern();
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

fn env_var_pattern() -> &'static regex_lite::Regex {
    use std::sync::OnceLock;
    static PATTERN: OnceLock<regex_lite::Regex> = OnceLock::new();
    // Regex to capture ${VAR} or ${VAR:-default}
    PATTERN.get_or_init(|| {
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}").unwrap()
    })
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(endpoint) = &self.service.endpoint {
            if !is_valid_http_url(endpoint) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid endpoint '{}': must start with http:// or https://",
                    endpoint
                )));
            }
        }

        if self.service.region.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Region cannot be empty".into(),
            ));
        }

        match self.service.header_prefix.as_str() {
            "x-amz" | "x-cos" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid header_prefix '{}': must be 'x-amz' or 'x-cos'",
                    other
                )))
            }
        }

        let upload = &self.upload;
        if upload.concurrent_parts == 0 {
            return Err(ConfigError::ValidationError(
                "concurrent_parts must be at least 1".into(),
            ));
        }
        if upload.max_parts == 0 {
            return Err(ConfigError::ValidationError(
                "max_parts must be at least 1".into(),
            ));
        }
        if upload.min_part_size == 0 {
            return Err(ConfigError::ValidationError(
                "min_part_size must be at least 1 byte".into(),
            ));
        }
        if upload.part_size < upload.min_part_size {
            return Err(ConfigError::ValidationError(format!(
                "part_size {} is below min_part_size {}",
                upload.part_size, upload.min_part_size
            )));
        }
        if upload.list_page_size == 0 || upload.list_page_size > 1000 {
            return Err(ConfigError::ValidationError(format!(
                "list_page_size {} must be between 1 and 1000",
                upload.list_page_size
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::ValidationError(
                "retry.initial_backoff_ms cannot exceed retry.max_backoff_ms".into(),
            ));
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format '{}': must be 'text' or 'json'",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// Custom deserializer for strings with environment variable expansion.
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

// ============================================================================
// Service Configuration
// ============================================================================

/// How bucket names are placed in request URLs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingStyle {
    /// `https://endpoint/bucket/key`
    #[default]
    Path,
    /// `https://bucket.endpoint/key`
    VirtualHosted,
}

/// Storage service connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service endpoint. Defaults to the AWS regional endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region", deserialize_with = "deserialize_with_env")]
    pub region: String,
    #[serde(default)]
    pub addressing_style: AddressingStyle,
    /// Vendor header prefix: `x-amz` (S3) or `x-cos` (COS)
    #[serde(default = "default_header_prefix")]
    pub header_prefix: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: default_region(),
            addressing_style: AddressingStyle::default(),
            header_prefix: default_header_prefix(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_header_prefix() -> String {
    "x-amz".to_string()
}

fn default_timeout_seconds() -> u64 {
    60
}

// ============================================================================
// Upload Configuration
// ============================================================================

/// What to do when the final complete call fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompleteFailurePolicy {
    /// Abort the upload and release stored parts
    #[default]
    Abort,
    /// Leave the upload open so the caller can retry completion
    Retain,
}

/// Multipart upload tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Objects smaller than this are sent with a single PutObject
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// Smallest part the service accepts (except the last one)
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,
    #[serde(default = "default_max_parts")]
    pub max_parts: u32,
    #[serde(default = "default_concurrent_parts")]
    pub concurrent_parts: usize,
    /// Compute and verify a per-part MD5
    #[serde(default = "default_verify_checksums")]
    pub verify_checksums: bool,
    /// List the stored parts and compare them with local results before completing
    #[serde(default)]
    pub verify_before_complete: bool,
    #[serde(default)]
    pub on_complete_failure: CompleteFailurePolicy,
    #[serde(default = "default_list_page_size")]
    pub list_page_size: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: default_multipart_threshold(),
            part_size: default_part_size(),
            min_part_size: default_min_part_size(),
            max_parts: default_max_parts(),
            concurrent_parts: default_concurrent_parts(),
            verify_checksums: default_verify_checksums(),
            verify_before_complete: false,
            on_complete_failure: CompleteFailurePolicy::default(),
            list_page_size: default_list_page_size(),
        }
    }
}

fn default_multipart_threshold() -> u64 {
    52428800 // 50MB
}

fn default_part_size() -> u64 {
    16777216 // 16MB
}

fn default_min_part_size() -> u64 {
    5242880 // 5MB
}

fn default_max_parts() -> u32 {
    10000
}

fn default_concurrent_parts() -> usize {
    4
}

fn default_verify_checksums() -> bool {
    true
}

fn default_list_page_size() -> u32 {
    1000
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry budget for every individual service call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5000
}

// ============================================================================
// Logging & Metrics
// ============================================================================

/// Log output configuration. `RUST_LOG` overrides `level` when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Write Prometheus text format here after each run
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            textfile: None,
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upload.concurrent_parts, 4);
        assert_eq!(config.upload.max_parts, 10000);
        assert!(config.upload.verify_checksums);
        assert_eq!(config.service.header_prefix, "x-amz");
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.upload.part_size, 16777216);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.service.addressing_style, AddressingStyle::Path);
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
service:
  endpoint: "https://cos.ap-guangzhou.myqcloud.com"
  region: ap-guangzhou
  addressing_style: virtual_hosted
  header_prefix: x-cos
upload:
  part_size: 20000000
  concurrent_parts: 8
  verify_checksums: false
  on_complete_failure: retain
retry:
  max_attempts: 5
logging:
  format: json
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.service.addressing_style,
            AddressingStyle::VirtualHosted
        );
        assert_eq!(config.service.header_prefix, "x-cos");
        assert_eq!(config.upload.part_size, 20_000_000);
        assert_eq!(config.upload.concurrent_parts, 8);
        assert!(!config.upload.verify_checksums);
        assert_eq!(
            config.upload.on_complete_failure,
            CompleteFailurePolicy::Retain
        );
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.upload.concurrent_parts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_part_size_below_minimum() {
        let mut config = Config::default();
        config.upload.part_size = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_endpoint() {
        let mut config = Config::default();
        config.service.endpoint = Some("localhost:9000".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_header_prefix() {
        let mut config = Config::default();
        config.service.header_prefix = "x-goog".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        assert_eq!(
            expand_env_vars("${KUMO_SURELY_UNSET_VAR:-fallback}"),
            "fallback"
        );
        assert_eq!(
            expand_env_vars("keep ${KUMO_SURELY_UNSET_VAR}"),
            "keep ${KUMO_SURELY_UNSET_VAR}"
        );
    }
}

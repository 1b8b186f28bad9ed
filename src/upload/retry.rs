//! Retry policy for transient failures
//!
//! Exponential backoff with jitter, bounded by a maximum number of attempts.
//! Sleeping between attempts is cut short by cancellation.

use super::UploadError;
use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often and how patiently to repeat a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Upper bound of the delay after the given (1-based) attempt
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Delay after the given attempt: half the base delay plus up to half
    /// again at random
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let half = base / 2;
        let jitter_ms = u64::try_from(half.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return base;
        }
        half + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    /// Sleep before the next attempt, returning early with `Cancelled`
    pub async fn backoff(
        &self,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        let delay = self.delay(attempt);
        tokio::select! {
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

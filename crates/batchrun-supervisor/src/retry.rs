//! Retry decisions and exponential backoff.

use std::time::Duration;

use batchrun_core::FailureRecord;

use crate::config::RetryConfig;

/// Decides whether a failed attempt gets another try, and when.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// True if the failure is retryable and the attempt budget is not spent.
    pub fn should_retry(&self, failure: &FailureRecord) -> bool {
        failure.category.is_retryable() && failure.attempt < self.max_attempts
    }

    /// Delay before the attempt that follows `attempt`.
    ///
    /// `base * 2^(attempt - 1)`, capped at the configured maximum.
    pub fn next_attempt_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

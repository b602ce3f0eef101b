//! Exponential backoff for table commits.
//!
//! Backoff formula: min(max_delay, base_delay * 2^attempt) + jitter
//!
//! Two budgets share one policy: concurrent write conflicts are retried a
//! bounded number of times, storage failures are retried until
//! `storage_max_attempts` (unbounded when `None`) with an alert once
//! `alert_after` consecutive failures have been seen.

use crate::config::RetryConfig;
use std::time::Duration;

/// Retry policy for commit operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts on concurrent write conflicts before the commit fails
    pub max_attempts: u32,
    /// Base delay for first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Whether to add jitter (±25%) to delays
    pub jitter: bool,
    /// Attempts on storage failures; `None` retries forever
    pub storage_max_attempts: Option<u32>,
    /// Consecutive storage failures before an alert is raised
    pub alert_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.conflict_max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
            storage_max_attempts: config.storage_max_attempts,
            alert_after: config.alert_after_attempts,
        }
    }
}

impl RetryPolicy {
    /// Zero-delay policy, used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            storage_max_attempts: Some(max_attempts),
            alert_after: max_attempts,
        }
    }

    /// Disable jitter (for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Calculate the backoff delay for a given attempt.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_delay_ms = delay_ms.min(max_ms);

        let final_delay_ms = if self.jitter && capped_delay_ms > 0 {
            let jitter_range = capped_delay_ms / 4;
            let jitter = (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64)
                % (jitter_range * 2 + 1);
            capped_delay_ms.saturating_sub(jitter_range) + jitter
        } else {
            capped_delay_ms
        };

        Duration::from_millis(final_delay_ms)
    }

    /// Whether another conflict retry is allowed after `attempts` tries.
    pub fn allows_conflict_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Whether another storage retry is allowed after `attempts` tries.
    pub fn allows_storage_retry(&self, attempts: u32) -> bool {
        self.storage_max_attempts.map_or(true, |max| attempts < max)
    }

    /// Whether `consecutive` storage failures warrant an alert.
    pub fn should_alert(&self, consecutive: u32) -> bool {
        self.alert_after > 0 && consecutive >= self.alert_after
    }
}

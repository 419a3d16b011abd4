//! Failure classification and retry scheduling.
//!
//! Shared by all stage handlers: transient failures are retried with
//! exponential backoff until the attempt ceiling forces a terminal state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error a stage handler can surface for one record.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// Network/timeout class failure; retry on a later tick
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed record or rejected request; no retry will help
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Safety governor refused the action; deferral, not a failed attempt
    #[error("safety denied: {0}")]
    Denied(String),
}

impl StageError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, StageError::Permanent(_))
    }
}

/// Retry policy for stage attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts per stage (including the first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, in seconds
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// Ceiling on the backoff delay, in seconds
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Delay multiplier applied per additional attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay_secs() -> u64 {
    600 // 10 minutes, one cron interval in the usual deployment
}
fn default_max_delay_secs() -> u64 {
    6 * 3600
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after `attempt_count` attempts have failed (1-indexed).
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        if attempt_count <= 1 {
            return Duration::from_secs(self.initial_delay_secs);
        }

        let delay = self.initial_delay_secs as f64
            * self.backoff_multiplier.powi((attempt_count - 1) as i32);

        let capped = delay.min(self.max_delay_secs as f64) as u64;
        Duration::from_secs(capped)
    }

    /// Earliest eligible time for the next attempt.
    pub fn next_attempt_at(&self, attempt_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.delay_for_attempt(attempt_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay_secs as i64))
    }

    /// Whether another attempt is allowed after `attempt_count` failures.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }
}

//! Safety governor: rate and volume limits on side-effecting actions.
//!
//! Consulted by handlers before any external dispatch, and run proactively
//! each tick to flag anomalies for operator review. A denial is a deferral,
//! re-evaluated on the next tick — never a permanent block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::domain::{EventOutcome, StageEvent};

use super::store::{RecordStore, StoreError};

/// Configured safety limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Max test requests per subject within the rolling window
    #[serde(default = "default_max_requests_per_subject")]
    pub max_requests_per_subject: u32,

    /// Rolling window for the per-subject cap, in hours
    #[serde(default = "default_subject_window_hours")]
    pub subject_window_hours: u32,

    /// Max test requests dispatched globally within one tick
    #[serde(default = "default_max_requests_per_tick")]
    pub max_requests_per_tick: u32,

    /// Per-subject daily count above which the sweep flags an anomaly
    #[serde(default = "default_anomaly_requests_per_day")]
    pub anomaly_requests_per_day: u32,
}

fn default_max_requests_per_subject() -> u32 {
    1
}
fn default_subject_window_hours() -> u32 {
    24
}
fn default_max_requests_per_tick() -> u32 {
    20
}
fn default_anomaly_requests_per_day() -> u32 {
    2
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_requests_per_subject: default_max_requests_per_subject(),
            subject_window_hours: default_subject_window_hours(),
            max_requests_per_tick: default_max_requests_per_tick(),
            anomaly_requests_per_day: default_anomaly_requests_per_day(),
        }
    }
}

/// Why the governor refused an action.
#[derive(Debug, Clone, Error)]
pub enum Denial {
    #[error("subject {subject} already has {count} request(s) in the last {window_hours}h (limit {limit})")]
    SubjectCoolDown {
        subject: String,
        count: u32,
        window_hours: u32,
        limit: u32,
    },

    #[error("global tick budget exhausted: {used} of {limit} dispatches")]
    TickBudgetExhausted { used: u32, limit: u32 },
}

/// Verdict for one proposed action.
#[derive(Debug, Clone)]
pub enum Verdict {
    Allowed,
    Denied(Denial),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Gate consulted before rate-limited external effects.
pub struct Governor {
    store: Arc<RecordStore>,
    limits: SafetyLimits,
    tick_dispatches: AtomicU32,
    /// In-flight allowances this tick, per subject. The event log only
    /// records a request after it succeeds, so concurrent same-subject
    /// dispatches within one tick must be counted here.
    tick_reservations: Mutex<HashMap<String, u32>>,
}

impl Governor {
    pub fn new(store: Arc<RecordStore>, limits: SafetyLimits) -> Self {
        Self {
            store,
            limits,
            tick_dispatches: AtomicU32::new(0),
            tick_reservations: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Reset the per-tick dispatch budget and subject reservations. Called
    /// at the top of each tick.
    pub fn begin_tick(&self) {
        self.tick_dispatches.store(0, Ordering::SeqCst);
        if let Ok(mut reservations) = self.tick_reservations.lock() {
            reservations.clear();
        }
    }

    /// Decide whether a test request for `subject_key` may fire now.
    ///
    /// Deterministic: the same window state yields the same verdict. An
    /// allowed verdict reserves one unit of the tick budget and one
    /// same-subject slot for the rest of the tick, so concurrent records
    /// for one subject get exactly one `Allowed`.
    pub fn allow_test_request(
        &self,
        subject_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Verdict, StoreError> {
        let window_start = now - Duration::hours(self.limits.subject_window_hours as i64);

        let mut reservations = self
            .tick_reservations
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        let reserved = reservations.get(subject_key).copied().unwrap_or(0);
        let in_window = self.store.subject_requests_since(subject_key, window_start)? + reserved;

        if in_window >= self.limits.max_requests_per_subject {
            return Ok(Verdict::Denied(Denial::SubjectCoolDown {
                subject: subject_key.to_string(),
                count: in_window,
                window_hours: self.limits.subject_window_hours,
                limit: self.limits.max_requests_per_subject,
            }));
        }

        // Consume a budget slot; release is unnecessary since the budget
        // resets every tick and a reserved-but-failed dispatch still spent
        // an external attempt.
        let used = self.tick_dispatches.fetch_add(1, Ordering::SeqCst);
        if used >= self.limits.max_requests_per_tick {
            return Ok(Verdict::Denied(Denial::TickBudgetExhausted {
                used,
                limit: self.limits.max_requests_per_tick,
            }));
        }

        reservations.insert(subject_key.to_string(), reserved + 1);
        Ok(Verdict::Allowed)
    }

    /// Verdict for an operator-initiated resend. Runs outside the tick
    /// loop, so only the sliding window applies; concurrent resends are
    /// race-guarded by the store's compare-and-swap on `resend_count`.
    pub fn allow_resend(
        &self,
        subject_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Verdict, StoreError> {
        let window_start = now - Duration::hours(self.limits.subject_window_hours as i64);
        let in_window = self.store.subject_requests_since(subject_key, window_start)?;

        if in_window >= self.limits.max_requests_per_subject {
            return Ok(Verdict::Denied(Denial::SubjectCoolDown {
                subject: subject_key.to_string(),
                count: in_window,
                window_hours: self.limits.subject_window_hours,
                limit: self.limits.max_requests_per_subject,
            }));
        }
        Ok(Verdict::Allowed)
    }

    /// Proactive per-tick sweep: flag subjects over the daily request cap.
    ///
    /// Flags, never blocks — anomalies are for operator review.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<StageEvent>, StoreError> {
        let since = now - Duration::hours(24);
        let over = self
            .store
            .subjects_over_request_cap(since, self.limits.anomaly_requests_per_day)?;

        let mut flagged = Vec::with_capacity(over.len());
        for (subject, count, referral_id) in over {
            warn!(%subject, count, "subject exceeded daily request cap");
            let event = self.store.append_event(StageEvent::new(
                referral_id,
                EventOutcome::AnomalyFlagged,
                format!(
                    "subject {subject} has {count} test requests in 24h (cap {})",
                    self.limits.anomaly_requests_per_day
                ),
            ))?;
            flagged.push(event);
        }
        Ok(flagged)
    }
}

//! Stage events: the append-only audit trail.
//!
//! Every transition attempt is recorded as an immutable event. The log is
//! never mutated; reminder timing and rate windows are derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::referral::Stage;

/// One entry in the append-only stage event log.
///
/// Keyed by `(referral_id, seq)`; `seq` is assigned by the store at append
/// time and is contiguous per referral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub referral_id: String,

    /// Per-referral sequence number (assigned on append)
    pub seq: u64,

    pub at: DateTime<Utc>,

    /// Stage the record was in when the attempt started
    pub from_stage: Option<Stage>,

    /// Stage the record moved to, if it moved
    pub to_stage: Option<Stage>,

    pub outcome: EventOutcome,

    /// Human-readable summary (no secrets)
    pub detail: String,

    pub error: Option<String>,
}

impl StageEvent {
    pub fn new(
        referral_id: impl Into<String>,
        outcome: EventOutcome,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            referral_id: referral_id.into(),
            seq: 0,
            at: Utc::now(),
            from_stage: None,
            to_stage: None,
            outcome,
            detail: detail.into(),
            error: None,
        }
    }

    pub fn with_transition(mut self, from: Stage, to: Stage) -> Self {
        self.from_stage = Some(from);
        self.to_stage = Some(to);
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.from_stage = Some(stage);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}

/// Outcome taxonomy for a transition attempt.
///
/// `Conflict` is deliberately absent: a lost compare-and-swap race is a
/// concurrency no-op, not an auditable outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// Row created from an inbound payload
    Created,

    /// Stage advanced
    Advanced,

    /// Recoverable failure; stage retained, retry scheduled
    TransientFailure,

    /// Unrecoverable failure; record moved to Failed
    PermanentFailure,

    /// Attempt ceiling reached; record moved to Failed
    AttemptsExhausted,

    /// Safety governor refused the action; not counted as an attempt
    SafetyDenied,

    /// A reminder threshold fired
    ReminderSent,

    /// Test link expired; record moved to Expired
    LinkExpired,

    /// Test request re-submitted on operator request
    Resent,

    /// Completion signal referenced no known referral
    SignalUnmatched,

    /// Proactive safety sweep flagged this subject for review
    AnomalyFlagged,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Created => "created",
            EventOutcome::Advanced => "advanced",
            EventOutcome::TransientFailure => "transient_failure",
            EventOutcome::PermanentFailure => "permanent_failure",
            EventOutcome::AttemptsExhausted => "attempts_exhausted",
            EventOutcome::SafetyDenied => "safety_denied",
            EventOutcome::ReminderSent => "reminder_sent",
            EventOutcome::LinkExpired => "link_expired",
            EventOutcome::Resent => "resent",
            EventOutcome::SignalUnmatched => "signal_unmatched",
            EventOutcome::AnomalyFlagged => "anomaly_flagged",
        }
    }

    pub fn parse(s: &str) -> Option<EventOutcome> {
        match s {
            "created" => Some(EventOutcome::Created),
            "advanced" => Some(EventOutcome::Advanced),
            "transient_failure" => Some(EventOutcome::TransientFailure),
            "permanent_failure" => Some(EventOutcome::PermanentFailure),
            "attempts_exhausted" => Some(EventOutcome::AttemptsExhausted),
            "safety_denied" => Some(EventOutcome::SafetyDenied),
            "reminder_sent" => Some(EventOutcome::ReminderSent),
            "link_expired" => Some(EventOutcome::LinkExpired),
            "resent" => Some(EventOutcome::Resent),
            "signal_unmatched" => Some(EventOutcome::SignalUnmatched),
            "anomaly_flagged" => Some(EventOutcome::AnomalyFlagged),
            _ => None,
        }
    }
}

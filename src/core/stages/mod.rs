//! Stage handlers: one per pipeline stage, registered in fixed order.
//!
//! A handler owns exactly one hop of the state machine. It receives a
//! record in its source stage, performs at most one external side effect,
//! and returns either the advanced record or a hold/error. Persistence is
//! the scheduler's job, through the store's compare-and-swap.

mod intake;
mod reminders;
mod reporting;
mod testing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Referral, Stage};

use super::retry::StageError;

pub use intake::{ConfirmationHandler, IntakeHandler};
pub use reminders::{ReminderPass, ReminderReport};
pub use reporting::{DeliveryHandler, ReportMonitorHandler, ReportProcessHandler};
pub use testing::{subject_info, LinkNoticeHandler, TestRequestHandler};

/// What a handler decided for one record.
#[derive(Debug)]
pub enum StageOutcome {
    /// Move the record to the contained state (stage already set)
    Advance(Box<Referral>),

    /// Nothing to do for this record yet (e.g. no completion signal);
    /// not an attempt, not an error
    Hold,
}

/// One hop of the referral state machine.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Short name, also used as the dispatch-token slot.
    fn name(&self) -> &'static str;

    /// Stage this handler pulls records from.
    fn source_stage(&self) -> Stage;

    /// Whether the handler fires an external effect that must be claimed
    /// (persisted attempt-started marker) before dispatch.
    fn has_side_effect(&self) -> bool {
        false
    }

    /// Per-tick hook, run once before any records are handled. Used by
    /// source-driven handlers to drain their inputs.
    async fn begin_tick(&self, _now: DateTime<Utc>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Process one record currently in `source_stage`.
    ///
    /// `token` is the dispatch token for this record/stage slot. A record
    /// whose `dispatch_token` is already set was claimed by an earlier,
    /// unconfirmed attempt: side-effecting handlers must follow up
    /// idempotently instead of firing blind.
    async fn handle(
        &self,
        referral: &Referral,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome, StageError>;
}

//! Reminder escalation and link expiry.
//!
//! Runs after the stage handlers each tick. Reminder timing derives from
//! `stage_entered_at` and the persisted `reminder_level`, so each threshold
//! fires at most once per record no matter how often ticks run.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::adapters::{NotificationTransport, OutboundMessage};
use crate::config::ReminderConfig;
use crate::core::store::{CasResult, RecordStore};
use crate::domain::{dispatch_token, EventOutcome, Referral, Stage, StageEvent};

/// Counts out of one reminder pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReminderReport {
    pub reminders_sent: u32,
    pub expired: u32,
}

/// Per-tick pass over dwelling records: escalate reminders, expire stale
/// links.
pub struct ReminderPass {
    store: Arc<RecordStore>,
    transport: Arc<dyn NotificationTransport>,
    config: ReminderConfig,
}

impl ReminderPass {
    pub fn new(
        store: Arc<RecordStore>,
        transport: Arc<dyn NotificationTransport>,
        config: ReminderConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> anyhow::Result<ReminderReport> {
        let mut report = ReminderReport::default();
        for stage in &self.config.stages {
            for referral in self.store.find_in_stage(*stage)? {
                let elapsed = now - referral.stage_entered_at;
                if elapsed >= Duration::hours(self.config.expiry_hours as i64) {
                    if self.expire(&referral, now).await? {
                        report.expired += 1;
                    }
                } else if self.remind(&referral, elapsed, now).await? {
                    report.reminders_sent += 1;
                }
            }
        }
        Ok(report)
    }

    /// Fire the lowest unfired threshold the record has dwelled past, if
    /// any. One threshold per record per tick.
    async fn remind(
        &self,
        referral: &Referral,
        elapsed: Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let level = referral.reminder_level as usize;
        let due = match self.config.thresholds_hours.get(level) {
            Some(threshold) if elapsed >= Duration::hours(*threshold as i64) => *threshold,
            _ => return Ok(false),
        };
        let recipient = match referral.patient_email.clone() {
            Some(email) => email,
            None => return Ok(false),
        };

        // The token is keyed by level, so a crash between send and persist
        // re-sends under the same token and the transport deduplicates.
        let message = OutboundMessage {
            recipient,
            subject: reminder_subject(level),
            body: reminder_body(referral, level, due),
            attachment: None,
            idempotency_token: dispatch_token(&referral.id, &format!("reminder-{level}")),
        };
        if let Err(e) = self.transport.send(&message).await {
            warn!(referral_id = %referral.id, error = %e, "reminder send failed, will retry");
            return Ok(false);
        }

        let mut updated = referral.clone();
        updated.reminder_level = referral.reminder_level + 1;
        // Guarded on the stale reminder_level: when two passes race, one
        // escalation applies and one conflicts, so the threshold is
        // recorded exactly once.
        let applied = self.store.compare_and_swap(&updated, referral)?;
        if applied != CasResult::Applied {
            return Ok(false);
        }

        self.store.append_event(
            StageEvent::new(
                &referral.id,
                EventOutcome::ReminderSent,
                format!("reminder level {level} fired after {due}h in stage"),
            )
            .with_stage(referral.stage)
            .occurred_at(now),
        )?;
        info!(referral_id = %referral.id, level, "reminder sent");
        Ok(true)
    }

    /// Expire a record whose link outlived its validity, with a final
    /// notice to the patient.
    async fn expire(&self, referral: &Referral, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let expired = referral.advanced_to(Stage::Expired, now);
        let applied = self.store.compare_and_swap(&expired, referral)?;
        if applied != CasResult::Applied {
            return Ok(false);
        }

        self.store.append_event(
            StageEvent::new(
                &referral.id,
                EventOutcome::LinkExpired,
                format!("link expired after {}h without completion", self.config.expiry_hours),
            )
            .with_transition(referral.stage, Stage::Expired)
            .occurred_at(now),
        )?;
        warn!(referral_id = %referral.id, "referral expired without completion");

        // Final notice is best effort; the expiry already took.
        if let Some(recipient) = referral.patient_email.clone() {
            let message = OutboundMessage {
                recipient,
                subject: "Your test link has expired".to_string(),
                body: expiry_body(referral),
                attachment: None,
                idempotency_token: dispatch_token(&referral.id, "expiry"),
            };
            if let Err(e) = self.transport.send(&message).await {
                warn!(referral_id = %referral.id, error = %e, "expiry notice send failed");
            }
        }
        Ok(true)
    }
}

fn reminder_subject(level: usize) -> String {
    match level {
        0 => "Reminder: your test is waiting".to_string(),
        1 => "Second reminder: your test is waiting".to_string(),
        _ => "Final reminder: your test link expires soon".to_string(),
    }
}

fn reminder_body(referral: &Referral, level: usize, due_hours: u32) -> String {
    let link = referral
        .test_link
        .as_deref()
        .unwrap_or("the link you were sent");
    let urgency = if level >= 2 {
        "This is the final reminder before the link expires."
    } else {
        "Please complete it at your earliest convenience."
    };
    format!(
        "Your requested test has been waiting for {due_hours} hours.\n\n\
         {urgency}\n\n\
         Test: {link}\n"
    )
}

fn expiry_body(referral: &Referral) -> String {
    format!(
        "The test link issued for you was not used within its validity\n\
         period and has now expired. Please contact your referrer if the\n\
         test is still needed.\n\n\
         Reference: {}\n",
        referral.id
    )
}

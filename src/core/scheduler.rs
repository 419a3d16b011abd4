//! Tick scheduler: drives every record one hop forward per tick.
//!
//! One tick walks the stage handlers in pipeline order, so a record that
//! keeps succeeding hops through several stages within a single tick. Each
//! record is processed in isolation; a failure there becomes a retry or a
//! terminal transition for that record, never an aborted tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    AutomationService, CompletionSignalSource, IntakeSource, NotificationTransport, ReportRenderer,
};
use crate::config::Config;
use crate::domain::{dispatch_token, EventOutcome, Referral, Stage, StageEvent};

use super::retry::{RetryPolicy, StageError};
use super::safety::{Governor, Verdict};
use super::stages::{
    ConfirmationHandler, DeliveryHandler, IntakeHandler, LinkNoticeHandler, ReminderPass,
    ReportMonitorHandler, ReportProcessHandler, StageHandler, StageOutcome, TestRequestHandler,
};
use super::store::{CasResult, ClaimOutcome, RecordStore};

/// External collaborators injected into the scheduler. Tests substitute
/// in-memory fakes.
pub struct Collaborators {
    pub intake: Arc<dyn IntakeSource>,
    pub automation: Arc<dyn AutomationService>,
    pub signals: Arc<dyn CompletionSignalSource>,
    pub renderer: Arc<dyn ReportRenderer>,
    pub transport: Arc<dyn NotificationTransport>,
}

/// Summary of one tick, for logging and exit-status decisions.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    pub examined: u32,
    pub advanced: u32,
    pub held: u32,
    pub retried: u32,
    pub denied: u32,
    pub conflicts: u32,
    pub failed: u32,
    pub expired: u32,
    pub store_errors: u32,
    pub reminders_sent: u32,
    pub anomalies_flagged: u32,
}

impl TickReport {
    /// Whether any record reached a terminal failure state this tick.
    pub fn had_terminal_failures(&self) -> bool {
        self.failed > 0 || self.expired > 0
    }
}

/// What happened to one record within one handler pass.
#[derive(Debug)]
enum RecordOutcome {
    Advanced { terminal: bool },
    Held,
    Retried,
    Denied,
    Conflict,
    Failed,
    StoreError,
}

pub struct Scheduler {
    config: Config,
    store: Arc<RecordStore>,
    governor: Arc<Governor>,
    automation: Arc<dyn AutomationService>,
    handlers: Vec<Arc<dyn StageHandler>>,
    reminders: ReminderPass,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(config: Config, store: Arc<RecordStore>, collaborators: Collaborators) -> Self {
        let governor = Arc::new(Governor::new(store.clone(), config.safety.clone()));

        let handlers: Vec<Arc<dyn StageHandler>> = vec![
            Arc::new(IntakeHandler::new(
                store.clone(),
                collaborators.intake,
                config.intake_batch,
            )),
            Arc::new(ConfirmationHandler::new(collaborators.transport.clone())),
            Arc::new(TestRequestHandler::new(
                governor.clone(),
                collaborators.automation.clone(),
            )),
            Arc::new(LinkNoticeHandler::new(collaborators.transport.clone())),
            Arc::new(ReportMonitorHandler::new(
                store.clone(),
                collaborators.signals,
                config.signal_batch,
            )),
            Arc::new(ReportProcessHandler::new(
                collaborators.renderer,
                config.reports_path(),
            )),
            Arc::new(DeliveryHandler::new(collaborators.transport.clone())),
        ];

        let reminders = ReminderPass::new(
            store.clone(),
            collaborators.transport,
            config.reminders.clone(),
        );

        Self {
            config,
            store,
            governor,
            automation: collaborators.automation,
            handlers,
            reminders,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between records; a set flag finishes the current record
    /// and stops.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn store(&self) -> Arc<RecordStore> {
        self.store.clone()
    }

    /// Run one full tick: stage handlers in pipeline order, then the
    /// reminder pass, then the safety sweep.
    #[instrument(skip_all, fields(tick_id))]
    pub async fn run_tick(&self, now: DateTime<Utc>) -> anyhow::Result<TickReport> {
        let tick_id = Uuid::new_v4();
        tracing::Span::current().record("tick_id", tick_id.to_string());
        debug!(%tick_id, "tick starting");

        self.governor.begin_tick();
        let mut report = TickReport::default();

        for handler in &self.handlers {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("shutdown requested, stopping tick early");
                break;
            }
            if !self.config.stage_enabled(handler.source_stage()) {
                info!(stage = handler.source_stage().as_str(), "stage disabled, skipping");
                continue;
            }

            if let Err(e) = handler.begin_tick(now).await {
                // Source drain failure costs this tick's input, not the tick.
                warn!(handler = handler.name(), error = %e, "per-tick drain failed");
            }

            let eligible = self.store.find_eligible(handler.source_stage(), now)?;
            if eligible.is_empty() {
                continue;
            }
            debug!(
                handler = handler.name(),
                count = eligible.len(),
                "processing eligible records"
            );

            let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
            let mut tasks = JoinSet::new();
            for referral in eligible {
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                report.examined += 1;
                let permit = semaphore.clone().acquire_owned().await?;
                let handler = handler.clone();
                let store = self.store.clone();
                let retry = self.config.retry.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    process_record(store, handler, retry, referral, now).await
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => absorb(&mut report, outcome),
                    Err(e) => error!(error = %e, "record task panicked"),
                }
            }
        }

        match self.reminders.run(now).await {
            Ok(reminder_report) => {
                report.reminders_sent += reminder_report.reminders_sent;
                report.expired += reminder_report.expired;
            }
            Err(e) => warn!(error = %e, "reminder pass failed"),
        }

        match self.governor.sweep(now) {
            Ok(flagged) => report.anomalies_flagged += flagged.len() as u32,
            Err(e) => warn!(error = %e, "safety sweep failed"),
        }

        info!(
            examined = report.examined,
            advanced = report.advanced,
            held = report.held,
            retried = report.retried,
            denied = report.denied,
            conflicts = report.conflicts,
            failed = report.failed,
            expired = report.expired,
            store_errors = report.store_errors,
            reminders = report.reminders_sent,
            anomalies = report.anomalies_flagged,
            "tick complete"
        );
        Ok(report)
    }

    /// Operator-initiated re-dispatch of a test request whose link went
    /// unused. Honors the same safety limits as the automatic path.
    pub async fn resend_test_request(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Referral> {
        let referral = self
            .store
            .get(referral_id)?
            .ok_or_else(|| anyhow::anyhow!("no referral with id {referral_id}"))?;

        if !matches!(referral.stage, Stage::TestRequested | Stage::AwaitingReport) {
            anyhow::bail!(
                "referral {} is in stage {}, nothing outstanding to resend",
                referral.id,
                referral.stage.as_str()
            );
        }

        let last_issued = referral
            .last_resent_at
            .or(referral.test_requested_at)
            .unwrap_or(referral.stage_entered_at);
        let age_hours = (now - last_issued).num_hours();
        if age_hours < self.config.resend_min_age_hours as i64 {
            anyhow::bail!(
                "link issued {age_hours}h ago, resend allowed after {}h",
                self.config.resend_min_age_hours
            );
        }

        match self.governor.allow_resend(&referral.subject_key, now)? {
            Verdict::Allowed => {}
            Verdict::Denied(denial) => anyhow::bail!("resend denied: {denial}"),
        }

        let subject =
            super::stages::subject_info(&referral).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let receipt = self
            .automation
            .submit_test_request(&subject)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let mut updated = referral.clone();
        updated.resend_count = referral.resend_count + 1;
        updated.last_resent_at = Some(now);
        updated.request_receipt = Some(receipt.reference.clone());
        updated.test_link = receipt.test_link;
        if self.store.compare_and_swap(&updated, &referral)? != CasResult::Applied
        {
            anyhow::bail!("referral {} changed concurrently, resend not recorded", referral.id);
        }

        self.store.append_event(
            StageEvent::new(
                &referral.id,
                EventOutcome::Resent,
                format!("test request re-dispatched, reference {}", receipt.reference),
            )
            .with_stage(referral.stage)
            .occurred_at(now),
        )?;
        info!(referral_id = %referral.id, "test request resent");
        Ok(updated)
    }
}

fn absorb(report: &mut TickReport, outcome: RecordOutcome) {
    match outcome {
        RecordOutcome::Advanced { terminal } => {
            report.advanced += 1;
            if terminal {
                report.failed += 1;
            }
        }
        RecordOutcome::Held => report.held += 1,
        RecordOutcome::Retried => report.retried += 1,
        RecordOutcome::Denied => report.denied += 1,
        RecordOutcome::Conflict => report.conflicts += 1,
        RecordOutcome::Failed => report.failed += 1,
        // A store error means no transition happened; it is not a terminal
        // record failure.
        RecordOutcome::StoreError => report.store_errors += 1,
    }
}

/// Advance one record through one handler: claim (if the handler fires an
/// external effect), handle, persist through compare-and-swap.
async fn process_record(
    store: Arc<RecordStore>,
    handler: Arc<dyn StageHandler>,
    retry: RetryPolicy,
    referral: Referral,
    now: DateTime<Utc>,
) -> RecordOutcome {
    let token = dispatch_token(&referral.id, handler.name());
    let current = referral;

    // A fresh claim is recorded in the store but kept off the in-memory
    // snapshot: the handler distinguishes a first dispatch (token unset)
    // from a recovered one (token set by a prior unconfirmed attempt).
    let mut fresh_claim = None;
    if handler.has_side_effect() {
        match store.claim_dispatch(&current, &token, now) {
            Ok(ClaimOutcome::Claimed(claimed)) => fresh_claim = Some(claimed),
            Ok(ClaimOutcome::AlreadyClaimed(_)) => {}
            Ok(ClaimOutcome::Conflict) => {
                debug!(referral_id = %current.id, "dispatch claimed concurrently, skipping");
                return RecordOutcome::Conflict;
            }
            Err(e) => {
                error!(referral_id = %current.id, error = %e, "claim failed");
                return RecordOutcome::StoreError;
            }
        }
    }
    let effective_token = current.dispatch_token.clone().unwrap_or(token);

    match handler.handle(&current, &effective_token, now).await {
        Ok(StageOutcome::Advance(updated)) => {
            persist_advance(&store, handler.name(), &current, *updated, now)
        }
        Ok(StageOutcome::Hold) => RecordOutcome::Held,
        Err(StageError::Denied(reason)) => {
            // A denial is a deferral: no attempt consumed, stage retained.
            // Nothing fired under a fresh claim, so the token must not
            // survive to read as an unconfirmed dispatch later.
            if let Some(claimed) = fresh_claim {
                if let Err(e) = store.release_dispatch(&current.id, &claimed) {
                    error!(referral_id = %current.id, error = %e, "failed to release claim");
                    return RecordOutcome::StoreError;
                }
            }
            debug!(referral_id = %current.id, %reason, "dispatch denied by governor");
            let event = StageEvent::new(&current.id, EventOutcome::SafetyDenied, reason)
                .with_stage(current.stage)
                .occurred_at(now);
            if let Err(e) = store.append_event(event) {
                error!(referral_id = %current.id, error = %e, "failed to record denial");
            }
            RecordOutcome::Denied
        }
        Err(err) => persist_failure(&store, &retry, &current, fresh_claim, err, now),
    }
}

fn persist_advance(
    store: &RecordStore,
    handler_name: &str,
    current: &Referral,
    updated: Referral,
    now: DateTime<Utc>,
) -> RecordOutcome {
    match store.compare_and_swap(&updated, current) {
        Ok(CasResult::Applied) => {
            let event = StageEvent::new(
                &current.id,
                EventOutcome::Advanced,
                format!("{handler_name} completed"),
            )
            .with_transition(current.stage, updated.stage)
            .occurred_at(now);
            if let Err(e) = store.append_event(event) {
                error!(referral_id = %current.id, error = %e, "failed to record advance");
            }
            info!(
                referral_id = %current.id,
                from = current.stage.as_str(),
                to = updated.stage.as_str(),
                "record advanced"
            );
            RecordOutcome::Advanced {
                terminal: updated.stage == Stage::Failed,
            }
        }
        Ok(CasResult::Conflict) => {
            debug!(referral_id = %current.id, "lost transition race, skipping");
            RecordOutcome::Conflict
        }
        Err(e) => {
            error!(referral_id = %current.id, error = %e, "persisting advance failed");
            RecordOutcome::StoreError
        }
    }
}

fn persist_failure(
    store: &RecordStore,
    retry: &RetryPolicy,
    current: &Referral,
    fresh_claim: Option<String>,
    err: StageError,
    now: DateTime<Utc>,
) -> RecordOutcome {
    let attempts = current.attempt_count + 1;
    let permanent = err.is_permanent();
    let exhausted = !permanent && !retry.should_retry(attempts);

    if permanent || exhausted {
        let mut failed = current.advanced_to(Stage::Failed, now);
        failed.last_error = Some(err.to_string());
        let outcome = if permanent {
            EventOutcome::PermanentFailure
        } else {
            EventOutcome::AttemptsExhausted
        };
        match store.compare_and_swap(&failed, current) {
            Ok(CasResult::Applied) => {
                let detail = if permanent {
                    "permanent failure".to_string()
                } else {
                    format!("retries exhausted after {attempts} attempts")
                };
                let event = StageEvent::new(&current.id, outcome, detail)
                    .with_transition(current.stage, Stage::Failed)
                    .with_error(err.to_string())
                    .occurred_at(now);
                if let Err(e) = store.append_event(event) {
                    error!(referral_id = %current.id, error = %e, "failed to record failure");
                }
                warn!(referral_id = %current.id, error = %err, "record failed terminally");
                RecordOutcome::Failed
            }
            Ok(CasResult::Conflict) => RecordOutcome::Conflict,
            Err(e) => {
                error!(referral_id = %current.id, error = %e, "persisting failure failed");
                RecordOutcome::StoreError
            }
        }
    } else {
        let mut held = current.clone();
        held.attempt_count = attempts;
        held.next_attempt_at = Some(retry.next_attempt_at(attempts, now));
        held.last_error = Some(err.to_string());
        // The retry row must carry the claim; dropping it here would let the
        // next attempt fire blind instead of following up under the token.
        if let Some(token) = fresh_claim {
            held.dispatch_token = Some(token);
            held.dispatch_started_at = Some(now);
        }
        match store.compare_and_swap(&held, current) {
            Ok(CasResult::Applied) => {
                let event = StageEvent::new(
                    &current.id,
                    EventOutcome::TransientFailure,
                    format!("attempt {attempts} failed, backing off"),
                )
                .with_stage(current.stage)
                .with_error(err.to_string())
                .occurred_at(now);
                if let Err(e) = store.append_event(event) {
                    error!(referral_id = %current.id, error = %e, "failed to record retry");
                }
                debug!(
                    referral_id = %current.id,
                    attempts,
                    error = %err,
                    "transient failure, will retry"
                );
                RecordOutcome::Retried
            }
            Ok(CasResult::Conflict) => RecordOutcome::Conflict,
            Err(e) => {
                error!(referral_id = %current.id, error = %e, "persisting retry failed");
                RecordOutcome::StoreError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_not_terminal_failures() {
        let mut report = TickReport::default();
        absorb(&mut report, RecordOutcome::StoreError);

        assert_eq!(report.store_errors, 1);
        assert_eq!(report.failed, 0);
        assert!(!report.had_terminal_failures());

        absorb(&mut report, RecordOutcome::Failed);
        assert_eq!(report.failed, 1);
        assert!(report.had_terminal_failures());
    }
}

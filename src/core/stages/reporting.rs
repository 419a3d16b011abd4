//! Report path: match completion signals, render the raw report, deliver
//! the processed result to the referrer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::{
    CompletionSignal, CompletionSignalSource, NotificationTransport, OutboundMessage,
    ReportRenderer,
};
use crate::core::retry::StageError;
use crate::core::store::RecordStore;
use crate::domain::{EventOutcome, Referral, Stage, StageEvent};

use super::intake::map_transport;
use super::{StageHandler, StageOutcome};

/// Matches completion signals to records awaiting a report.
///
/// Signals are drained once per tick. A signal naming an unknown referral is
/// flagged and left un-acked for manual reconciliation; it must never be
/// silently dropped.
pub struct ReportMonitorHandler {
    store: Arc<RecordStore>,
    source: Arc<dyn CompletionSignalSource>,
    batch: usize,
    pending: Mutex<HashMap<String, CompletionSignal>>,
}

impl ReportMonitorHandler {
    pub fn new(
        store: Arc<RecordStore>,
        source: Arc<dyn CompletionSignalSource>,
        batch: usize,
    ) -> Self {
        Self {
            store,
            source,
            batch,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn already_flagged(&self, referral_id: &str, signal_id: &str) -> bool {
        match self.store.events_for(referral_id) {
            Ok(events) => events.iter().any(|e| {
                e.outcome == EventOutcome::SignalUnmatched && e.detail.contains(signal_id)
            }),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl StageHandler for ReportMonitorHandler {
    fn name(&self) -> &'static str {
        "report_monitor"
    }

    fn source_stage(&self) -> Stage {
        Stage::AwaitingReport
    }

    async fn begin_tick(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let signals = self.source.poll(self.batch).await?;
        if signals.is_empty() {
            return Ok(());
        }
        debug!(count = signals.len(), "drained completion signals");

        let mut pending = self.pending.lock().await;
        for signal in signals {
            match self.store.get(&signal.referral_id)? {
                Some(_) => {
                    pending.insert(signal.referral_id.clone(), signal);
                }
                None => {
                    warn!(
                        signal_id = %signal.signal_id,
                        referral_id = %signal.referral_id,
                        "completion signal matches no known referral"
                    );
                    if !self.already_flagged(&signal.referral_id, &signal.signal_id) {
                        self.store.append_event(
                            StageEvent::new(
                                &signal.referral_id,
                                EventOutcome::SignalUnmatched,
                                format!(
                                    "signal {} names unknown referral, left for reconciliation",
                                    signal.signal_id
                                ),
                            )
                            .occurred_at(now),
                        )?;
                    }
                    // Left un-acked; the source will yield it again.
                }
            }
        }
        Ok(())
    }

    async fn handle(
        &self,
        referral: &Referral,
        _token: &str,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome, StageError> {
        let signal = match self.pending.lock().await.remove(&referral.id) {
            Some(signal) => signal,
            None => return Ok(StageOutcome::Hold),
        };

        // Ack first: if the transition below loses its race, the winner
        // recorded the same report and the signal is already consumed.
        self.source
            .ack(&signal.signal_id)
            .await
            .map_err(|e| StageError::Transient(e.to_string()))?;
        info!(
            referral_id = %referral.id,
            report_ref = %signal.report_ref,
            "report completion detected"
        );

        let mut updated = referral.advanced_to(Stage::ReportDetected, now);
        updated.report_ref = Some(signal.report_ref);
        updated.report_detected_at = Some(now);
        Ok(StageOutcome::Advance(Box::new(updated)))
    }
}

/// Renders the raw report into its processed form and writes it out.
///
/// The renderer is pure and the output path is keyed by referral id, so a
/// replay overwrites with identical bytes.
pub struct ReportProcessHandler {
    renderer: Arc<dyn ReportRenderer>,
    reports_dir: PathBuf,
}

impl ReportProcessHandler {
    pub fn new(renderer: Arc<dyn ReportRenderer>, reports_dir: PathBuf) -> Self {
        Self {
            renderer,
            reports_dir,
        }
    }
}

#[async_trait]
impl StageHandler for ReportProcessHandler {
    fn name(&self) -> &'static str {
        "report_process"
    }

    fn source_stage(&self) -> Stage {
        Stage::ReportDetected
    }

    async fn handle(
        &self,
        referral: &Referral,
        _token: &str,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome, StageError> {
        let report_ref = referral
            .report_ref
            .as_deref()
            .ok_or_else(|| StageError::Permanent("record has no report reference".to_string()))?;

        // The artifact may lag the signal (slow sync); treat a read failure
        // as retryable.
        let raw = tokio::fs::read(Path::new(report_ref))
            .await
            .map_err(|e| StageError::Transient(format!("reading {report_ref}: {e}")))?;

        let processed = self
            .renderer
            .process(&raw)
            .map_err(|e| StageError::Permanent(e.to_string()))?;

        tokio::fs::create_dir_all(&self.reports_dir)
            .await
            .map_err(|e| StageError::Transient(e.to_string()))?;
        let out_path = self.reports_dir.join(format!("{}.md", referral.id));
        tokio::fs::write(&out_path, processed.content.as_bytes())
            .await
            .map_err(|e| StageError::Transient(e.to_string()))?;
        info!(
            referral_id = %referral.id,
            path = %out_path.display(),
            digest = %processed.digest,
            "report processed"
        );

        let mut updated = referral.advanced_to(Stage::ReportProcessed, now);
        updated.processed_report_path = Some(out_path.to_string_lossy().into_owned());
        updated.processed_report_digest = Some(processed.digest);
        updated.report_processed_at = Some(now);
        Ok(StageOutcome::Advance(Box::new(updated)))
    }
}

/// Delivers the processed report to the referrer.
pub struct DeliveryHandler {
    transport: Arc<dyn NotificationTransport>,
}

impl DeliveryHandler {
    pub fn new(transport: Arc<dyn NotificationTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl StageHandler for DeliveryHandler {
    fn name(&self) -> &'static str {
        "delivery"
    }

    fn source_stage(&self) -> Stage {
        Stage::ReportProcessed
    }

    fn has_side_effect(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        referral: &Referral,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome, StageError> {
        let recipient = referral
            .referrer_email
            .clone()
            .ok_or_else(|| StageError::Permanent("referrer email missing".to_string()))?;
        let attachment = referral
            .processed_report_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| StageError::Permanent("record has no processed report".to_string()))?;

        let message = OutboundMessage {
            recipient,
            subject: format!("Report ready: {}", referral.raw_subject),
            body: delivery_body(referral),
            attachment: Some(attachment),
            idempotency_token: token.to_string(),
        };
        let confirmation = self.transport.send(&message).await.map_err(map_transport)?;
        info!(
            referral_id = %referral.id,
            confirmation_id = %confirmation.confirmation_id,
            "report delivered to referrer"
        );

        let mut updated = referral.advanced_to(Stage::Delivered, now);
        updated.delivered_at = Some(now);
        Ok(StageOutcome::Advance(Box::new(updated)))
    }
}

fn delivery_body(referral: &Referral) -> String {
    let name = referral.referrer_name.as_deref().unwrap_or("colleague");
    format!(
        "Dear {name},\n\n\
         The requested report is attached.\n\n\
         Reference: {}\n",
        referral.id
    )
}

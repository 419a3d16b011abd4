//! Intake and confirmation: pull inbound payloads in, acknowledge the
//! referrer once the record is validated.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::adapters::{IntakeSource, NotificationTransport, OutboundMessage, TransportError};
use crate::core::retry::StageError;
use crate::core::store::RecordStore;
use crate::domain::{EventOutcome, Referral, Stage, StageEvent};

use super::{StageHandler, StageOutcome};

/// Drains the intake source into the store, then validates `New` records.
///
/// Duplicate payloads (same natural key) collapse onto the existing row and
/// are acknowledged without a second record or event.
pub struct IntakeHandler {
    store: Arc<RecordStore>,
    source: Arc<dyn IntakeSource>,
    batch: usize,
}

impl IntakeHandler {
    pub fn new(store: Arc<RecordStore>, source: Arc<dyn IntakeSource>, batch: usize) -> Self {
        Self {
            store,
            source,
            batch,
        }
    }
}

#[async_trait]
impl StageHandler for IntakeHandler {
    fn name(&self) -> &'static str {
        "intake"
    }

    fn source_stage(&self) -> Stage {
        Stage::New
    }

    async fn begin_tick(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let payloads = self.source.fetch(self.batch).await?;
        if payloads.is_empty() {
            return Ok(());
        }
        info!(count = payloads.len(), "draining inbound referrals");

        for payload in payloads {
            let outcome = self.store.upsert_inbound(&payload)?;
            if outcome.is_new() {
                self.store.append_event(
                    StageEvent::new(
                        outcome.id(),
                        EventOutcome::Created,
                        format!("referral created from message {}", payload.message_id),
                    )
                    .with_stage(Stage::New)
                    .occurred_at(now),
                )?;
                info!(referral_id = outcome.id(), "new referral recorded");
            } else {
                debug!(
                    referral_id = outcome.id(),
                    message_id = %payload.message_id,
                    "duplicate inbound payload, already recorded"
                );
            }
            // Ack only after the row is durable; a crash before this point
            // re-yields the payload and the upsert collapses it.
            self.source.ack(&payload.message_id).await?;
        }
        Ok(())
    }

    async fn handle(
        &self,
        referral: &Referral,
        _token: &str,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome, StageError> {
        if referral.patient_email.is_none() && referral.patient_mobile.is_none() {
            return Err(StageError::Permanent(
                "payload has no patient contact (email or mobile)".to_string(),
            ));
        }
        if referral.referrer_email.is_none() {
            return Err(StageError::Permanent(
                "payload has no referrer email".to_string(),
            ));
        }
        Ok(StageOutcome::Advance(Box::new(
            referral.advanced_to(Stage::Intake, now),
        )))
    }
}

/// Sends the referrer a receipt confirmation for a validated referral.
pub struct ConfirmationHandler {
    transport: Arc<dyn NotificationTransport>,
}

impl ConfirmationHandler {
    pub fn new(transport: Arc<dyn NotificationTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl StageHandler for ConfirmationHandler {
    fn name(&self) -> &'static str {
        "confirm"
    }

    fn source_stage(&self) -> Stage {
        Stage::Intake
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

        if referral.dispatch_token.is_some() {
            warn!(
                referral_id = %referral.id,
                "re-dispatching confirmation under the prior token"
            );
        }

        let message = OutboundMessage {
            recipient,
            subject: format!("Referral received: {}", referral.raw_subject),
            body: confirmation_body(referral),
            attachment: None,
            idempotency_token: token.to_string(),
        };
        let confirmation = self.transport.send(&message).await.map_err(map_transport)?;
        debug!(
            referral_id = %referral.id,
            confirmation_id = %confirmation.confirmation_id,
            "referrer confirmation accepted"
        );

        let mut updated = referral.advanced_to(Stage::AwaitingTest, now);
        updated.confirmed_at = Some(now);
        Ok(StageOutcome::Advance(Box::new(updated)))
    }
}

pub(super) fn map_transport(err: TransportError) -> StageError {
    match err {
        TransportError::Transient(msg) => StageError::Transient(msg),
        TransportError::Permanent(msg) => StageError::Permanent(msg),
    }
}

fn confirmation_body(referral: &Referral) -> String {
    let name = referral.referrer_name.as_deref().unwrap_or("colleague");
    format!(
        "Dear {name},\n\n\
         We have received your referral and will arrange the requested test.\n\
         You will receive the report automatically once it is available.\n\n\
         Reference: {}\n",
        referral.id
    )
}

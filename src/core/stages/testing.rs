//! Test dispatch: submit the test request through the automation service
//! and notify the patient of the issued link.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::adapters::{
    AutomationError, AutomationService, NotificationTransport, OutboundMessage, RequestReceipt,
    SubjectInfo,
};
use crate::core::retry::StageError;
use crate::core::safety::{Governor, Verdict};
use crate::domain::{Referral, Stage};

use super::intake::map_transport;
use super::{StageHandler, StageOutcome};

/// Fallback when the referrer supplied no date of birth; the automation
/// form requires a year.
const DEFAULT_DOB_YEAR: &str = "2000";

/// Submits the test request for records awaiting one.
///
/// Checks the safety governor before anything fires. A record claimed by an
/// earlier unconfirmed attempt is looked up on the service first, so a crash
/// between claim and persist never produces a second request.
pub struct TestRequestHandler {
    governor: Arc<Governor>,
    automation: Arc<dyn AutomationService>,
}

impl TestRequestHandler {
    pub fn new(governor: Arc<Governor>, automation: Arc<dyn AutomationService>) -> Self {
        Self {
            governor,
            automation,
        }
    }
}

/// Subject details the automation form needs, pulled off the record.
pub fn subject_info(referral: &Referral) -> Result<SubjectInfo, StageError> {
    let email = referral
        .patient_email
        .clone()
        .ok_or_else(|| StageError::Permanent("patient email missing".to_string()))?;
    Ok(SubjectInfo {
        subject_key: referral.subject_key.clone(),
        email,
        dob_year: referral
            .dob_year()
            .unwrap_or_else(|| DEFAULT_DOB_YEAR.to_string()),
    })
}

pub(super) fn map_automation(err: AutomationError) -> StageError {
    match err {
        AutomationError::Transient(msg) => StageError::Transient(msg),
        AutomationError::Permanent(msg) => StageError::Permanent(msg),
    }
}

#[async_trait]
impl StageHandler for TestRequestHandler {
    fn name(&self) -> &'static str {
        "test_request"
    }

    fn source_stage(&self) -> Stage {
        Stage::AwaitingTest
    }

    fn has_side_effect(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        referral: &Referral,
        _token: &str,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome, StageError> {
        match self
            .governor
            .allow_test_request(&referral.subject_key, now)
            .map_err(|e| StageError::Transient(e.to_string()))?
        {
            Verdict::Allowed => {}
            Verdict::Denied(denial) => return Err(StageError::Denied(denial.to_string())),
        }

        let subject = subject_info(referral)?;

        // A set token means a prior attempt may have reached the service.
        let receipt = if referral.dispatch_token.is_some() {
            match self
                .automation
                .find_request(&subject)
                .await
                .map_err(map_automation)?
            {
                Some(existing) => {
                    info!(
                        referral_id = %referral.id,
                        reference = %existing.reference,
                        "recovered test request from an unconfirmed dispatch"
                    );
                    existing
                }
                None => self.submit(&subject, referral).await?,
            }
        } else {
            self.submit(&subject, referral).await?
        };

        let mut updated = referral.advanced_to(Stage::TestRequested, now);
        updated.test_requested_at = Some(now);
        updated.request_receipt = Some(receipt.reference);
        updated.test_link = receipt.test_link;
        Ok(StageOutcome::Advance(Box::new(updated)))
    }
}

impl TestRequestHandler {
    async fn submit(
        &self,
        subject: &SubjectInfo,
        referral: &Referral,
    ) -> Result<RequestReceipt, StageError> {
        let receipt = self
            .automation
            .submit_test_request(subject)
            .await
            .map_err(map_automation)?;
        info!(
            referral_id = %referral.id,
            reference = %receipt.reference,
            "test request submitted"
        );
        Ok(receipt)
    }
}

/// Notifies the patient that a test link was issued for them.
pub struct LinkNoticeHandler {
    transport: Arc<dyn NotificationTransport>,
}

impl LinkNoticeHandler {
    pub fn new(transport: Arc<dyn NotificationTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl StageHandler for LinkNoticeHandler {
    fn name(&self) -> &'static str {
        "link_notice"
    }

    fn source_stage(&self) -> Stage {
        Stage::TestRequested
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
            .patient_email
            .clone()
            .ok_or_else(|| StageError::Permanent("patient email missing".to_string()))?;

        let message = OutboundMessage {
            recipient,
            subject: "Your test is ready".to_string(),
            body: link_notice_body(referral),
            attachment: None,
            idempotency_token: token.to_string(),
        };
        let confirmation = self.transport.send(&message).await.map_err(map_transport)?;
        debug!(
            referral_id = %referral.id,
            confirmation_id = %confirmation.confirmation_id,
            "patient link notice accepted"
        );

        Ok(StageOutcome::Advance(Box::new(
            referral.advanced_to(Stage::AwaitingReport, now),
        )))
    }
}

fn link_notice_body(referral: &Referral) -> String {
    match referral.test_link.as_deref() {
        Some(link) => format!(
            "A test has been requested for you.\n\n\
             Start here: {link}\n\n\
             The link stays valid for one week.\n"
        ),
        None => "A test has been requested for you.\n\n\
                 You will receive an access link from the testing service shortly.\n"
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::safety::SafetyLimits;
    use crate::core::store::RecordStore;
    use crate::domain::InboundReferral;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn referral_awaiting_test() -> Referral {
        let payload = InboundReferral {
            message_id: "m-test".to_string(),
            patient_email: Some("pat@example.com".to_string()),
            patient_mobile: None,
            patient_dob: Some("1991-07-02".to_string()),
            patient_id_number: Some("ID-9".to_string()),
            referrer_name: None,
            referrer_email: Some("doc@clinic.example".to_string()),
            raw_subject: "Referral".to_string(),
            raw_body: String::new(),
            received_at: Utc::now(),
        };
        Referral::from_inbound(&payload).advanced_to(Stage::AwaitingTest, Utc::now())
    }

    struct CountingAutomation {
        submits: AtomicUsize,
        lookups: AtomicUsize,
        known: Option<RequestReceipt>,
    }

    #[async_trait]
    impl AutomationService for CountingAutomation {
        async fn submit_test_request(
            &self,
            _subject: &SubjectInfo,
        ) -> Result<RequestReceipt, AutomationError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            Ok(RequestReceipt {
                reference: "REQ-1".to_string(),
                test_link: Some("https://tests.example/t/1".to_string()),
                issued_at: Utc::now(),
            })
        }

        async fn find_request(
            &self,
            _subject: &SubjectInfo,
        ) -> Result<Option<RequestReceipt>, AutomationError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.known.clone())
        }
    }

    fn governor() -> Arc<Governor> {
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        Arc::new(Governor::new(store, SafetyLimits::default()))
    }

    #[tokio::test]
    async fn test_fresh_record_submits_once() {
        let automation = Arc::new(CountingAutomation {
            submits: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
            known: None,
        });
        let handler = TestRequestHandler::new(governor(), automation.clone());
        let referral = referral_awaiting_test();

        let outcome = handler.handle(&referral, "tok", Utc::now()).await.unwrap();
        match outcome {
            StageOutcome::Advance(updated) => {
                assert_eq!(updated.stage, Stage::TestRequested);
                assert_eq!(updated.request_receipt.as_deref(), Some("REQ-1"));
                assert!(updated.test_link.is_some());
            }
            other => panic!("expected advance, got {other:?}"),
        }
        assert_eq!(automation.submits.load(Ordering::SeqCst), 1);
        assert_eq!(automation.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_claimed_record_recovers_without_resubmitting() {
        let automation = Arc::new(CountingAutomation {
            submits: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
            known: Some(RequestReceipt {
                reference: "REQ-OLD".to_string(),
                test_link: None,
                issued_at: Utc::now(),
            }),
        });
        let handler = TestRequestHandler::new(governor(), automation.clone());
        let mut referral = referral_awaiting_test();
        referral.dispatch_token = Some("tok".to_string());
        referral.dispatch_started_at = Some(Utc::now());

        let outcome = handler.handle(&referral, "tok", Utc::now()).await.unwrap();
        match outcome {
            StageOutcome::Advance(updated) => {
                assert_eq!(updated.request_receipt.as_deref(), Some("REQ-OLD"));
            }
            other => panic!("expected advance, got {other:?}"),
        }
        assert_eq!(automation.submits.load(Ordering::SeqCst), 0);
        assert_eq!(automation.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_subject_does_not_touch_the_service() {
        let automation = Arc::new(CountingAutomation {
            submits: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
            known: None,
        });
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let gov = Arc::new(Governor::new(
            store,
            SafetyLimits {
                max_requests_per_tick: 0,
                ..SafetyLimits::default()
            },
        ));
        gov.begin_tick();
        let handler = TestRequestHandler::new(gov, automation.clone());
        let referral = referral_awaiting_test();

        let err = handler
            .handle(&referral, "tok", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Denied(_)));
        assert_eq!(automation.submits.load(Ordering::SeqCst), 0);
    }
}

//! Shared in-memory fakes for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use lucid::adapters::{
    AutomationError, AutomationService, CompletionSignal, CompletionSignalSource,
    DispatchConfirmation, IntakeSource, OutboundMessage, NotificationTransport, RequestReceipt,
    StructuredReportRenderer, SubjectInfo, TransportError,
};
use lucid::config::Config;
use lucid::domain::InboundReferral;
use lucid::{Collaborators, RecordStore, Scheduler};

/// Intake source yielding a fixed queue; payloads stay until acked.
#[derive(Default)]
pub struct MockIntake {
    pub queue: Mutex<Vec<InboundReferral>>,
    pub acked: Mutex<Vec<String>>,
}

impl MockIntake {
    pub fn push(&self, payload: InboundReferral) {
        self.queue.lock().unwrap().push(payload);
    }
}

#[async_trait]
impl IntakeSource for MockIntake {
    async fn fetch(&self, max: usize) -> anyhow::Result<Vec<InboundReferral>> {
        let queue = self.queue.lock().unwrap();
        Ok(queue.iter().take(max).cloned().collect())
    }

    async fn ack(&self, message_id: &str) -> anyhow::Result<()> {
        self.queue
            .lock()
            .unwrap()
            .retain(|p| p.message_id != message_id);
        self.acked.lock().unwrap().push(message_id.to_string());
        Ok(())
    }
}

/// Automation service counting calls; optionally failing the first N
/// submits, and remembering issued receipts for lookup.
#[derive(Default)]
pub struct MockAutomation {
    pub submits: AtomicUsize,
    pub lookups: AtomicUsize,
    pub fail_submits: AtomicUsize,
    pub fail_permanently: std::sync::atomic::AtomicBool,
    /// Simulated service latency, to hold concurrent dispatches in flight.
    pub delay_ms: AtomicUsize,
    pub issued: Mutex<HashMap<String, RequestReceipt>>,
}

impl MockAutomation {
    pub fn failing_transient(times: usize) -> Self {
        let s = Self::default();
        s.fail_submits.store(times, Ordering::SeqCst);
        s
    }

    pub fn preload(&self, subject_key: &str, reference: &str) {
        self.issued.lock().unwrap().insert(
            subject_key.to_string(),
            RequestReceipt {
                reference: reference.to_string(),
                test_link: Some(format!("https://tests.example/t/{reference}")),
                issued_at: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl AutomationService for MockAutomation {
    async fn submit_test_request(
        &self,
        subject: &SubjectInfo,
    ) -> Result<RequestReceipt, AutomationError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay as u64)).await;
        }
        if self.fail_permanently.load(Ordering::SeqCst) {
            return Err(AutomationError::Permanent("form rejected".to_string()));
        }
        let remaining = self.fail_submits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_submits.store(remaining - 1, Ordering::SeqCst);
            return Err(AutomationError::Transient("service busy".to_string()));
        }
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        let receipt = RequestReceipt {
            reference: format!("REQ-{n}"),
            test_link: Some(format!("https://tests.example/t/{n}")),
            issued_at: Utc::now(),
        };
        self.issued
            .lock()
            .unwrap()
            .insert(subject.subject_key.clone(), receipt.clone());
        Ok(receipt)
    }

    async fn find_request(
        &self,
        subject: &SubjectInfo,
    ) -> Result<Option<RequestReceipt>, AutomationError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.issued.lock().unwrap().get(&subject.subject_key).cloned())
    }
}

/// Signal source yielding a fixed queue; signals stay until acked.
#[derive(Default)]
pub struct MockSignals {
    pub queue: Mutex<Vec<CompletionSignal>>,
    pub acked: Mutex<Vec<String>>,
}

impl MockSignals {
    pub fn push(&self, signal: CompletionSignal) {
        self.queue.lock().unwrap().push(signal);
    }
}

#[async_trait]
impl CompletionSignalSource for MockSignals {
    async fn poll(&self, max: usize) -> anyhow::Result<Vec<CompletionSignal>> {
        let queue = self.queue.lock().unwrap();
        Ok(queue.iter().take(max).cloned().collect())
    }

    async fn ack(&self, signal_id: &str) -> anyhow::Result<()> {
        self.queue
            .lock()
            .unwrap()
            .retain(|s| s.signal_id != signal_id);
        self.acked.lock().unwrap().push(signal_id.to_string());
        Ok(())
    }
}

/// Transport recording every accepted message, deduplicating on the
/// idempotency token the way a real gateway would.
#[derive(Default)]
pub struct MockTransport {
    pub accepted: Mutex<Vec<OutboundMessage>>,
    pub fail_sends: AtomicUsize,
}

impl MockTransport {
    /// Messages whose token was seen for the first time.
    pub fn unique_sends(&self) -> usize {
        let accepted = self.accepted.lock().unwrap();
        let mut seen = std::collections::HashSet::new();
        accepted
            .iter()
            .filter(|m| seen.insert(m.idempotency_token.clone()))
            .count()
    }

    pub fn sent_to(&self, recipient: &str) -> usize {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.recipient == recipient)
            .count()
    }
}

#[async_trait]
impl NotificationTransport for MockTransport {
    async fn send(
        &self,
        message: &OutboundMessage,
    ) -> Result<DispatchConfirmation, TransportError> {
        let remaining = self.fail_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_sends.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Transient("gateway busy".to_string()));
        }
        let mut accepted = self.accepted.lock().unwrap();
        accepted.push(message.clone());
        Ok(DispatchConfirmation {
            confirmation_id: format!("c-{}", accepted.len()),
            accepted_at: Utc::now(),
        })
    }
}

pub struct Harness {
    pub scheduler: Scheduler,
    pub store: Arc<RecordStore>,
    pub intake: Arc<MockIntake>,
    pub automation: Arc<MockAutomation>,
    pub signals: Arc<MockSignals>,
    pub transport: Arc<MockTransport>,
    pub reports_dir: tempfile::TempDir,
}

pub fn harness() -> Harness {
    harness_with(Config::default(), MockAutomation::default())
}

pub fn harness_with(mut config: Config, automation: MockAutomation) -> Harness {
    let reports_dir = tempfile::tempdir().unwrap();
    config.home = reports_dir.path().to_path_buf();

    let store = Arc::new(RecordStore::open_in_memory().unwrap());
    let intake = Arc::new(MockIntake::default());
    let automation = Arc::new(automation);
    let signals = Arc::new(MockSignals::default());
    let transport = Arc::new(MockTransport::default());

    let scheduler = Scheduler::new(
        config,
        store.clone(),
        Collaborators {
            intake: intake.clone(),
            automation: automation.clone(),
            signals: signals.clone(),
            renderer: Arc::new(StructuredReportRenderer::new()),
            transport: transport.clone(),
        },
    );

    Harness {
        scheduler,
        store,
        intake,
        automation,
        signals,
        transport,
        reports_dir,
    }
}

pub fn payload(message_id: &str, patient_id: &str) -> InboundReferral {
    InboundReferral {
        message_id: message_id.to_string(),
        patient_email: Some("patient@example.com".to_string()),
        patient_mobile: Some("+4479460000".to_string()),
        patient_dob: Some("1985-06-11".to_string()),
        patient_id_number: Some(patient_id.to_string()),
        referrer_name: Some("Dr. Okafor".to_string()),
        referrer_email: Some("okafor@clinic.example".to_string()),
        raw_subject: "New referral".to_string(),
        raw_body: "Please arrange the assessment.".to_string(),
        received_at: Utc::now(),
    }
}

//! Referral entity and lifecycle stages.
//!
//! A Referral is the single tracked record for one patient's test/report
//! workflow. The persisted stage is the source of truth; handlers only
//! mutate it through the record store's compare-and-swap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle stage of a referral.
///
/// Transitions only move forward, or sideways into a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Row created from an inbound payload, not yet validated
    New,

    /// Payload validated, referrer not yet acknowledged
    Intake,

    /// Acknowledged; waiting for a test request to be dispatched
    AwaitingTest,

    /// Test request submitted to the automation service
    TestRequested,

    /// Patient notified of the test link; waiting for completion
    AwaitingReport,

    /// A completion signal matched this referral
    ReportDetected,

    /// Raw report rendered into its processed form
    ReportProcessed,

    /// Processed report delivered to the referrer (terminal)
    Delivered,

    /// Permanent error or attempt exhaustion (terminal)
    Failed,

    /// Test link expired without completion (terminal)
    Expired,
}

impl Stage {
    /// Stable string form used in the database and config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::New => "new",
            Stage::Intake => "intake",
            Stage::AwaitingTest => "awaiting_test",
            Stage::TestRequested => "test_requested",
            Stage::AwaitingReport => "awaiting_report",
            Stage::ReportDetected => "report_detected",
            Stage::ReportProcessed => "report_processed",
            Stage::Delivered => "delivered",
            Stage::Failed => "failed",
            Stage::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "new" => Some(Stage::New),
            "intake" => Some(Stage::Intake),
            "awaiting_test" => Some(Stage::AwaitingTest),
            "test_requested" => Some(Stage::TestRequested),
            "awaiting_report" => Some(Stage::AwaitingReport),
            "report_detected" => Some(Stage::ReportDetected),
            "report_processed" => Some(Stage::ReportProcessed),
            "delivered" => Some(Stage::Delivered),
            "failed" => Some(Stage::Failed),
            "expired" => Some(Stage::Expired),
            _ => None,
        }
    }

    /// Position in the forward pipeline. Terminal side branches sort last.
    fn ordinal(&self) -> u8 {
        match self {
            Stage::New => 0,
            Stage::Intake => 1,
            Stage::AwaitingTest => 2,
            Stage::TestRequested => 3,
            Stage::AwaitingReport => 4,
            Stage::ReportDetected => 5,
            Stage::ReportProcessed => 6,
            Stage::Delivered => 7,
            Stage::Failed | Stage::Expired => 8,
        }
    }

    /// No further work once a record lands here.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Delivered | Stage::Failed | Stage::Expired)
    }

    /// Whether a transition to `next` respects the forward-only rule.
    /// Any non-terminal stage may branch into Failed or Expired.
    pub fn can_advance_to(&self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Stage::Failed | Stage::Expired => true,
            _ => next.ordinal() > self.ordinal(),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound referral payload, already structured by the intake source.
///
/// Parsing of raw email text stays at the source boundary; the orchestrator
/// never re-parses free text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundReferral {
    /// Natural key of the inbound message (e.g. mail Message-ID)
    pub message_id: String,

    /// Patient contact email
    pub patient_email: Option<String>,

    pub patient_mobile: Option<String>,

    /// Date of birth, ISO date string
    pub patient_dob: Option<String>,

    /// External patient identifier, if the referrer supplied one
    pub patient_id_number: Option<String>,

    pub referrer_name: Option<String>,

    pub referrer_email: Option<String>,

    /// Original subject line, kept for audit
    pub raw_subject: String,

    /// Original body text, kept for audit
    pub raw_body: String,

    pub received_at: DateTime<Utc>,
}

impl InboundReferral {
    /// Stable referral identifier derived from the message natural key.
    pub fn referral_id(&self) -> String {
        hash_natural_key(&self.message_id)
    }

    /// Rate-limiting key for this patient: the external id number when
    /// present, otherwise the contact email.
    pub fn subject_key(&self) -> String {
        self.patient_id_number
            .clone()
            .or_else(|| self.patient_email.clone())
            .unwrap_or_else(|| self.message_id.clone())
    }
}

/// The central tracked entity: one row per patient/test instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    /// Stable identifier (hash of the inbound natural key)
    pub id: String,

    /// Rate-limiting key (patient identity)
    pub subject_key: String,

    pub stage: Stage,

    /// When the record entered its current stage
    pub stage_entered_at: DateTime<Utc>,

    /// Attempts made at the current stage
    pub attempt_count: u32,

    /// Earliest time the next attempt is eligible (backoff)
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    // Payload fields carried from intake
    pub patient_email: Option<String>,
    pub patient_mobile: Option<String>,
    pub patient_dob: Option<String>,
    pub referrer_name: Option<String>,
    pub referrer_email: Option<String>,
    pub raw_subject: String,
    pub raw_body: String,

    // Per-stage audit timestamps
    pub received_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub test_requested_at: Option<DateTime<Utc>>,
    pub report_detected_at: Option<DateTime<Utc>>,
    pub report_processed_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,

    /// Receipt reference returned by the automation service
    pub request_receipt: Option<String>,

    /// Test link issued for the patient
    pub test_link: Option<String>,

    /// Reference to the raw report artifact from the completion signal
    pub report_ref: Option<String>,

    /// Where the processed report was written
    pub processed_report_path: Option<String>,

    /// Digest of the processed report content
    pub processed_report_digest: Option<String>,

    /// Idempotency token persisted before a dispatch is fired
    pub dispatch_token: Option<String>,

    /// When the pending dispatch was claimed
    pub dispatch_started_at: Option<DateTime<Utc>>,

    /// How many reminder thresholds have already fired for this record
    pub reminder_level: u32,

    pub resend_count: u32,
    pub last_resent_at: Option<DateTime<Utc>>,
}

impl Referral {
    /// Build a fresh record from an inbound payload, at stage `New`.
    pub fn from_inbound(payload: &InboundReferral) -> Self {
        Self {
            id: payload.referral_id(),
            subject_key: payload.subject_key(),
            stage: Stage::New,
            stage_entered_at: payload.received_at,
            attempt_count: 0,
            next_attempt_at: None,
            last_error: None,
            patient_email: payload.patient_email.clone(),
            patient_mobile: payload.patient_mobile.clone(),
            patient_dob: payload.patient_dob.clone(),
            referrer_name: payload.referrer_name.clone(),
            referrer_email: payload.referrer_email.clone(),
            raw_subject: payload.raw_subject.clone(),
            raw_body: payload.raw_body.clone(),
            received_at: payload.received_at,
            confirmed_at: None,
            test_requested_at: None,
            report_detected_at: None,
            report_processed_at: None,
            delivered_at: None,
            request_receipt: None,
            test_link: None,
            report_ref: None,
            processed_report_path: None,
            processed_report_digest: None,
            dispatch_token: None,
            dispatch_started_at: None,
            reminder_level: 0,
            resend_count: 0,
            last_resent_at: None,
        }
    }

    /// Copy of this record moved into `next`, with per-stage counters reset.
    pub fn advanced_to(&self, next: Stage, now: DateTime<Utc>) -> Self {
        let mut updated = self.clone();
        updated.stage = next;
        updated.stage_entered_at = now;
        updated.attempt_count = 0;
        updated.next_attempt_at = None;
        updated.last_error = None;
        updated.dispatch_token = None;
        updated.dispatch_started_at = None;
        updated
    }

    /// Year component of the date of birth, used by the automation form.
    pub fn dob_year(&self) -> Option<String> {
        self.patient_dob
            .as_deref()
            .and_then(|d| d.split('-').next())
            .filter(|y| !y.is_empty())
            .map(str::to_owned)
    }
}

/// Hash an inbound natural key into a stable referral identifier.
pub fn hash_natural_key(message_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message_id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..12])
}

/// Deterministic idempotency token for one dispatch slot of a record.
///
/// Stable across retries of the same unconfirmed dispatch, so a crash after
/// the external call cannot fire a second distinct effect on replay.
pub fn dispatch_token(referral_id: &str, slot: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(referral_id.as_bytes());
    hasher.update(b":");
    hasher.update(slot.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..12])
}

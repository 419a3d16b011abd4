//! Collaborator interfaces consumed by the orchestration core.
//!
//! The core never talks to mail, browsers, or report tooling directly; it
//! goes through these traits. Production implementations live alongside;
//! tests substitute in-memory fakes.

pub mod automation;
pub mod inbox;
pub mod mail;
pub mod renderer;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::InboundReferral;

pub use automation::HttpAutomationService;
pub use inbox::{FileIntakeSource, FileSignalSource};
pub use mail::HttpMailTransport;
pub use renderer::StructuredReportRenderer;

/// Yields inbound referral payloads, already structured by the fetch/parse
/// layer. Each payload is acknowledged exactly once after the store has
/// recorded it.
#[async_trait]
pub trait IntakeSource: Send + Sync {
    async fn fetch(&self, max: usize) -> anyhow::Result<Vec<InboundReferral>>;

    /// Mark a payload consumed; it will not be yielded again.
    async fn ack(&self, message_id: &str) -> anyhow::Result<()>;
}

/// Subject details the automation service needs to request a test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectInfo {
    pub subject_key: String,
    pub email: String,
    pub dob_year: String,
}

/// Receipt returned when a test request is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestReceipt {
    /// Service-side reference for the request
    pub reference: String,

    /// Test link issued to the patient, when the service returns one
    pub test_link: Option<String>,

    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("automation transient failure: {0}")]
    Transient(String),

    #[error("automation rejected request: {0}")]
    Permanent(String),
}

/// Browser-automation service that submits test requests.
#[async_trait]
pub trait AutomationService: Send + Sync {
    async fn submit_test_request(
        &self,
        subject: &SubjectInfo,
    ) -> Result<RequestReceipt, AutomationError>;

    /// Look up an existing request for this subject. Used for idempotent
    /// follow-up when a prior dispatch was claimed but never confirmed.
    async fn find_request(
        &self,
        subject: &SubjectInfo,
    ) -> Result<Option<RequestReceipt>, AutomationError>;
}

/// A completion notification correlatable to a referral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionSignal {
    /// Source-side identifier, used for acknowledgment
    pub signal_id: String,

    /// The referral the signal claims to belong to
    pub referral_id: String,

    /// Reference to the completed report artifact (path or URL)
    pub report_ref: String,

    pub observed_at: DateTime<Utc>,
}

/// Yields completion signals. Unmatched signals are left un-acked for
/// manual reconciliation.
#[async_trait]
pub trait CompletionSignalSource: Send + Sync {
    async fn poll(&self, max: usize) -> anyhow::Result<Vec<CompletionSignal>>;

    async fn ack(&self, signal_id: &str) -> anyhow::Result<()>;
}

/// Output of the report renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedReport {
    pub content: String,

    /// Digest of `content`; identical input yields an identical digest
    pub digest: String,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unreadable report content: {0}")]
    Unreadable(String),
}

/// Pure transformation of a raw report into its processed form.
///
/// Must be deterministic and replay-safe: rerunning on the same bytes
/// yields byte-identical output.
pub trait ReportRenderer: Send + Sync {
    fn process(&self, raw: &[u8]) -> Result<ProcessedReport, RenderError>;
}

/// One outbound notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub attachment: Option<PathBuf>,

    /// Caller-supplied token; the transport must deduplicate on it
    pub idempotency_token: String,
}

/// Confirmation that the transport accepted a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfirmation {
    pub confirmation_id: String,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport transient failure: {0}")]
    Transient(String),

    #[error("transport rejected message: {0}")]
    Permanent(String),
}

/// Email/SMS gateway used for confirmations, notices, reminders, delivery.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<DispatchConfirmation, TransportError>;
}

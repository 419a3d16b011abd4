//! File-inbox implementations of the intake and completion-signal sources.
//!
//! The email fetch/parse layer (out of scope here) drops structured JSON
//! payloads into an inbox directory; ack moves a file to `processed/` so a
//! payload is consumed exactly once even across restarts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::domain::InboundReferral;

use super::{CompletionSignal, CompletionSignalSource, IntakeSource};

/// Intake source reading `*.json` referral payloads from a directory.
pub struct FileIntakeSource {
    inbox_dir: PathBuf,
    processed_dir: PathBuf,
}

impl FileIntakeSource {
    pub fn new(inbox_dir: impl Into<PathBuf>) -> Self {
        let inbox_dir = inbox_dir.into();
        let processed_dir = inbox_dir.join("processed");
        Self {
            inbox_dir,
            processed_dir,
        }
    }

    async fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.processed_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create processed directory: {}",
                    self.processed_dir.display()
                )
            })?;
        Ok(())
    }

    fn payload_path(&self, message_id: &str) -> PathBuf {
        self.inbox_dir.join(file_name_for(message_id))
    }
}

#[async_trait]
impl IntakeSource for FileIntakeSource {
    async fn fetch(&self, max: usize) -> Result<Vec<InboundReferral>> {
        self.ensure_dirs().await?;

        let mut payloads = Vec::new();
        let mut entries = fs::read_dir(&self.inbox_dir)
            .await
            .with_context(|| format!("failed to read inbox: {}", self.inbox_dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if payloads.len() >= max {
                break;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read payload: {}", path.display()))?;
            let payload: InboundReferral = serde_json::from_str(&content)
                .with_context(|| format!("malformed payload: {}", path.display()))?;
            payloads.push(payload);
        }

        // Oldest first, so intake order is stable across ticks.
        payloads.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(payloads)
    }

    async fn ack(&self, message_id: &str) -> Result<()> {
        self.ensure_dirs().await?;
        let from = self.payload_path(message_id);
        if !from.exists() {
            // Already acked by an earlier cycle.
            return Ok(());
        }
        let to = self.processed_dir.join(file_name_for(message_id));
        fs::rename(&from, &to)
            .await
            .with_context(|| format!("failed to ack payload: {}", from.display()))?;
        Ok(())
    }
}

/// Writes a payload into an inbox using the naming scheme `fetch` expects.
/// Used by the fetch layer and by tests.
pub async fn write_payload(inbox_dir: &Path, payload: &InboundReferral) -> Result<PathBuf> {
    fs::create_dir_all(inbox_dir).await?;
    let path = inbox_dir.join(file_name_for(&payload.message_id));
    let json = serde_json::to_string_pretty(payload)?;
    fs::write(&path, json)
        .await
        .with_context(|| format!("failed to write payload: {}", path.display()))?;
    Ok(path)
}

/// Completion-signal source reading `*.json` signal files from a directory.
///
/// Matched signals are acked (moved); unmatched ones stay in place for
/// manual reconciliation.
pub struct FileSignalSource {
    signal_dir: PathBuf,
    processed_dir: PathBuf,
}

impl FileSignalSource {
    pub fn new(signal_dir: impl Into<PathBuf>) -> Self {
        let signal_dir = signal_dir.into();
        let processed_dir = signal_dir.join("processed");
        Self {
            signal_dir,
            processed_dir,
        }
    }
}

#[async_trait]
impl CompletionSignalSource for FileSignalSource {
    async fn poll(&self, max: usize) -> Result<Vec<CompletionSignal>> {
        fs::create_dir_all(&self.processed_dir).await?;

        let mut signals = Vec::new();
        let mut entries = fs::read_dir(&self.signal_dir)
            .await
            .with_context(|| format!("failed to read signals: {}", self.signal_dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if signals.len() >= max {
                break;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read signal: {}", path.display()))?;
            let signal: CompletionSignal = serde_json::from_str(&content)
                .with_context(|| format!("malformed signal: {}", path.display()))?;
            signals.push(signal);
        }

        signals.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));
        Ok(signals)
    }

    async fn ack(&self, signal_id: &str) -> Result<()> {
        fs::create_dir_all(&self.processed_dir).await?;
        let from = self.signal_dir.join(file_name_for(signal_id));
        if !from.exists() {
            return Ok(());
        }
        let to = self.processed_dir.join(file_name_for(signal_id));
        fs::rename(&from, &to)
            .await
            .with_context(|| format!("failed to ack signal: {}", from.display()))?;
        Ok(())
    }
}

/// Writes a signal file the way the notification layer does. Test helper.
pub async fn write_signal(signal_dir: &Path, signal: &CompletionSignal) -> Result<PathBuf> {
    fs::create_dir_all(signal_dir).await?;
    let path = signal_dir.join(file_name_for(&signal.signal_id));
    let json = serde_json::to_string_pretty(signal)?;
    fs::write(&path, json).await?;
    Ok(path)
}

/// Filesystem-safe name derived from an arbitrary identifier.
fn file_name_for(id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    let digest = hasher.finalize();
    format!("{}.json", hex::encode(&digest[..10]))
}

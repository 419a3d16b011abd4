//! HTTP client for the outbound mail gateway.
//!
//! The gateway deduplicates on the `Idempotency-Key` header, which carries
//! the caller-supplied dispatch token: re-sending after a crash with the
//! same token cannot produce a duplicate email.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use super::{DispatchConfirmation, NotificationTransport, OutboundMessage, TransportError};

#[derive(Debug, Deserialize)]
struct SendResponse {
    ok: bool,
    confirmation_id: Option<String>,
    error: Option<String>,
}

/// reqwest-backed mail gateway transport.
pub struct HttpMailTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpMailTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        // A fallback client would silently drop the per-call timeout, so a
        // builder failure is fatal.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build mail gateway HTTP client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() || err.is_connect() {
        TransportError::Transient(err.to_string())
    } else if err.is_status() {
        match err.status() {
            Some(status) if status.is_server_error() => TransportError::Transient(err.to_string()),
            _ => TransportError::Permanent(err.to_string()),
        }
    } else {
        TransportError::Transient(err.to_string())
    }
}

#[async_trait]
impl NotificationTransport for HttpMailTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<DispatchConfirmation, TransportError> {
        let attachment = message
            .attachment
            .as_ref()
            .map(|p| p.to_string_lossy().to_string());

        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", &message.idempotency_token)
            .json(&serde_json::json!({
                "to": message.recipient,
                "subject": message.subject,
                "body": message.body,
                "attachment": attachment,
            }))
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?;

        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        if !body.ok {
            return Err(TransportError::Permanent(
                body.error.unwrap_or_else(|| "message rejected".to_string()),
            ));
        }

        Ok(DispatchConfirmation {
            confirmation_id: body
                .confirmation_id
                .unwrap_or_else(|| message.idempotency_token.clone()),
            accepted_at: Utc::now(),
        })
    }
}

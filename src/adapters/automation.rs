//! HTTP client for the test-request automation service.
//!
//! The browser-automation layer exposes a small JSON API; this client
//! submits the request form and classifies failures for the retry policy:
//! timeouts and 5xx are transient, 4xx is permanent.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use super::{AutomationError, AutomationService, RequestReceipt, SubjectInfo};

/// Response envelope from the automation service.
#[derive(Debug, Deserialize)]
struct SubmitResponse {
    ok: bool,
    reference: Option<String>,
    test_link: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    found: bool,
    reference: Option<String>,
    test_link: Option<String>,
}

/// reqwest-backed automation client.
pub struct HttpAutomationService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAutomationService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        // A fallback client would silently drop the per-call timeout, so a
        // builder failure is fatal.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build automation HTTP client")?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

fn classify(err: reqwest::Error) -> AutomationError {
    if err.is_timeout() || err.is_connect() {
        AutomationError::Transient(err.to_string())
    } else if err.is_status() {
        match err.status() {
            Some(status) if status.is_server_error() => {
                AutomationError::Transient(err.to_string())
            }
            _ => AutomationError::Permanent(err.to_string()),
        }
    } else {
        AutomationError::Transient(err.to_string())
    }
}

#[async_trait]
impl AutomationService for HttpAutomationService {
    async fn submit_test_request(
        &self,
        subject: &SubjectInfo,
    ) -> Result<RequestReceipt, AutomationError> {
        let response = self
            .client
            .post(self.url("requests"))
            .json(&serde_json::json!({
                "subject": subject.subject_key,
                "email": subject.email,
                "dob_year": subject.dob_year,
            }))
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?;

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| AutomationError::Transient(e.to_string()))?;

        if !body.ok {
            return Err(AutomationError::Permanent(
                body.error.unwrap_or_else(|| "request rejected".to_string()),
            ));
        }

        let reference = body.reference.ok_or_else(|| {
            AutomationError::Permanent("service accepted request without a reference".to_string())
        })?;

        Ok(RequestReceipt {
            reference,
            test_link: body.test_link,
            issued_at: Utc::now(),
        })
    }

    async fn find_request(
        &self,
        subject: &SubjectInfo,
    ) -> Result<Option<RequestReceipt>, AutomationError> {
        let response = self
            .client
            .get(self.url("requests/lookup"))
            .query(&[("subject", subject.subject_key.as_str())])
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?;

        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| AutomationError::Transient(e.to_string()))?;

        if !body.found {
            return Ok(None);
        }

        Ok(body.reference.map(|reference| RequestReceipt {
            reference,
            test_link: body.test_link,
            issued_at: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let service =
            HttpAutomationService::new("http://localhost:9300/", Duration::from_secs(5)).unwrap();
        assert_eq!(service.url("requests"), "http://localhost:9300/requests");
    }
}

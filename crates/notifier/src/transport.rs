//! Mail transports.
//!
//! The worker treats every transport error as retryable; there is no
//! distinction between timeouts, rejections and auth failures.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use quill_common::config::AppConfig;
use quill_common::types::EmailPayload;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mail provider rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &EmailPayload) -> Result<(), TransportError>;
}

/// Delivery through the Resend HTTP API.
pub struct ResendTransport {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [String; 1],
    subject: &'a str,
    html: &'a str,
}

impl ResendTransport {
    pub fn new(api_key: String, from: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: RESEND_API_URL.to_string(),
            api_key,
            from,
        }
    }

    /// Point the transport at a different endpoint (e.g. a local mock).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn recipient(email: &EmailPayload) -> String {
        if email.to_name.trim().is_empty() {
            email.to_address.clone()
        } else {
            format!("{} <{}>", email.to_name.replace(['<', '>', '"'], ""), email.to_address)
        }
    }
}

#[async_trait]
impl MailTransport for ResendTransport {
    async fn send(&self, email: &EmailPayload) -> Result<(), TransportError> {
        let request = ResendRequest {
            from: &self.from,
            to: [Self::recipient(email)],
            subject: &email.subject,
            html: &email.html_body,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Logs instead of sending. Used when no mail provider is configured.
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, email: &EmailPayload) -> Result<(), TransportError> {
        tracing::info!(
            to_address = %email.to_address,
            subject = %email.subject,
            "Mail provider not configured; email logged instead of sent"
        );
        Ok(())
    }
}

/// Pick the transport the configuration asks for.
pub fn from_config(config: &AppConfig) -> Arc<dyn MailTransport> {
    match &config.resend_api_key {
        Some(key) => Arc::new(ResendTransport::new(key.clone(), config.email_from.clone())),
        None => {
            tracing::warn!("RESEND_API_KEY not set; emails will only be logged");
            Arc::new(LogTransport)
        }
    }
}

//! Email senders: the Resend HTTP API for production and a log-only sender for
//! development.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_common::config::AppConfig;

const RESEND_API_URL: &str = "https://api.resend.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A fully rendered email ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
    /// Forwarded to providers that deduplicate requests.
    pub idempotency_key: Option<String>,
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Sender misconfigured: {0}")]
    Config(String),
}

#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), SendError>;
}

#[derive(Debug, Serialize)]
struct ResendEmailRequest<'a> {
    from: &'a str,
    to: Vec<String>,
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    id: Option<String>,
}

/// Delivers through the Resend email API.
pub struct ResendSender {
    client: Client,
    api_key: String,
    from: String,
    base_url: String,
}

impl ResendSender {
    pub fn new(api_key: impl Into<String>, from: impl Into<String>) -> Result<Self, SendError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            from: from.into(),
            base_url: RESEND_API_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn recipient(email: &OutgoingEmail) -> String {
        match &email.to_name {
            Some(name) => format!("{} <{}>", name.replace(['<', '>', '"'], ""), email.to),
            None => email.to.clone(),
        }
    }
}

#[async_trait]
impl Sender for ResendSender {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), SendError> {
        let body = ResendEmailRequest {
            from: &self.from,
            to: vec![Self::recipient(email)],
            subject: &email.subject,
            html: &email.html,
            text: email.text.as_deref(),
        };

        let mut request = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);
        if let Some(key) = &email.idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ResendEmailResponse = response.json().await?;
        tracing::debug!(provider_id = ?parsed.id, "Email accepted by Resend");
        Ok(())
    }
}

/// Logs the message instead of delivering it.
pub struct LogSender;

#[async_trait]
impl Sender for LogSender {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), SendError> {
        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            "Email delivery skipped (log sender)"
        );
        Ok(())
    }
}

/// Resend when an API key is configured, otherwise the log sender.
pub fn sender_from_config(config: &AppConfig) -> Result<Arc<dyn Sender>, SendError> {
    match (&config.resend_api_key, &config.email_from) {
        (Some(key), Some(from)) => Ok(Arc::new(ResendSender::new(key.clone(), from.clone())?)),
        (Some(_), None) => Err(SendError::Config(
            "EMAIL_FROM is required when RESEND_API_KEY is set".to_string(),
        )),
        (None, _) => {
            tracing::warn!("RESEND_API_KEY not set, emails will only be logged");
            Ok(Arc::new(LogSender))
        }
    }
}

//! Direct send path: render and deliver immediately, without the outbox.
//!
//! Only the process-local suppressor guards against duplicates here, so this
//! path suits best-effort messages where a lost or doubled send is tolerable.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use courier_common::types::NotificationKind;
use courier_engine::dedupe::LocalSuppressor;

use crate::render::{RenderError, TemplateRenderer};
use crate::sender::{OutgoingEmail, SendError, Sender};

#[derive(Error, Debug)]
pub enum DirectError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Send(#[from] SendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectOutcome {
    Sent,
    Suppressed,
}

pub struct DirectDelivery {
    renderer: Arc<dyn TemplateRenderer>,
    sender: Arc<dyn Sender>,
    suppressor: LocalSuppressor,
}

impl DirectDelivery {
    pub fn new(
        renderer: Arc<dyn TemplateRenderer>,
        sender: Arc<dyn Sender>,
        suppressor: LocalSuppressor,
    ) -> Self {
        Self {
            renderer,
            sender,
            suppressor,
        }
    }

    pub async fn deliver(
        &self,
        kind: NotificationKind,
        to_email: &str,
        to_name: Option<&str>,
        data: &Value,
        dedupe_key: Option<&str>,
    ) -> Result<DirectOutcome, DirectError> {
        if let Some(key) = dedupe_key
            && !self.suppressor.check_and_insert(key)
        {
            return Ok(DirectOutcome::Suppressed);
        }

        let result = self.render_and_send(kind, to_email, to_name, data).await;
        if result.is_err()
            && let Some(key) = dedupe_key
        {
            self.suppressor.release(key);
        }
        result?;

        tracing::info!(kind = %kind, to = %to_email, "Direct email sent");
        Ok(DirectOutcome::Sent)
    }

    async fn render_and_send(
        &self,
        kind: NotificationKind,
        to_email: &str,
        to_name: Option<&str>,
        data: &Value,
    ) -> Result<(), DirectError> {
        let message = self.renderer.render(kind, data)?;
        let email = OutgoingEmail {
            to: to_email.to_string(),
            to_name: to_name.map(str::to_string),
            subject: message.subject,
            html: message.html,
            text: message.text,
            idempotency_key: None,
        };
        self.sender.send(&email).await?;
        Ok(())
    }
}

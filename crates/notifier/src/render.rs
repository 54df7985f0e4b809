//! Template rendering: turn a notification kind and its data into email content.

use serde_json::Value;
use thiserror::Error;

use courier_common::types::{NotificationKind, RenderSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

impl From<RenderedMessage> for RenderSnapshot {
    fn from(message: RenderedMessage) -> Self {
        RenderSnapshot {
            subject: message.subject,
            body_html: message.html,
            body_text: message.text,
        }
    }
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("{kind} template requires data field '{field}'")]
    MissingField {
        kind: NotificationKind,
        field: &'static str,
    },

    #[error("Template error: {0}")]
    Template(String),
}

pub trait TemplateRenderer: Send + Sync {
    fn render(&self, kind: NotificationKind, data: &Value) -> Result<RenderedMessage, RenderError>;
}

/// Built-in renderer with one fixed template per kind.
pub struct PlainTextRenderer {
    product_name: String,
}

impl PlainTextRenderer {
    pub fn new(product_name: impl Into<String>) -> Self {
        Self {
            product_name: product_name.into(),
        }
    }

    fn required<'a>(
        kind: NotificationKind,
        data: &'a Value,
        field: &'static str,
    ) -> Result<&'a str, RenderError> {
        data.get(field)
            .and_then(Value::as_str)
            .filter(|v| !v.trim().is_empty())
            .ok_or(RenderError::MissingField { kind, field })
    }

    fn optional<'a>(data: &'a Value, field: &str) -> Option<&'a str> {
        data.get(field)
            .and_then(Value::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

impl Default for PlainTextRenderer {
    fn default() -> Self {
        Self::new("Courier")
    }
}

impl TemplateRenderer for PlainTextRenderer {
    fn render(&self, kind: NotificationKind, data: &Value) -> Result<RenderedMessage, RenderError> {
        let product = &self.product_name;
        let greeting = Self::optional(data, "name")
            .map(|n| format!("Hi {},", n))
            .unwrap_or_else(|| "Hi,".to_string());

        let (subject, lines, link) = match kind {
            NotificationKind::Verification => {
                let link = Self::required(kind, data, "link")?;
                (
                    format!("Verify your email for {}", product),
                    vec!["Confirm your email address to finish setting up your account.".to_string()],
                    Some(link),
                )
            }
            NotificationKind::Invite => {
                let link = Self::required(kind, data, "link")?;
                let team = Self::optional(data, "team").unwrap_or(product.as_str());
                let inviter = Self::optional(data, "inviter").unwrap_or("A teammate");
                (
                    format!("You've been invited to join {}", team),
                    vec![format!("{} invited you to join {} on {}.", inviter, team, product)],
                    Some(link),
                )
            }
            NotificationKind::PasswordReset => {
                let link = Self::required(kind, data, "link")?;
                (
                    format!("Reset your {} password", product),
                    vec![
                        "We received a request to reset your password.".to_string(),
                        "If you did not ask for this, you can ignore this email.".to_string(),
                    ],
                    Some(link),
                )
            }
            NotificationKind::MagicLink => {
                let link = Self::required(kind, data, "link")?;
                (
                    format!("Your {} sign-in link", product),
                    vec!["Use the link below to sign in. It expires shortly.".to_string()],
                    Some(link),
                )
            }
            NotificationKind::Welcome => (
                format!("Welcome to {}", product),
                vec![format!("Thanks for joining {}.", product)],
                Self::optional(data, "link"),
            ),
            NotificationKind::SecurityAlert => {
                let event = Self::required(kind, data, "event")?;
                let mut lines = vec![format!("Security notice: {}.", event)];
                if let Some(ip) = Self::optional(data, "ip_address") {
                    lines.push(format!("Request origin: {}.", ip));
                }
                lines.push("If this wasn't you, secure your account immediately.".to_string());
                (format!("Security alert for your {} account", product), lines, None)
            }
        };

        let mut text = format!("{}\n\n{}", greeting, lines.join("\n"));
        let mut html = format!(
            "<p>{}</p>{}",
            escape_html(&greeting),
            lines
                .iter()
                .map(|l| format!("<p>{}</p>", escape_html(l)))
                .collect::<String>()
        );
        if let Some(link) = link {
            text.push_str(&format!("\n\n{}", link));
            let link = escape_html(link);
            html.push_str(&format!("<p><a href=\"{}\">{}</a></p>", link, link));
        }

        Ok(RenderedMessage {
            subject,
            html,
            text: Some(text),
        })
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// The closed set of notification kinds the renderer knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Verification,
    Invite,
    PasswordReset,
    MagicLink,
    Welcome,
    SecurityAlert,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 6] = [
        NotificationKind::Verification,
        NotificationKind::Invite,
        NotificationKind::PasswordReset,
        NotificationKind::MagicLink,
        NotificationKind::Welcome,
        NotificationKind::SecurityAlert,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Verification => "verification",
            NotificationKind::Invite => "invite",
            NotificationKind::PasswordReset => "password_reset",
            NotificationKind::MagicLink => "magic_link",
            NotificationKind::Welcome => "welcome",
            NotificationKind::SecurityAlert => "security_alert",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotificationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| AppError::Validation(format!("Unknown notification kind '{}'", s)))
    }
}

/// Notification delivery status.
///
/// `Sent` and `DeadLetter` are terminal for the dispatcher. `Failed` is a
/// bookkeeping marker written inside an attempt burst; it is never leased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Queued,
    Sending,
    Sent,
    Failed,
    DeadLetter,
}

/// An edge of the delivery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Queued → Sending (atomic claim by a dispatcher).
    Lease,
    /// Sending → Sent.
    Succeed,
    /// Sending → Failed, recorded between tries of one burst.
    Fail,
    /// Failed → Sending, the next try of the same burst.
    Resume,
    /// Sending → DeadLetter after the last try failed.
    Exhaust,
    /// Failed/DeadLetter → Queued, explicit operator action.
    Requeue,
    /// Sending → Queued for leases abandoned past the reclaim window.
    Reclaim,
}

impl Transition {
    /// Statuses this edge may start from.
    pub fn sources(self) -> &'static [NotificationStatus] {
        use NotificationStatus::*;
        match self {
            Transition::Lease => &[Queued],
            Transition::Succeed | Transition::Fail | Transition::Exhaust => &[Sending],
            Transition::Resume => &[Failed],
            Transition::Requeue => &[Failed, DeadLetter],
            Transition::Reclaim => &[Sending],
        }
    }

    pub fn target(self) -> NotificationStatus {
        match self {
            Transition::Lease | Transition::Resume => NotificationStatus::Sending,
            Transition::Succeed => NotificationStatus::Sent,
            Transition::Fail => NotificationStatus::Failed,
            Transition::Exhaust => NotificationStatus::DeadLetter,
            Transition::Requeue | Transition::Reclaim => NotificationStatus::Queued,
        }
    }

    /// Source statuses as their stored text form, for `status = ANY($n)` guards.
    pub fn source_names(self) -> Vec<String> {
        self.sources().iter().map(|s| s.as_str().to_string()).collect()
    }
}

impl NotificationStatus {
    /// Statuses the retention sweep may scrub or delete.
    pub const RETAINED: [NotificationStatus; 3] = [
        NotificationStatus::Sent,
        NotificationStatus::Failed,
        NotificationStatus::DeadLetter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationStatus::Queued => "queued",
            NotificationStatus::Sending => "sending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
            NotificationStatus::DeadLetter => "dead_letter",
        }
    }

    /// Whether the row participates in the active dedupe-key constraint.
    pub fn is_active(self) -> bool {
        matches!(self, NotificationStatus::Queued | NotificationStatus::Sending)
    }

    /// Apply a transition, rejecting edges the state machine does not define.
    pub fn apply(self, transition: Transition) -> Result<NotificationStatus, AppError> {
        if transition.sources().contains(&self) {
            Ok(transition.target())
        } else {
            Err(AppError::InvalidState(format!(
                "cannot apply {:?} to a {} notification",
                transition, self
            )))
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "queued" => Ok(NotificationStatus::Queued),
            "sending" => Ok(NotificationStatus::Sending),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            "dead_letter" => Ok(NotificationStatus::DeadLetter),
            other => Err(AppError::Validation(format!(
                "Unknown notification status '{}'",
                other
            ))),
        }
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub to_email: String,
    pub to_name: Option<String>,
    pub tenant_id: Option<String>,
    /// Renderer input; also carries the merged `provider_status` object.
    pub data: serde_json::Value,
    pub subject: Option<String>,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub dedupe_key: Option<String>,
    pub token_hash: Option<String>,
    pub status: NotificationStatus,
    pub attempt_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub leased_at: Option<DateTime<Utc>>,
    pub scrubbed_at: Option<DateTime<Utc>>,
    pub resend_of_id: Option<Uuid>,
    pub resend_reason: Option<String>,
    pub resend_count: i32,
    pub last_resend_at: Option<DateTime<Utc>>,
    pub throttle_until: Option<DateTime<Utc>>,
}

impl Notification {
    /// The cached render, when both subject and html body are present.
    pub fn snapshot(&self) -> Option<RenderSnapshot> {
        match (&self.subject, &self.body_html) {
            (Some(subject), Some(body_html)) => Some(RenderSnapshot {
                subject: subject.clone(),
                body_html: body_html.clone(),
                body_text: self.body_text.clone(),
            }),
            _ => None,
        }
    }
}

/// A producer's request to enqueue a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub kind: NotificationKind,
    pub to_email: String,
    pub to_name: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,
    /// Caller idempotency key.
    pub dedupe_key: Option<String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl NewNotification {
    pub fn new(kind: NotificationKind, to_email: impl Into<String>) -> Self {
        Self {
            kind,
            to_email: to_email.into(),
            to_name: None,
            tenant_id: None,
            data: empty_object(),
            dedupe_key: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_name(mut self, to_name: impl Into<String>) -> Self {
        self.to_name = Some(to_name.into());
        self
    }

    /// Reject requests the outbox must never persist.
    pub fn validate(&self) -> Result<(), AppError> {
        let email = self.to_email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::Validation(format!(
                "Invalid recipient address '{}'",
                self.to_email
            )));
        }
        if let Some(key) = &self.dedupe_key
            && key.trim().is_empty()
        {
            return Err(AppError::Validation(
                "dedupe_key must not be blank".to_string(),
            ));
        }
        if !self.data.is_object() {
            return Err(AppError::Validation(
                "data must be a JSON object".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pre-rendered content stored on the row so dispatch can skip the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderSnapshot {
    pub subject: String,
    pub body_html: String,
    pub body_text: Option<String>,
}

/// Ledger entry gating creation for a caller-supplied dedupe key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DedupeClaim {
    pub key: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A delivery-lifecycle fact reported by the email provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatusUpdate {
    pub provider: String,
    /// Provider vocabulary, e.g. `delivered`, `opened`, `bounced`.
    pub status: String,
    pub event_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Filter for operator listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationFilter {
    pub tenant_id: Option<String>,
    pub status: Option<NotificationStatus>,
    pub limit: Option<i64>,
}

impl NotificationFilter {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 500;

    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_only_from_queued() {
        assert_eq!(
            NotificationStatus::Queued.apply(Transition::Lease).unwrap(),
            NotificationStatus::Sending
        );
        for status in [
            NotificationStatus::Sending,
            NotificationStatus::Sent,
            NotificationStatus::Failed,
            NotificationStatus::DeadLetter,
        ] {
            assert!(matches!(
                status.apply(Transition::Lease),
                Err(AppError::InvalidState(_))
            ));
        }
    }

    #[test]
    fn test_no_transition_skips_sending() {
        // Every edge into Sent/Failed/DeadLetter starts from Sending.
        for transition in [Transition::Succeed, Transition::Fail, Transition::Exhaust] {
            assert_eq!(transition.sources(), &[NotificationStatus::Sending]);
        }
        assert!(NotificationStatus::Queued.apply(Transition::Succeed).is_err());
        assert!(NotificationStatus::Failed.apply(Transition::Succeed).is_err());
    }

    #[test]
    fn test_requeue_edges() {
        assert_eq!(
            NotificationStatus::Failed.apply(Transition::Requeue).unwrap(),
            NotificationStatus::Queued
        );
        assert_eq!(
            NotificationStatus::DeadLetter
                .apply(Transition::Requeue)
                .unwrap(),
            NotificationStatus::Queued
        );
        assert!(NotificationStatus::Sent.apply(Transition::Requeue).is_err());
        assert!(NotificationStatus::Sending.apply(Transition::Requeue).is_err());
    }

    #[test]
    fn test_status_text_round_trip() {
        assert_eq!(NotificationStatus::DeadLetter.as_str(), "dead_letter");
        assert_eq!(
            "dead_letter".parse::<NotificationStatus>().unwrap(),
            NotificationStatus::DeadLetter
        );
        assert_eq!(
            "password_reset".parse::<NotificationKind>().unwrap(),
            NotificationKind::PasswordReset
        );
        assert!("carrier_pigeon".parse::<NotificationKind>().is_err());
    }

    #[test]
    fn test_active_statuses() {
        assert!(NotificationStatus::Queued.is_active());
        assert!(NotificationStatus::Sending.is_active());
        assert!(!NotificationStatus::Failed.is_active());
        assert!(!NotificationStatus::Sent.is_active());
        assert!(!NotificationStatus::DeadLetter.is_active());
    }

    #[test]
    fn test_validate_new_notification() {
        let ok = NewNotification::new(NotificationKind::Invite, "a@example.com");
        assert!(ok.validate().is_ok());

        let bad_email = NewNotification::new(NotificationKind::Invite, "nobody");
        assert!(matches!(bad_email.validate(), Err(AppError::Validation(_))));

        let blank_key = ok.clone().with_dedupe_key("  ");
        assert!(matches!(blank_key.validate(), Err(AppError::Validation(_))));

        let bad_data = ok.with_data(serde_json::json!([1, 2]));
        assert!(matches!(bad_data.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_filter_limit_clamped() {
        let filter = NotificationFilter {
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(filter.effective_limit(), NotificationFilter::MAX_LIMIT);
        assert_eq!(
            NotificationFilter::default().effective_limit(),
            NotificationFilter::DEFAULT_LIMIT
        );
    }
}

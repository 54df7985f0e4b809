//! Outbox store: persisted notification rows and their state transitions.
//!
//! Two backends implement [`OutboxStore`]: [`PgOutboxStore`] for production and
//! [`MemoryOutboxStore`] for tests and single-process development. Both derive
//! their status guards from `Transition::sources`, so the state machine lives in
//! one place.

mod memory;
mod postgres;

pub use memory::MemoryOutboxStore;
pub use postgres::PgOutboxStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use courier_common::cipher::FieldCipher;
use courier_common::config::ScrubFields;
use courier_common::error::{AppError, AppResult};
use courier_common::types::{
    NewNotification, Notification, NotificationFilter, NotificationKind, NotificationStatus,
    ProviderStatusUpdate, RenderSnapshot,
};

use crate::provider_status::PROVIDER_STATUS_KEY;

/// `resend_reason` recorded on clones created by the auto-resend scanner.
pub const AUTO_RESEND_REASON: &str = "auto_no_action";

/// Placeholder written over `to_email` when a row is scrubbed.
pub const SCRUBBED_EMAIL_PLACEHOLDER: &str = "redacted@scrubbed.invalid";

const MAX_ERROR_LEN: usize = 2000;

/// Settings shared by every backend.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub cipher: FieldCipher,
    /// Lifetime of a creation-time dedupe claim.
    pub claim_ttl: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            cipher: FieldCipher::disabled(),
            claim_ttl: Duration::hours(24),
        }
    }
}

/// Selection criteria for the auto-resend scan.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    /// Only originals sent at or before this instant.
    pub sent_before: DateTime<Utc>,
    pub kinds: Vec<NotificationKind>,
    pub limit: i64,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim the dedupe key (if any) and persist a Queued row.
    ///
    /// Fails with `DuplicateActive` when a live claim exists or another
    /// Queued/Sending row holds the same key.
    async fn create_queued(
        &self,
        message: &NewNotification,
        token_hash: Option<&str>,
        snapshot: Option<&RenderSnapshot>,
        now: DateTime<Utc>,
    ) -> AppResult<Uuid>;

    /// Atomically flip the oldest due Queued row to Sending and return it.
    ///
    /// A leased row whose sealed columns cannot be opened is dead-lettered
    /// and the next due row is tried instead.
    async fn lease_next_due(&self, now: DateTime<Utc>) -> AppResult<Option<Notification>>;

    async fn mark_sent(
        &self,
        id: Uuid,
        content: &RenderSnapshot,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    /// In-burst bookkeeping. The row is not picked up by `lease_next_due`.
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn mark_dead_letter(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> AppResult<()>;

    /// Failed → Sending for the next try of the same burst.
    ///
    /// Returns false when the row has left Failed or another active row now
    /// holds its dedupe key; the burst must stop without a finalizing write.
    async fn resume_attempt(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<bool>;

    /// Failed/DeadLetter → Queued. False for any other status or an unknown id.
    async fn try_requeue(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<bool>;

    /// Merge a provider delivery fact into the row payload. Never changes status.
    async fn record_provider_status(
        &self,
        id: Uuid,
        update: &ProviderStatusUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    /// Take the creation claim for a key. False while a live claim exists.
    async fn try_claim(&self, key: &str, now: DateTime<Utc>) -> AppResult<bool>;

    async fn get(&self, id: Uuid) -> AppResult<Notification>;

    async fn list(&self, filter: &NotificationFilter) -> AppResult<Vec<Notification>>;

    /// Clone a terminal original into a new Queued row and update the parent's
    /// resend bookkeeping, atomically with the throttle check.
    async fn create_resend(
        &self,
        original_id: Uuid,
        reason: Option<&str>,
        throttle_window: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<Notification>;

    /// Sent originals with no child and no engagement, oldest first.
    async fn auto_resend_candidates(&self, query: &CandidateQuery) -> AppResult<Vec<Notification>>;

    async fn has_resend_child(&self, id: Uuid) -> AppResult<bool>;

    /// Auto-resend clones created after `since` for a tenant (`None` = untenanted rows).
    async fn count_auto_resends_since(
        &self,
        tenant_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> AppResult<i64>;

    async fn purge_expired_claims(&self, now: DateTime<Utc>) -> AppResult<u64>;

    /// Scrub rows of `status` created in `(delete_before, scrub_before]` that are
    /// not yet scrubbed.
    async fn scrub_terminal(
        &self,
        status: NotificationStatus,
        scrub_before: DateTime<Utc>,
        delete_before: DateTime<Utc>,
        fields: &ScrubFields,
        now: DateTime<Utc>,
    ) -> AppResult<u64>;

    async fn delete_terminal(
        &self,
        status: NotificationStatus,
        delete_before: DateTime<Utc>,
    ) -> AppResult<u64>;

    /// Sending rows leased at or before `leased_before` go back to Queued.
    async fn reclaim_stale_leases(
        &self,
        leased_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<u64>;
}

/// Build a fresh Queued row from a producer request.
pub(crate) fn new_row(
    message: &NewNotification,
    token_hash: Option<&str>,
    snapshot: Option<&RenderSnapshot>,
    now: DateTime<Utc>,
) -> Notification {
    Notification {
        id: Uuid::new_v4(),
        kind: message.kind,
        to_email: message.to_email.trim().to_string(),
        to_name: message.to_name.clone(),
        tenant_id: message.tenant_id.clone(),
        data: message.data.clone(),
        subject: snapshot.map(|s| s.subject.clone()),
        body_html: snapshot.map(|s| s.body_html.clone()),
        body_text: snapshot.and_then(|s| s.body_text.clone()),
        dedupe_key: message.dedupe_key.clone(),
        token_hash: token_hash.map(str::to_string),
        status: NotificationStatus::Queued,
        attempt_count: 0,
        next_attempt_at: None,
        last_error: None,
        created_at: now,
        updated_at: now,
        sent_at: None,
        leased_at: None,
        scrubbed_at: None,
        resend_of_id: None,
        resend_reason: None,
        resend_count: 0,
        last_resend_at: None,
        throttle_until: None,
    }
}

/// Reject resends of in-flight or scrubbed originals, and resends inside the
/// throttle window of the latest notification for the same recipient and kind.
pub(crate) fn check_resend_allowed(
    original: &Notification,
    latest_created_at: Option<DateTime<Utc>>,
    throttle_window: Duration,
    now: DateTime<Utc>,
) -> AppResult<()> {
    if original.status.is_active() {
        return Err(AppError::InvalidState(format!(
            "notification {} is {} and cannot be resent",
            original.id, original.status
        )));
    }
    if original.scrubbed_at.is_some() {
        return Err(AppError::InvalidState(format!(
            "notification {} has been scrubbed and cannot be resent",
            original.id
        )));
    }
    if let Some(latest) = latest_created_at {
        let retry_after = latest + throttle_window;
        if now < retry_after {
            return Err(AppError::Throttled { retry_after });
        }
    }
    Ok(())
}

/// Build the Queued clone for a resend. The dedupe key and provider history
/// stay with the original.
pub(crate) fn resend_clone(
    original: &Notification,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Notification {
    let mut data = original.data.clone();
    if let Some(object) = data.as_object_mut() {
        object.remove(PROVIDER_STATUS_KEY);
    }

    Notification {
        id: Uuid::new_v4(),
        kind: original.kind,
        to_email: original.to_email.clone(),
        to_name: original.to_name.clone(),
        tenant_id: original.tenant_id.clone(),
        data,
        subject: original.subject.clone(),
        body_html: original.body_html.clone(),
        body_text: original.body_text.clone(),
        dedupe_key: None,
        token_hash: original.token_hash.clone(),
        status: NotificationStatus::Queued,
        attempt_count: 0,
        next_attempt_at: None,
        last_error: None,
        created_at: now,
        updated_at: now,
        sent_at: None,
        leased_at: None,
        scrubbed_at: None,
        resend_of_id: Some(original.id),
        resend_reason: reason.map(str::to_string),
        resend_count: 0,
        last_resend_at: None,
        throttle_until: None,
    }
}

/// Clear the configured fields of a row in place.
pub(crate) fn scrub_row(row: &mut Notification, fields: &ScrubFields, now: DateTime<Utc>) {
    if fields.to_name {
        row.to_name = None;
    }
    if fields.subject {
        row.subject = None;
    }
    if fields.body_html {
        row.body_html = None;
    }
    if fields.body_text {
        row.body_text = None;
    }
    if fields.to_email {
        row.to_email = SCRUBBED_EMAIL_PLACEHOLDER.to_string();
    }
    if fields.data {
        row.data = serde_json::json!({});
    }
    row.scrubbed_at = Some(now);
    row.updated_at = now;
}

/// Bound stored error text; provider responses can be arbitrarily large.
pub(crate) fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &error[..end])
}

/// `last_error` for a leased row whose sealed columns cannot be opened.
pub(crate) fn unreadable_error(error: &AppError) -> String {
    format!("stored content unreadable: {}", error)
}

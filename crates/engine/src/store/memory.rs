//! In-memory outbox store.
//!
//! Holds the same invariants as the Postgres backend behind a single tokio
//! mutex: every operation runs under the lock, so each is atomic. Rows are
//! stored sealed, exactly as they would be persisted.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use courier_common::config::ScrubFields;
use courier_common::error::{AppError, AppResult};
use courier_common::types::{
    DedupeClaim, NewNotification, Notification, NotificationFilter, NotificationStatus,
    ProviderStatusUpdate, RenderSnapshot, Transition,
};

use super::{
    AUTO_RESEND_REASON, CandidateQuery, OutboxStore, StoreSettings, check_resend_allowed,
    new_row, resend_clone, scrub_row, truncate_error, unreadable_error,
};
use crate::dedupe::claim_is_live;
use crate::provider_status::{indicates_engagement, merge_provider_status};

#[derive(Default)]
struct MemoryState {
    /// Insertion order breaks `created_at` ties when leasing.
    rows: Vec<Notification>,
    claims: HashMap<String, DedupeClaim>,
}

impl MemoryState {
    fn find(&self, id: Uuid) -> Option<&Notification> {
        self.rows.iter().find(|r| r.id == id)
    }

    fn find_mut(&mut self, id: Uuid) -> Option<&mut Notification> {
        self.rows.iter_mut().find(|r| r.id == id)
    }

    /// Another Queued/Sending row already holds `key`.
    fn active_key_taken(&self, key: &str, except: Uuid) -> bool {
        self.rows.iter().any(|r| {
            r.id != except && r.status.is_active() && r.dedupe_key.as_deref() == Some(key)
        })
    }

    fn claim(&mut self, key: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        if let Some(existing) = self.claims.get(key)
            && claim_is_live(existing, now)
        {
            return false;
        }
        self.claims.insert(
            key.to_string(),
            DedupeClaim {
                key: key.to_string(),
                expires_at: now + ttl,
                created_at: now,
                updated_at: now,
            },
        );
        true
    }

    /// Apply `transition` to a row, returning it for further edits.
    fn transition(
        &mut self,
        id: Uuid,
        transition: Transition,
    ) -> AppResult<&mut Notification> {
        let row = self
            .find_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;
        row.status = row.status.apply(transition)?;
        Ok(row)
    }

    /// Drop the creation claim once the row holding `key` leaves the active set.
    fn release_claim(&mut self, key: Option<String>) {
        if let Some(key) = key {
            self.claims.remove(&key);
        }
    }
}

pub struct MemoryOutboxStore {
    settings: StoreSettings,
    state: Mutex<MemoryState>,
}

impl MemoryOutboxStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// The row exactly as stored, without decryption.
    pub async fn raw(&self, id: Uuid) -> Option<Notification> {
        self.state.lock().await.find(id).cloned()
    }

    /// Overwrite a stored row as-is, bypassing sealing and status rules.
    /// Returns false when no row has that id.
    pub async fn replace_raw(&self, row: Notification) -> bool {
        let mut state = self.state.lock().await;
        match state.find_mut(row.id) {
            Some(slot) => {
                *slot = row;
                true
            }
            None => false,
        }
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of stored dedupe claims, live or expired.
    pub async fn claim_count(&self) -> usize {
        self.state.lock().await.claims.len()
    }

    fn open(&self, mut row: Notification) -> AppResult<Notification> {
        self.settings.cipher.open_notification(&mut row)?;
        Ok(row)
    }
}

impl Default for MemoryOutboxStore {
    fn default() -> Self {
        Self::new(StoreSettings::default())
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn create_queued(
        &self,
        message: &NewNotification,
        token_hash: Option<&str>,
        snapshot: Option<&RenderSnapshot>,
        now: DateTime<Utc>,
    ) -> AppResult<Uuid> {
        message.validate()?;
        let mut row = new_row(message, token_hash, snapshot, now);
        self.settings.cipher.seal_notification(&mut row)?;

        let mut state = self.state.lock().await;
        if let Some(key) = &message.dedupe_key {
            if state.active_key_taken(key, row.id) {
                return Err(AppError::DuplicateActive(key.clone()));
            }
            if !state.claim(key, self.settings.claim_ttl, now) {
                return Err(AppError::DuplicateActive(key.clone()));
            }
        }

        let id = row.id;
        state.rows.push(row);
        Ok(id)
    }

    async fn lease_next_due(&self, now: DateTime<Utc>) -> AppResult<Option<Notification>> {
        let mut state = self.state.lock().await;
        loop {
            let next = state
                .rows
                .iter()
                .filter(|r| Transition::Lease.sources().contains(&r.status))
                .filter(|r| r.next_attempt_at.is_none_or(|at| at <= now))
                .min_by_key(|r| r.created_at)
                .map(|r| r.id);

            let Some(id) = next else {
                return Ok(None);
            };
            let row = state.transition(id, Transition::Lease)?;
            row.leased_at = Some(now);
            row.updated_at = now;
            let leased = row.clone();

            match self.open(leased) {
                Ok(opened) => return Ok(Some(opened)),
                Err(e) => {
                    tracing::error!(notification_id = %id, error = %e, "Leased row is unreadable, dead-lettering");
                    let row = state.transition(id, Transition::Exhaust)?;
                    row.last_error = Some(truncate_error(&unreadable_error(&e)));
                    row.updated_at = now;
                    row.attempt_count += 1;
                    let key = row.dedupe_key.clone();
                    state.release_claim(key);
                }
            }
        }
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        content: &RenderSnapshot,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        use courier_common::cipher::EncryptedField;

        let cipher = &self.settings.cipher;
        let subject = cipher.seal_field(EncryptedField::Subject, Some(&content.subject))?;
        let body_html = cipher.seal_field(EncryptedField::BodyHtml, Some(&content.body_html))?;
        let body_text = cipher.seal_field(EncryptedField::BodyText, content.body_text.as_deref())?;

        let mut state = self.state.lock().await;
        let row = state.transition(id, Transition::Succeed)?;
        row.subject = subject;
        row.body_html = body_html;
        row.body_text = body_text;
        row.sent_at = Some(now);
        row.updated_at = now;
        row.attempt_count += 1;
        let key = row.dedupe_key.clone();
        state.release_claim(key);
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let row = state.transition(id, Transition::Fail)?;
        row.last_error = Some(truncate_error(error));
        row.next_attempt_at = Some(next_attempt_at);
        row.updated_at = now;
        row.attempt_count += 1;
        let key = row.dedupe_key.clone();
        state.release_claim(key);
        Ok(())
    }

    async fn mark_dead_letter(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let row = state.transition(id, Transition::Exhaust)?;
        row.last_error = Some(truncate_error(error));
        row.updated_at = now;
        row.attempt_count += 1;
        let key = row.dedupe_key.clone();
        state.release_claim(key);
        Ok(())
    }

    async fn resume_attempt(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        let Some(row) = state.find(id) else {
            return Ok(false);
        };
        if row.status.apply(Transition::Resume).is_err() {
            return Ok(false);
        }
        if let Some(key) = row.dedupe_key.clone()
            && state.active_key_taken(&key, id)
        {
            return Ok(false);
        }

        let row = state.transition(id, Transition::Resume)?;
        row.leased_at = Some(now);
        row.updated_at = now;
        Ok(true)
    }

    async fn try_requeue(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        let Some(row) = state.find(id) else {
            return Ok(false);
        };
        if row.status.apply(Transition::Requeue).is_err() {
            return Ok(false);
        }
        if let Some(key) = row.dedupe_key.clone()
            && state.active_key_taken(&key, id)
        {
            return Err(AppError::DuplicateActive(key));
        }

        let row = state.transition(id, Transition::Requeue)?;
        row.next_attempt_at = None;
        row.last_error = None;
        row.leased_at = None;
        row.updated_at = now;
        Ok(true)
    }

    async fn record_provider_status(
        &self,
        id: Uuid,
        update: &ProviderStatusUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let row = state
            .find_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;
        merge_provider_status(&mut row.data, update);
        row.updated_at = now;
        Ok(())
    }

    async fn try_claim(&self, key: &str, now: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state.claim(key, self.settings.claim_ttl, now))
    }

    async fn get(&self, id: Uuid) -> AppResult<Notification> {
        let row = self
            .state
            .lock()
            .await
            .find(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;
        self.open(row)
    }

    async fn list(&self, filter: &NotificationFilter) -> AppResult<Vec<Notification>> {
        let mut rows: Vec<Notification> = self
            .state
            .lock()
            .await
            .rows
            .iter()
            .filter(|r| {
                filter
                    .tenant_id
                    .as_ref()
                    .is_none_or(|t| r.tenant_id.as_ref() == Some(t))
            })
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(filter.effective_limit() as usize);

        rows.into_iter().map(|r| self.open(r)).collect()
    }

    async fn create_resend(
        &self,
        original_id: Uuid,
        reason: Option<&str>,
        throttle_window: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<Notification> {
        let mut state = self.state.lock().await;
        let original = state
            .find(original_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", original_id)))?;

        let latest = state
            .rows
            .iter()
            .filter(|r| r.to_email == original.to_email && r.kind == original.kind)
            .map(|r| r.created_at)
            .max();
        check_resend_allowed(&original, latest, throttle_window, now)?;

        let original = self.open(original)?;
        let clone = resend_clone(&original, reason, now);
        let mut sealed = clone.clone();
        self.settings.cipher.seal_notification(&mut sealed)?;
        state.rows.push(sealed);

        if let Some(parent) = state.find_mut(original_id) {
            parent.resend_count += 1;
            parent.last_resend_at = Some(now);
            parent.throttle_until = Some(now + throttle_window);
            parent.updated_at = now;
        }

        Ok(clone)
    }

    async fn auto_resend_candidates(&self, query: &CandidateQuery) -> AppResult<Vec<Notification>> {
        let state = self.state.lock().await;
        let mut candidates: Vec<Notification> = state
            .rows
            .iter()
            .filter(|r| r.status == NotificationStatus::Sent)
            .filter(|r| r.resend_of_id.is_none() && r.scrubbed_at.is_none())
            .filter(|r| r.sent_at.is_some_and(|at| at <= query.sent_before))
            .filter(|r| query.kinds.contains(&r.kind))
            .filter(|r| !state.rows.iter().any(|c| c.resend_of_id == Some(r.id)))
            .filter(|r| !indicates_engagement(&r.data))
            .cloned()
            .collect();
        drop(state);

        candidates.sort_by_key(|r| r.sent_at);
        candidates.truncate(query.limit.max(0) as usize);
        candidates.into_iter().map(|r| self.open(r)).collect()
    }

    async fn has_resend_child(&self, id: Uuid) -> AppResult<bool> {
        let state = self.state.lock().await;
        Ok(state.rows.iter().any(|r| r.resend_of_id == Some(id)))
    }

    async fn count_auto_resends_since(
        &self,
        tenant_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> AppResult<i64> {
        let state = self.state.lock().await;
        let count = state
            .rows
            .iter()
            .filter(|r| r.resend_reason.as_deref() == Some(AUTO_RESEND_REASON))
            .filter(|r| r.created_at > since)
            .filter(|r| r.tenant_id.as_deref() == tenant_id)
            .count();
        Ok(count as i64)
    }

    async fn purge_expired_claims(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.claims.len();
        state.claims.retain(|_, claim| claim_is_live(claim, now));
        Ok((before - state.claims.len()) as u64)
    }

    async fn scrub_terminal(
        &self,
        status: NotificationStatus,
        scrub_before: DateTime<Utc>,
        delete_before: DateTime<Utc>,
        fields: &ScrubFields,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        if status.is_active() {
            return Ok(0);
        }
        let mut state = self.state.lock().await;
        let mut scrubbed = 0;
        for row in state.rows.iter_mut().filter(|r| {
            r.status == status
                && r.scrubbed_at.is_none()
                && r.created_at <= scrub_before
                && r.created_at > delete_before
        }) {
            scrub_row(row, fields, now);
            scrubbed += 1;
        }
        Ok(scrubbed)
    }

    async fn delete_terminal(
        &self,
        status: NotificationStatus,
        delete_before: DateTime<Utc>,
    ) -> AppResult<u64> {
        if status.is_active() {
            return Ok(0);
        }
        let mut state = self.state.lock().await;
        let doomed: Vec<Uuid> = state
            .rows
            .iter()
            .filter(|r| r.status == status && r.created_at <= delete_before)
            .map(|r| r.id)
            .collect();

        state.rows.retain(|r| !doomed.contains(&r.id));
        // Mirrors ON DELETE SET NULL on resend_of_id.
        for row in state.rows.iter_mut() {
            if row.resend_of_id.is_some_and(|p| doomed.contains(&p)) {
                row.resend_of_id = None;
            }
        }
        Ok(doomed.len() as u64)
    }

    async fn reclaim_stale_leases(
        &self,
        leased_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        let mut state = self.state.lock().await;
        let mut reclaimed = 0;
        for row in state.rows.iter_mut().filter(|r| {
            Transition::Reclaim.sources().contains(&r.status)
                && r.leased_at.is_some_and(|at| at <= leased_before)
        }) {
            row.status = row.status.apply(Transition::Reclaim)?;
            row.leased_at = None;
            row.updated_at = now;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}

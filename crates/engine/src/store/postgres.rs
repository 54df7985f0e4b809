//! Postgres outbox store.
//!
//! Every status guard is derived from `Transition::sources`. Transitions that
//! take a row out of the active set also delete its dedupe claim in the same
//! statement.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use courier_common::cipher::EncryptedField;
use courier_common::config::ScrubFields;
use courier_common::error::{AppError, AppResult};
use courier_common::types::{
    NewNotification, Notification, NotificationFilter, NotificationStatus, ProviderStatusUpdate,
    RenderSnapshot, Transition,
};

use super::{
    AUTO_RESEND_REASON, CandidateQuery, OutboxStore, SCRUBBED_EMAIL_PLACEHOLDER, StoreSettings,
    check_resend_allowed, new_row, resend_clone, truncate_error, unreadable_error,
};
use crate::provider_status::{ENGAGED_STATUSES, merge_provider_status};

const CLAIM_SQL: &str = r#"
    INSERT INTO dedupe_claims (key, expires_at, created_at, updated_at)
    VALUES ($1, $2, $3, $3)
    ON CONFLICT (key) DO UPDATE
    SET expires_at = EXCLUDED.expires_at,
        created_at = EXCLUDED.created_at,
        updated_at = EXCLUDED.updated_at
    WHERE dedupe_claims.expires_at <= EXCLUDED.created_at
    RETURNING key
"#;

pub struct PgOutboxStore {
    pool: PgPool,
    settings: StoreSettings,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool, settings: StoreSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn open(&self, mut row: Notification) -> AppResult<Notification> {
        self.settings.cipher.open_notification(&mut row)?;
        Ok(row)
    }

    async fn claim(
        &self,
        conn: &mut PgConnection,
        key: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let claimed: Option<(String,)> = sqlx::query_as(CLAIM_SQL)
            .bind(key)
            .bind(now + self.settings.claim_ttl)
            .bind(now)
            .fetch_optional(conn)
            .await?;
        Ok(claimed.is_some())
    }

    /// Explain why a guarded update touched no row.
    async fn transition_miss(&self, id: Uuid, transition: Transition) -> AppError {
        let status: Result<Option<NotificationStatus>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM notifications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;

        match status {
            Ok(Some(status)) => match status.apply(transition) {
                Err(e) => e,
                Ok(_) => AppError::Internal(format!(
                    "notification {} changed concurrently during {:?}",
                    id, transition
                )),
            },
            Ok(None) => AppError::NotFound(format!("Notification {} not found", id)),
            Err(e) => e.into(),
        }
    }

    /// Flip the oldest due Queued row to Sending and return it still sealed.
    async fn lease_one(&self, now: DateTime<Utc>) -> AppResult<Option<Notification>> {
        let leased: Option<Notification> = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = $1, leased_at = $2, updated_at = $2
            WHERE id = (
                SELECT id FROM notifications
                WHERE status = ANY($3)
                  AND (next_attempt_at IS NULL OR next_attempt_at <= $2)
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(Transition::Lease.target().as_str())
        .bind(now)
        .bind(Transition::Lease.source_names())
        .fetch_optional(&self.pool)
        .await?;

        Ok(leased)
    }

    /// Map the result of a guarded update onto `Ok` or the reason it missed.
    async fn finish(
        &self,
        id: Uuid,
        transition: Transition,
        updated: Option<(Uuid,)>,
    ) -> AppResult<()> {
        match updated {
            Some(_) => Ok(()),
            None => Err(self.transition_miss(id, transition).await),
        }
    }
}

/// A guarded update that counts an attempt, moves the row out of the active
/// set and releases its dedupe claim.
///
/// Binds: `$1` id, `$2` target status, `$3` now, `$4` source statuses; the
/// extra `set_clause` assignments start at `$5`.
fn leave_active_sql(set_clause: &str) -> String {
    format!(
        r#"
        WITH updated AS (
            UPDATE notifications
            SET status = $2,
                updated_at = $3,
                attempt_count = attempt_count + 1,
                {set_clause}
            WHERE id = $1 AND status = ANY($4)
            RETURNING id, dedupe_key
        ), released AS (
            DELETE FROM dedupe_claims
            WHERE key IN (SELECT dedupe_key FROM updated WHERE dedupe_key IS NOT NULL)
            RETURNING key
        )
        SELECT id FROM updated
        "#
    )
}

/// Insert a fully-built (already sealed) row.
async fn insert_row(conn: &mut PgConnection, row: &Notification) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO notifications (
            id, kind, to_email, to_name, tenant_id, data,
            subject, body_html, body_text, dedupe_key, token_hash,
            status, attempt_count, next_attempt_at, last_error,
            created_at, updated_at, sent_at, leased_at, scrubbed_at,
            resend_of_id, resend_reason, resend_count, last_resend_at, throttle_until
        )
        VALUES (
            $1, $2, $3, $4, $5, $6,
            $7, $8, $9, $10, $11,
            $12, $13, $14, $15,
            $16, $17, $18, $19, $20,
            $21, $22, $23, $24, $25
        )
        "#,
    )
    .bind(row.id)
    .bind(row.kind.as_str())
    .bind(&row.to_email)
    .bind(&row.to_name)
    .bind(&row.tenant_id)
    .bind(&row.data)
    .bind(&row.subject)
    .bind(&row.body_html)
    .bind(&row.body_text)
    .bind(&row.dedupe_key)
    .bind(&row.token_hash)
    .bind(row.status.as_str())
    .bind(row.attempt_count)
    .bind(row.next_attempt_at)
    .bind(&row.last_error)
    .bind(row.created_at)
    .bind(row.updated_at)
    .bind(row.sent_at)
    .bind(row.leased_at)
    .bind(row.scrubbed_at)
    .bind(row.resend_of_id)
    .bind(&row.resend_reason)
    .bind(row.resend_count)
    .bind(row.last_resend_at)
    .bind(row.throttle_until)
    .execute(conn)
    .await?;
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
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

        let mut tx = self.pool.begin().await?;
        if let Some(key) = &message.dedupe_key
            && !self.claim(&mut tx, key, now).await?
        {
            return Err(AppError::DuplicateActive(key.clone()));
        }

        if let Err(e) = insert_row(&mut tx, &row).await {
            if is_unique_violation(&e) {
                return Err(AppError::DuplicateActive(
                    message.dedupe_key.clone().unwrap_or_default(),
                ));
            }
            return Err(e.into());
        }
        tx.commit().await?;

        Ok(row.id)
    }

    async fn lease_next_due(&self, now: DateTime<Utc>) -> AppResult<Option<Notification>> {
        loop {
            let Some(row) = self.lease_one(now).await? else {
                return Ok(None);
            };
            let id = row.id;
            match self.open(row) {
                Ok(opened) => return Ok(Some(opened)),
                Err(e) => {
                    tracing::error!(notification_id = %id, error = %e, "Leased row is unreadable, dead-lettering");
                    self.mark_dead_letter(id, &unreadable_error(&e), now).await?;
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
        let cipher = &self.settings.cipher;
        let subject = cipher.seal_field(EncryptedField::Subject, Some(&content.subject))?;
        let body_html = cipher.seal_field(EncryptedField::BodyHtml, Some(&content.body_html))?;
        let body_text = cipher.seal_field(EncryptedField::BodyText, content.body_text.as_deref())?;

        let transition = Transition::Succeed;
        let sql = leave_active_sql("subject = $5, body_html = $6, body_text = $7, sent_at = $3");
        let updated = sqlx::query_as(&sql)
            .bind(id)
            .bind(transition.target().as_str())
            .bind(now)
            .bind(transition.source_names())
            .bind(subject)
            .bind(body_html)
            .bind(body_text)
            .fetch_optional(&self.pool)
            .await?;
        self.finish(id, transition, updated).await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let transition = Transition::Fail;
        let sql = leave_active_sql("last_error = $5, next_attempt_at = $6");
        let updated = sqlx::query_as(&sql)
            .bind(id)
            .bind(transition.target().as_str())
            .bind(now)
            .bind(transition.source_names())
            .bind(truncate_error(error))
            .bind(next_attempt_at)
            .fetch_optional(&self.pool)
            .await?;
        self.finish(id, transition, updated).await
    }

    async fn mark_dead_letter(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> AppResult<()> {
        let transition = Transition::Exhaust;
        let sql = leave_active_sql("last_error = $5");
        let updated = sqlx::query_as(&sql)
            .bind(id)
            .bind(transition.target().as_str())
            .bind(now)
            .bind(transition.source_names())
            .bind(truncate_error(error))
            .fetch_optional(&self.pool)
            .await?;
        self.finish(id, transition, updated).await
    }

    async fn resume_attempt(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $2, leased_at = $3, updated_at = $3
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id)
        .bind(Transition::Resume.target().as_str())
        .bind(now)
        .bind(Transition::Resume.source_names())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn try_requeue(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $2,
                next_attempt_at = NULL,
                last_error = NULL,
                leased_at = NULL,
                updated_at = $3
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id)
        .bind(Transition::Requeue.target().as_str())
        .bind(now)
        .bind(Transition::Requeue.source_names())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) if is_unique_violation(&e) => Err(AppError::DuplicateActive(format!(
                "dedupe key of notification {} is held by an active notification",
                id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_provider_status(
        &self,
        id: Uuid,
        update: &ProviderStatusUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let mut data: serde_json::Value =
            sqlx::query_scalar("SELECT data FROM notifications WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;

        merge_provider_status(&mut data, update);

        sqlx::query("UPDATE notifications SET data = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(&data)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn try_claim(&self, key: &str, now: DateTime<Utc>) -> AppResult<bool> {
        let mut conn = self.pool.acquire().await?;
        self.claim(&mut conn, key, now).await
    }

    async fn get(&self, id: Uuid) -> AppResult<Notification> {
        let row: Notification = sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;
        self.open(row)
    }

    async fn list(&self, filter: &NotificationFilter) -> AppResult<Vec<Notification>> {
        let rows: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE ($1::text IS NULL OR tenant_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(&filter.tenant_id)
        .bind(filter.status.map(NotificationStatus::as_str))
        .bind(filter.effective_limit())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.open(r)).collect()
    }

    async fn create_resend(
        &self,
        original_id: Uuid,
        reason: Option<&str>,
        throttle_window: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<Notification> {
        let mut tx = self.pool.begin().await?;

        let original: Notification =
            sqlx::query_as("SELECT * FROM notifications WHERE id = $1 FOR UPDATE")
                .bind(original_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("Notification {} not found", original_id))
                })?;

        // Serializes the throttle check and insert per (recipient, kind).
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{}", original.to_email, original.kind.as_str()))
            .execute(&mut *tx)
            .await?;

        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM notifications WHERE to_email = $1 AND kind = $2",
        )
        .bind(&original.to_email)
        .bind(original.kind.as_str())
        .fetch_one(&mut *tx)
        .await?;

        check_resend_allowed(&original, latest, throttle_window, now)?;

        let original = self.open(original)?;
        let clone = resend_clone(&original, reason, now);
        let mut sealed = clone.clone();
        self.settings.cipher.seal_notification(&mut sealed)?;
        insert_row(&mut tx, &sealed).await?;

        sqlx::query(
            r#"
            UPDATE notifications
            SET resend_count = resend_count + 1,
                last_resend_at = $2,
                throttle_until = $3,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(original_id)
        .bind(now)
        .bind(now + throttle_window)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(clone)
    }

    async fn auto_resend_candidates(&self, query: &CandidateQuery) -> AppResult<Vec<Notification>> {
        let kinds: Vec<&str> = query.kinds.iter().map(|k| k.as_str()).collect();
        let engaged: Vec<&str> = ENGAGED_STATUSES.to_vec();

        let rows: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT n.* FROM notifications n
            WHERE n.status = $1
              AND n.resend_of_id IS NULL
              AND n.scrubbed_at IS NULL
              AND n.sent_at <= $2
              AND n.kind = ANY($3)
              AND NOT EXISTS (
                  SELECT 1 FROM notifications c WHERE c.resend_of_id = n.id
              )
              AND NOT (
                  COALESCE(n.data #> '{provider_status,events}', '{}'::jsonb) ?| $4::text[]
              )
            ORDER BY n.sent_at ASC
            LIMIT $5
            "#,
        )
        .bind(NotificationStatus::Sent.as_str())
        .bind(query.sent_before)
        .bind(&kinds)
        .bind(&engaged)
        .bind(query.limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.open(r)).collect()
    }

    async fn has_resend_child(&self, id: Uuid) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM notifications WHERE resend_of_id = $1)",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn count_auto_resends_since(
        &self,
        tenant_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM notifications
            WHERE resend_reason = $1
              AND created_at > $2
              AND tenant_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(AUTO_RESEND_REASON)
        .bind(since)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn purge_expired_claims(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM dedupe_claims WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
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
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET to_name   = CASE WHEN $5 THEN NULL ELSE to_name END,
                subject   = CASE WHEN $6 THEN NULL ELSE subject END,
                body_html = CASE WHEN $7 THEN NULL ELSE body_html END,
                body_text = CASE WHEN $8 THEN NULL ELSE body_text END,
                to_email  = CASE WHEN $9 THEN $10 ELSE to_email END,
                data      = CASE WHEN $11 THEN '{}'::jsonb ELSE data END,
                scrubbed_at = $4,
                updated_at = $4
            WHERE status = $1
              AND created_at <= $2
              AND created_at > $3
              AND scrubbed_at IS NULL
            "#,
        )
        .bind(status.as_str())
        .bind(scrub_before)
        .bind(delete_before)
        .bind(now)
        .bind(fields.to_name)
        .bind(fields.subject)
        .bind(fields.body_html)
        .bind(fields.body_text)
        .bind(fields.to_email)
        .bind(SCRUBBED_EMAIL_PLACEHOLDER)
        .bind(fields.data)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_terminal(
        &self,
        status: NotificationStatus,
        delete_before: DateTime<Utc>,
    ) -> AppResult<u64> {
        if status.is_active() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM notifications WHERE status = $1 AND created_at <= $2")
            .bind(status.as_str())
            .bind(delete_before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn reclaim_stale_leases(
        &self,
        leased_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1, leased_at = NULL, updated_at = $2
            WHERE status = ANY($3) AND leased_at <= $4
            "#,
        )
        .bind(Transition::Reclaim.target().as_str())
        .bind(now)
        .bind(Transition::Reclaim.source_names())
        .bind(leased_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

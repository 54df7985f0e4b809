//! Outbox service: the producer-facing entry point.
//!
//! Creation is durable first (claim + row in one transaction), then the
//! transport signal is published best-effort.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_common::error::AppResult;
use courier_common::types::{
    NewNotification, Notification, NotificationFilter, ProviderStatusUpdate, RenderSnapshot,
};

use crate::signal::TransportSignal;
use crate::store::OutboxStore;

/// Optional extras attached at creation time.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Hash of a one-time token embedded in the message, kept for correlation.
    pub token_hash: Option<String>,
    /// Pre-rendered content; dispatch skips the renderer when present.
    pub snapshot: Option<RenderSnapshot>,
}

#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn OutboxStore>,
    signal: TransportSignal,
}

impl Outbox {
    pub fn new(store: Arc<dyn OutboxStore>, signal: TransportSignal) -> Self {
        Self { store, signal }
    }

    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    pub fn signal(&self) -> &TransportSignal {
        &self.signal
    }

    /// Persist a Queued notification and wake the dispatcher.
    pub async fn enqueue(&self, message: NewNotification, options: EnqueueOptions) -> AppResult<Uuid> {
        self.enqueue_at(message, options, Utc::now()).await
    }

    pub async fn enqueue_at(
        &self,
        message: NewNotification,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> AppResult<Uuid> {
        let id = self
            .store
            .create_queued(
                &message,
                options.token_hash.as_deref(),
                options.snapshot.as_ref(),
                now,
            )
            .await
            .inspect_err(|e| {
                tracing::debug!(
                    kind = %message.kind,
                    dedupe_key = ?message.dedupe_key,
                    error = %e,
                    "Notification not created"
                );
            })?;

        tracing::info!(
            notification_id = %id,
            kind = %message.kind,
            tenant_id = ?message.tenant_id,
            "Notification queued"
        );

        self.signal.publish(id).await;
        Ok(id)
    }

    /// Operator requeue of a Failed/DeadLetter row.
    pub async fn requeue(&self, id: Uuid) -> AppResult<bool> {
        self.requeue_at(id, Utc::now()).await
    }

    pub async fn requeue_at(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let requeued = self.store.try_requeue(id, now).await?;
        if requeued {
            tracing::info!(notification_id = %id, "Notification requeued");
            self.signal.publish(id).await;
        } else {
            tracing::debug!(notification_id = %id, "Requeue skipped: not failed or dead-lettered");
        }
        Ok(requeued)
    }

    pub async fn record_provider_status(
        &self,
        id: Uuid,
        update: &ProviderStatusUpdate,
    ) -> AppResult<()> {
        self.record_provider_status_at(id, update, Utc::now()).await
    }

    pub async fn record_provider_status_at(
        &self,
        id: Uuid,
        update: &ProviderStatusUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        self.store.record_provider_status(id, update, now).await?;
        tracing::info!(
            notification_id = %id,
            provider = %update.provider,
            status = %update.status,
            "Provider status recorded"
        );
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Notification> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &NotificationFilter) -> AppResult<Vec<Notification>> {
        self.store.list(filter).await
    }
}

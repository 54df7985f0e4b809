//! Resend manager: operator-initiated resends and the periodic auto-resend scan
//! for notifications that were sent but never delivered or opened.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use courier_common::config::{AutoResendConfig, ResendConfig};
use courier_common::error::{AppError, AppResult};
use courier_common::types::Notification;

use crate::provider_status::indicates_engagement;
use crate::signal::TransportSignal;
use crate::store::{AUTO_RESEND_REASON, CandidateQuery, OutboxStore};

#[derive(Clone)]
pub struct ResendManager {
    store: Arc<dyn OutboxStore>,
    signal: TransportSignal,
    throttle_window: Duration,
}

impl ResendManager {
    pub fn new(store: Arc<dyn OutboxStore>, signal: TransportSignal, config: &ResendConfig) -> Self {
        Self {
            store,
            signal,
            throttle_window: config.throttle_window(),
        }
    }

    pub fn throttle_window(&self) -> Duration {
        self.throttle_window
    }

    /// Clone a terminal notification into a new Queued row.
    pub async fn resend(&self, original_id: Uuid, reason: Option<&str>) -> AppResult<Notification> {
        self.resend_at(original_id, reason, Utc::now()).await
    }

    pub async fn resend_at(
        &self,
        original_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<Notification> {
        let clone = self
            .store
            .create_resend(original_id, reason, self.throttle_window, now)
            .await?;

        tracing::info!(
            notification_id = %clone.id,
            resend_of_id = %original_id,
            kind = %clone.kind,
            reason = ?reason,
            "Notification resent"
        );

        self.signal.publish(clone.id).await;
        Ok(clone)
    }
}

/// Per-scan tally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub candidates: usize,
    pub resent: usize,
    pub skipped_child: usize,
    pub skipped_engaged: usize,
    pub skipped_cap: usize,
    pub skipped_throttled: usize,
    pub errors: usize,
}

pub struct AutoResendScanner {
    store: Arc<dyn OutboxStore>,
    manager: ResendManager,
    config: AutoResendConfig,
}

impl AutoResendScanner {
    pub fn new(store: Arc<dyn OutboxStore>, manager: ResendManager, config: AutoResendConfig) -> Self {
        Self {
            store,
            manager,
            config,
        }
    }

    /// Run one scan at `now`.
    pub async fn scan(&self, now: DateTime<Utc>) -> AppResult<ScanReport> {
        let query = CandidateQuery {
            sent_before: now - self.config.no_action_window(),
            kinds: self.config.kinds.clone(),
            limit: self.config.max_per_scan,
        };
        let candidates = self.store.auto_resend_candidates(&query).await?;

        let mut report = ScanReport {
            candidates: candidates.len(),
            ..ScanReport::default()
        };
        // Rolling 24h count per tenant, seeded lazily from the store.
        let mut tenant_counts: HashMap<Option<String>, i64> = HashMap::new();
        let since = now - Duration::hours(24);

        for candidate in candidates {
            match self.store.has_resend_child(candidate.id).await {
                Ok(true) => {
                    report.skipped_child += 1;
                    tracing::debug!(
                        notification_id = %candidate.id,
                        "Auto-resend skipped: already resent"
                    );
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        notification_id = %candidate.id,
                        error = %e,
                        "Auto-resend child check failed"
                    );
                    continue;
                }
            }

            if indicates_engagement(&candidate.data) {
                report.skipped_engaged += 1;
                tracing::debug!(
                    notification_id = %candidate.id,
                    "Auto-resend skipped: delivered or opened"
                );
                continue;
            }

            let tenant = candidate.tenant_id.clone();
            let count = match tenant_counts.get(&tenant) {
                Some(count) => *count,
                None => match self.store.count_auto_resends_since(tenant.as_deref(), since).await {
                    Ok(count) => {
                        tenant_counts.insert(tenant.clone(), count);
                        count
                    }
                    Err(e) => {
                        report.errors += 1;
                        tracing::error!(
                            tenant_id = ?tenant,
                            error = %e,
                            "Auto-resend cap lookup failed"
                        );
                        continue;
                    }
                },
            };
            if count >= self.config.daily_cap_per_tenant {
                report.skipped_cap += 1;
                tracing::debug!(
                    notification_id = %candidate.id,
                    tenant_id = ?tenant,
                    cap = self.config.daily_cap_per_tenant,
                    "Auto-resend skipped: tenant cap reached"
                );
                continue;
            }

            match self
                .manager
                .resend_at(candidate.id, Some(AUTO_RESEND_REASON), now)
                .await
            {
                Ok(_) => {
                    report.resent += 1;
                    *tenant_counts.entry(tenant).or_insert(0) += 1;
                }
                Err(e @ (AppError::Throttled { .. } | AppError::InvalidState(_))) => {
                    report.skipped_throttled += 1;
                    tracing::debug!(
                        notification_id = %candidate.id,
                        reason = %e,
                        "Auto-resend skipped"
                    );
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        notification_id = %candidate.id,
                        error = %e,
                        "Auto-resend failed"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Scan on a fixed interval until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            tracing::info!("Auto-resend disabled");
            return;
        }

        let period = StdDuration::from_secs(self.config.interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.config.interval_secs,
            no_action_hours = self.config.no_action_hours,
            "Auto-resend scanner started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.scan(Utc::now()).await {
                        Ok(report) if report.candidates > 0 => {
                            tracing::info!(
                                candidates = report.candidates,
                                resent = report.resent,
                                skipped_child = report.skipped_child,
                                skipped_engaged = report.skipped_engaged,
                                skipped_cap = report.skipped_cap,
                                skipped_throttled = report.skipped_throttled,
                                errors = report.errors,
                                "Auto-resend scan complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Auto-resend scan failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Auto-resend scanner stopped");
    }
}

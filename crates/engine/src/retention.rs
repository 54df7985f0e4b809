//! Retention sweep: expired claim purge, PII scrub and hard delete of terminal
//! rows, plus the opt-in stale-lease reclaim.
//!
//! Jobs are independent; a failing job is logged and counted, and the rest of
//! the sweep still runs.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use courier_common::config::RetentionConfig;
use courier_common::types::NotificationStatus;

use crate::store::OutboxStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claims_purged: u64,
    pub scrubbed: u64,
    pub deleted: u64,
    pub reclaimed: u64,
    pub failed_jobs: usize,
}

impl SweepReport {
    pub fn touched(&self) -> u64 {
        self.claims_purged + self.scrubbed + self.deleted + self.reclaimed
    }
}

pub struct RetentionSweep {
    store: Arc<dyn OutboxStore>,
    config: RetentionConfig,
}

impl RetentionSweep {
    pub fn new(store: Arc<dyn OutboxStore>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self.store.purge_expired_claims(now).await {
            Ok(n) => report.claims_purged = n,
            Err(e) => {
                report.failed_jobs += 1;
                tracing::error!(error = %e, "Dedupe claim purge failed");
            }
        }

        for status in NotificationStatus::RETAINED {
            let Some(window) = self.config.window_for(status) else {
                continue;
            };
            let scrub_before = now - window.scrub_after();
            let delete_before = now - window.delete_after();

            match self
                .store
                .scrub_terminal(
                    status,
                    scrub_before,
                    delete_before,
                    &self.config.scrub_fields,
                    now,
                )
                .await
            {
                Ok(n) => report.scrubbed += n,
                Err(e) => {
                    report.failed_jobs += 1;
                    tracing::error!(status = %status, error = %e, "Retention scrub failed");
                }
            }

            match self.store.delete_terminal(status, delete_before).await {
                Ok(n) => report.deleted += n,
                Err(e) => {
                    report.failed_jobs += 1;
                    tracing::error!(status = %status, error = %e, "Retention delete failed");
                }
            }
        }

        if let Some(secs) = self.config.lease_reclaim_after_secs {
            let leased_before = now - Duration::seconds(secs as i64);
            match self.store.reclaim_stale_leases(leased_before, now).await {
                Ok(n) => {
                    if n > 0 {
                        tracing::warn!(reclaimed = n, "Reclaimed stale Sending leases");
                    }
                    report.reclaimed = n;
                }
                Err(e) => {
                    report.failed_jobs += 1;
                    tracing::error!(error = %e, "Stale lease reclaim failed");
                }
            }
        }

        report
    }

    /// Sweep on a fixed interval until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = StdDuration::from_secs(self.config.sweep_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.config.sweep_interval_secs,
            reclaim_after_secs = ?self.config.lease_reclaim_after_secs,
            "Retention sweep started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep(Utc::now()).await;
                    if report.touched() > 0 || report.failed_jobs > 0 {
                        tracing::info!(
                            claims_purged = report.claims_purged,
                            scrubbed = report.scrubbed,
                            deleted = report.deleted,
                            reclaimed = report.reclaimed,
                            failed_jobs = report.failed_jobs,
                            "Retention sweep complete"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Retention sweep stopped");
    }
}

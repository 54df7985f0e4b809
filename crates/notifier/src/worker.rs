//! Dispatch worker: leases due notifications and drives each through a bounded
//! attempt burst.
//!
//! A burst runs every try from Sending. Between tries the row is parked in
//! Failed (bookkeeping only, never re-leased) and resumed for the next try.
//! The burst ends in Sent or DeadLetter, or stops without a finalizing write
//! when the row is taken over or shutdown is requested.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use courier_common::cipher::{ENVELOPE_PREFIX, looks_sealed};
use courier_common::config::DispatchConfig;
use courier_common::types::{Notification, RenderSnapshot};
use courier_engine::{OutboxStore, SignalReceiver};

use crate::render::TemplateRenderer;
use crate::sender::{OutgoingEmail, Sender};

/// Retry budget and backoff for one attempt burst.
#[derive(Debug, Clone)]
pub struct AttemptPolicy {
    pub max_attempts: u32,
    /// Delay after try `n` is `schedule[min(n - 1, len - 1)]`.
    pub schedule: Vec<Duration>,
    /// Symmetric jitter fraction applied to each delay.
    pub jitter: f64,
}

impl Default for AttemptPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            schedule: vec![
                Duration::from_millis(500),
                Duration::from_secs(2),
                Duration::from_secs(8),
            ],
            jitter: 0.2,
        }
    }
}

impl AttemptPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Un-jittered delay after the given 1-based try.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let Some(last) = self.schedule.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (attempt.saturating_sub(1) as usize).min(last);
        self.schedule[index]
    }

    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor)
    }
}

/// How one leased notification ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstOutcome {
    Sent { attempts: u32 },
    DeadLettered { attempts: u32 },
    /// The row left Failed between tries (requeued, or its key was taken).
    Superseded,
    /// Shutdown arrived mid-burst; the row keeps its last status.
    Cancelled,
    /// A finalizing store write failed; the row keeps its last status.
    StoreError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub leased: usize,
    pub sent: usize,
    pub dead_lettered: usize,
    pub superseded: usize,
    pub cancelled: usize,
    pub store_errors: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: BurstOutcome) {
        match outcome {
            BurstOutcome::Sent { .. } => self.sent += 1,
            BurstOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            BurstOutcome::Superseded => self.superseded += 1,
            BurstOutcome::Cancelled => self.cancelled += 1,
            BurstOutcome::StoreError => self.store_errors += 1,
        }
    }
}

pub struct DispatchWorker {
    store: Arc<dyn OutboxStore>,
    renderer: Arc<dyn TemplateRenderer>,
    sender: Arc<dyn Sender>,
    policy: AttemptPolicy,
    poll_interval: Duration,
}

impl DispatchWorker {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        renderer: Arc<dyn TemplateRenderer>,
        sender: Arc<dyn Sender>,
        policy: AttemptPolicy,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            renderer,
            sender,
            policy,
            poll_interval,
        }
    }

    pub fn policy(&self) -> &AttemptPolicy {
        &self.policy
    }

    /// Wake on signal or poll tick and drain until `shutdown` flips to true.
    pub async fn run(self, mut signal: SignalReceiver, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut signal_open = true;

        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            max_attempts = self.policy.max_attempts,
            "Dispatch worker started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                wakeup = signal.recv(), if signal_open => {
                    if wakeup.is_none() {
                        tracing::warn!("Signal source closed, falling back to polling");
                        signal_open = false;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            let report = self.drain(&mut shutdown).await;
            if report.leased > 0 {
                tracing::info!(
                    leased = report.leased,
                    sent = report.sent,
                    dead_lettered = report.dead_lettered,
                    superseded = report.superseded,
                    cancelled = report.cancelled,
                    store_errors = report.store_errors,
                    "Dispatch drain complete"
                );
            }
            if report.cancelled > 0 || is_shutdown(&shutdown) {
                break;
            }
        }

        tracing::info!("Dispatch worker stopped");
    }

    /// Lease and process due rows until none remain.
    pub async fn drain(&self, shutdown: &mut watch::Receiver<bool>) -> DrainReport {
        let mut report = DrainReport::default();

        while !is_shutdown(shutdown) {
            let row = match self.store.lease_next_due(Utc::now()).await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to lease next notification");
                    report.store_errors += 1;
                    break;
                }
            };

            report.leased += 1;
            let outcome = self.run_burst(row, shutdown).await;
            report.record(outcome);
            if outcome == BurstOutcome::Cancelled {
                break;
            }
        }

        report
    }

    /// Drive one leased row through its attempt burst.
    pub async fn run_burst(
        &self,
        row: Notification,
        shutdown: &mut watch::Receiver<bool>,
    ) -> BurstOutcome {
        let id = row.id;
        tracing::info!(notification_id = %id, kind = %row.kind, "Notification leased");

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let error = match self.attempt(&row).await {
                Ok(content) => {
                    return match self.store.mark_sent(id, &content, Utc::now()).await {
                        Ok(()) => {
                            tracing::info!(notification_id = %id, attempt, "Notification sent");
                            BurstOutcome::Sent { attempts: attempt }
                        }
                        Err(e) => {
                            tracing::error!(notification_id = %id, error = %e, "Failed to mark sent");
                            BurstOutcome::StoreError
                        }
                    };
                }
                Err(error) => error,
            };

            if attempt >= self.policy.max_attempts {
                tracing::warn!(
                    notification_id = %id,
                    attempt,
                    error = %error,
                    "Notification dead-lettered"
                );
                return match self.store.mark_dead_letter(id, &error, Utc::now()).await {
                    Ok(()) => BurstOutcome::DeadLettered { attempts: attempt },
                    Err(e) => {
                        tracing::error!(notification_id = %id, error = %e, "Failed to mark dead letter");
                        BurstOutcome::StoreError
                    }
                };
            }

            let delay = self.policy.jittered_delay(attempt);
            let now = Utc::now();
            let next_attempt_at =
                now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            tracing::warn!(
                notification_id = %id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Send attempt failed, retrying"
            );
            if let Err(e) = self.store.mark_failed(id, &error, next_attempt_at, now).await {
                tracing::error!(notification_id = %id, error = %e, "Failed to mark failed");
                return BurstOutcome::StoreError;
            }

            if !sleep_unless_shutdown(delay, shutdown).await {
                tracing::info!(notification_id = %id, "Burst cancelled by shutdown");
                return BurstOutcome::Cancelled;
            }

            match self.store.resume_attempt(id, Utc::now()).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        notification_id = %id,
                        attempt,
                        "Burst superseded, row was not finalized"
                    );
                    return BurstOutcome::Superseded;
                }
                Err(e) => {
                    tracing::error!(notification_id = %id, error = %e, "Failed to resume burst");
                    return BurstOutcome::StoreError;
                }
            }
        }
    }

    /// One try: stored snapshot or fresh render, then send.
    async fn attempt(&self, row: &Notification) -> Result<RenderSnapshot, String> {
        let content = match row.snapshot() {
            Some(snapshot) => snapshot,
            None => {
                let rendered = self
                    .renderer
                    .render(row.kind, &row.data)
                    .map(RenderSnapshot::from)
                    .map_err(|e| e.to_string())?;
                check_storable(&rendered)?;
                rendered
            }
        };

        let email = OutgoingEmail {
            to: row.to_email.clone(),
            to_name: row.to_name.clone(),
            subject: content.subject.clone(),
            html: content.body_html.clone(),
            text: content.body_text.clone(),
            idempotency_key: Some(row.id.to_string()),
        };
        self.sender
            .send(&email)
            .await
            .map_err(|e| e.to_string())?;

        Ok(content)
    }
}

/// Rendered content that would read back as an envelope cannot be recorded.
fn check_storable(content: &RenderSnapshot) -> Result<(), String> {
    let fields = [
        Some(content.subject.as_str()),
        Some(content.body_html.as_str()),
        content.body_text.as_deref(),
    ];
    if fields.into_iter().flatten().any(looks_sealed) {
        return Err(format!(
            "rendered content must not start with '{}'",
            ENVELOPE_PREFIX
        ));
    }
    Ok(())
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleep for `delay`; false if shutdown was requested first.
async fn sleep_unless_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if is_shutdown(shutdown) {
        return false;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}

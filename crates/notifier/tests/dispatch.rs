//! Dispatch worker tests against the in-memory store with paused time.
//!
//! ```bash
//! cargo test -p courier-notifier --test dispatch
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Mutex, Notify, watch};

use courier_common::config::DedupeConfig;
use courier_common::error::AppError;
use courier_common::types::{NewNotification, NotificationKind, NotificationStatus, RenderSnapshot};
use courier_engine::dedupe::LocalSuppressor;
use courier_engine::{EnqueueOptions, MemoryOutboxStore, Outbox, OutboxStore, TransportSignal};
use courier_notifier::{
    AttemptPolicy, BurstOutcome, DirectDelivery, DirectOutcome, DispatchWorker, OutgoingEmail,
    PlainTextRenderer, RenderError, RenderedMessage, SendError, Sender, TemplateRenderer,
};

// ============================================================
// Scripted sender
// ============================================================

/// Fails the first `failures` calls, then succeeds.
struct ScriptedSender {
    failures: u32,
    calls: AtomicU32,
    sent: Mutex<Vec<OutgoingEmail>>,
    first_call: Notify,
}

impl ScriptedSender {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
            first_call: Notify::new(),
        })
    }

    fn always_failing() -> Arc<Self> {
        Self::new(u32::MAX)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sender for ScriptedSender {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), SendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            self.first_call.notify_one();
        }
        if call < self.failures {
            return Err(SendError::Rejected {
                status: 503,
                body: format!("try {} unavailable", call + 1),
            });
        }
        self.sent.lock().await.push(email.clone());
        Ok(())
    }
}

// ============================================================
// Harness
// ============================================================

struct Harness {
    store: Arc<MemoryOutboxStore>,
    outbox: Outbox,
    signal: TransportSignal,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryOutboxStore::default());
    let dyn_store: Arc<dyn OutboxStore> = store.clone();
    let signal = TransportSignal::in_process();
    Harness {
        outbox: Outbox::new(dyn_store, signal.clone()),
        signal,
        store,
    }
}

fn worker(h: &Harness, sender: Arc<ScriptedSender>) -> DispatchWorker {
    DispatchWorker::new(
        h.store.clone(),
        Arc::new(PlainTextRenderer::default()),
        sender,
        AttemptPolicy::default(),
        Duration::from_millis(200),
    )
}

fn snapshot() -> RenderSnapshot {
    RenderSnapshot {
        subject: "Verify your email".to_string(),
        body_html: "<p>Click the link</p>".to_string(),
        body_text: None,
    }
}

fn verification(key: &str) -> NewNotification {
    NewNotification::new(NotificationKind::Verification, "ada@example.com")
        .with_dedupe_key(key)
        .with_data(json!({"link": "https://app.test/verify?t=abc"}))
}

fn with_snapshot() -> EnqueueOptions {
    EnqueueOptions {
        snapshot: Some(snapshot()),
        ..Default::default()
    }
}

// ============================================================
// Attempt bursts
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failures_then_sent() {
    let h = harness();
    let sender = ScriptedSender::new(2);
    let worker = worker(&h, sender.clone());
    let (_tx, mut shutdown) = watch::channel(false);

    let id = h
        .outbox
        .enqueue(verification("verify:user1"), with_snapshot())
        .await
        .unwrap();

    let report = worker.drain(&mut shutdown).await;
    assert_eq!(report.leased, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(sender.calls(), 3);

    let row = h.outbox.get(id).await.unwrap();
    assert_eq!(row.status, NotificationStatus::Sent);
    assert_eq!(row.attempt_count, 3);
    assert!(row.sent_at.is_some());

    let sent = sender.sent.lock().await;
    assert_eq!(sent[0].idempotency_key.as_deref(), Some(id.to_string().as_str()));
    drop(sent);

    // The key is free again once the row is Sent.
    let again = h
        .outbox
        .enqueue(verification("verify:user1"), with_snapshot())
        .await
        .unwrap();
    assert_ne!(again, id);
}

#[tokio::test(start_paused = true)]
async fn test_single_failure_sends_on_second_try() {
    let h = harness();
    let sender = ScriptedSender::new(1);
    let worker = worker(&h, sender.clone());
    let (_tx, mut shutdown) = watch::channel(false);

    let id = h
        .outbox
        .enqueue(verification("verify:user2"), with_snapshot())
        .await
        .unwrap();
    let row = h.store.lease_next_due(chrono::Utc::now()).await.unwrap().unwrap();
    assert_eq!(row.id, id);

    let outcome = worker.run_burst(row, &mut shutdown).await;
    assert_eq!(outcome, BurstOutcome::Sent { attempts: 2 });
    assert_eq!(h.outbox.get(id).await.unwrap().attempt_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_burst_dead_letters() {
    let h = harness();
    let sender = ScriptedSender::always_failing();
    let worker = worker(&h, sender.clone());
    let (_tx, mut shutdown) = watch::channel(false);

    let id = h
        .outbox
        .enqueue(verification("verify:user3"), with_snapshot())
        .await
        .unwrap();

    let report = worker.drain(&mut shutdown).await;
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(sender.calls(), 3);

    let row = h.outbox.get(id).await.unwrap();
    assert_eq!(row.status, NotificationStatus::DeadLetter);
    assert_eq!(row.attempt_count, 3);
    assert!(row.last_error.unwrap().contains("try 3 unavailable"));

    // Dead letters are never leased again.
    let report = worker.drain(&mut shutdown).await;
    assert_eq!(report.leased, 0);
    assert_eq!(sender.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_renderer_used_without_snapshot() {
    let h = harness();
    let sender = ScriptedSender::new(0);
    let worker = worker(&h, sender.clone());
    let (_tx, mut shutdown) = watch::channel(false);

    let id = h
        .outbox
        .enqueue(verification("verify:user4"), EnqueueOptions::default())
        .await
        .unwrap();
    worker.drain(&mut shutdown).await;

    let sent = sender.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Verify your email for Courier");
    assert!(sent[0].html.contains("https://app.test/verify?t=abc"));

    // The rendered content is kept on the row.
    let row = h.outbox.get(id).await.unwrap();
    assert_eq!(row.subject.as_deref(), Some("Verify your email for Courier"));
}

#[tokio::test(start_paused = true)]
async fn test_render_failure_counts_as_attempt() {
    let h = harness();
    let sender = ScriptedSender::new(0);
    let worker = worker(&h, sender.clone());
    let (_tx, mut shutdown) = watch::channel(false);

    let message = NewNotification::new(NotificationKind::MagicLink, "ada@example.com");
    let id = h
        .outbox
        .enqueue(message, EnqueueOptions::default())
        .await
        .unwrap();
    worker.drain(&mut shutdown).await;

    let row = h.outbox.get(id).await.unwrap();
    assert_eq!(row.status, NotificationStatus::DeadLetter);
    assert_eq!(row.attempt_count, 3);
    assert!(row.last_error.unwrap().contains("link"));
    assert_eq!(sender.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_burst_superseded_when_key_taken() {
    let h = harness();
    let sender = ScriptedSender::new(1);
    let worker = worker(&h, sender.clone());
    let (_tx, mut shutdown) = watch::channel(false);

    let first = h
        .outbox
        .enqueue(verification("verify:user5"), with_snapshot())
        .await
        .unwrap();
    let row = h.store.lease_next_due(chrono::Utc::now()).await.unwrap().unwrap();

    let burst = tokio::spawn(async move { worker.run_burst(row, &mut shutdown).await });

    // After the first failed try the key is free and a fresh row takes it.
    sender.first_call.notified().await;
    let second = loop {
        match h
            .outbox
            .enqueue(verification("verify:user5"), with_snapshot())
            .await
        {
            Ok(id) => break id,
            Err(AppError::DuplicateActive(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(e) => panic!("unexpected error: {e}"),
        }
    };

    assert_eq!(burst.await.unwrap(), BurstOutcome::Superseded);
    assert_eq!(h.outbox.get(second).await.unwrap().status, NotificationStatus::Queued);

    // The superseded row stays in Failed below the attempt limit, with no
    // dead-letter write, and is never leased again.
    let orphan = h.outbox.get(first).await.unwrap();
    assert_eq!(orphan.status, NotificationStatus::Failed);
    assert_eq!(orphan.attempt_count, 1);
    let next = h.store.lease_next_due(chrono::Utc::now()).await.unwrap().unwrap();
    assert_eq!(next.id, second);
    assert!(h.store.lease_next_due(chrono::Utc::now()).await.unwrap().is_none());
}

/// Renders a subject that would read back as ciphertext.
struct EnvelopeSubjectRenderer;

impl TemplateRenderer for EnvelopeSubjectRenderer {
    fn render(
        &self,
        _kind: NotificationKind,
        _data: &serde_json::Value,
    ) -> Result<RenderedMessage, RenderError> {
        Ok(RenderedMessage {
            subject: "enc:v1:Welcome".to_string(),
            html: "<p>Welcome</p>".to_string(),
            text: None,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_unstorable_render_dead_letters_without_sending() {
    let h = harness();
    let sender = ScriptedSender::new(0);
    let worker = DispatchWorker::new(
        h.store.clone(),
        Arc::new(EnvelopeSubjectRenderer),
        sender.clone(),
        AttemptPolicy::default(),
        Duration::from_millis(200),
    );
    let (_tx, mut shutdown) = watch::channel(false);

    let id = h
        .outbox
        .enqueue(
            NewNotification::new(NotificationKind::Welcome, "ada@example.com"),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    let report = worker.drain(&mut shutdown).await;
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(sender.calls(), 0);

    let row = h.outbox.get(id).await.unwrap();
    assert_eq!(row.status, NotificationStatus::DeadLetter);
    assert!(row.last_error.unwrap().contains("enc:v1:"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_burst() {
    let h = harness();
    let sender = ScriptedSender::always_failing();
    let worker = worker(&h, sender.clone());
    let (tx, mut shutdown) = watch::channel(false);

    let id = h
        .outbox
        .enqueue(verification("verify:user6"), with_snapshot())
        .await
        .unwrap();

    let drain = tokio::spawn(async move { worker.drain(&mut shutdown).await });
    sender.first_call.notified().await;
    tx.send(true).unwrap();

    let report = drain.await.unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(sender.calls(), 1);

    let row = h.outbox.get(id).await.unwrap();
    assert_eq!(row.status, NotificationStatus::Failed);
    assert_eq!(row.attempt_count, 1);
}

// ============================================================
// Run loop
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_run_loop_delivers_and_stops() {
    let h = harness();
    let sender = ScriptedSender::new(0);
    let worker = worker(&h, sender.clone());
    let (tx, shutdown) = watch::channel(false);

    let handle = tokio::spawn(worker.run(h.signal.subscribe(), shutdown));
    let id = h
        .outbox
        .enqueue(verification("verify:user7"), with_snapshot())
        .await
        .unwrap();

    for _ in 0..50 {
        if h.outbox.get(id).await.unwrap().status == NotificationStatus::Sent {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(h.outbox.get(id).await.unwrap().status, NotificationStatus::Sent);

    tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_picks_up_requeued_row() {
    let h = harness();
    let sender = ScriptedSender::new(3);
    let (tx, mut shutdown) = watch::channel(false);

    let id = h
        .outbox
        .enqueue(verification("verify:user8"), with_snapshot())
        .await
        .unwrap();
    worker(&h, sender.clone()).drain(&mut shutdown).await;
    assert_eq!(h.outbox.get(id).await.unwrap().status, NotificationStatus::DeadLetter);

    let handle = tokio::spawn(worker(&h, sender.clone()).run(h.signal.subscribe(), shutdown));
    assert!(h.outbox.requeue(id).await.unwrap());

    for _ in 0..50 {
        if h.outbox.get(id).await.unwrap().status == NotificationStatus::Sent {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let row = h.outbox.get(id).await.unwrap();
    assert_eq!(row.status, NotificationStatus::Sent);
    assert_eq!(row.attempt_count, 4);

    tx.send(true).unwrap();
    handle.await.unwrap();
}

// ============================================================
// Direct delivery
// ============================================================

#[tokio::test]
async fn test_direct_delivery_suppresses_duplicates() {
    let sender = ScriptedSender::new(0);
    let direct = DirectDelivery::new(
        Arc::new(PlainTextRenderer::default()),
        sender.clone(),
        LocalSuppressor::default(),
    );
    let data = json!({"event": "new sign-in"});

    let first = direct
        .deliver(
            NotificationKind::SecurityAlert,
            "ada@example.com",
            None,
            &data,
            Some("alert:ada"),
        )
        .await
        .unwrap();
    let second = direct
        .deliver(
            NotificationKind::SecurityAlert,
            "ada@example.com",
            None,
            &data,
            Some("alert:ada"),
        )
        .await
        .unwrap();

    assert_eq!(first, DirectOutcome::Sent);
    assert_eq!(second, DirectOutcome::Suppressed);
    assert_eq!(sender.calls(), 1);
}

#[tokio::test]
async fn test_direct_delivery_failure_releases_key() {
    let sender = ScriptedSender::new(1);
    let direct = DirectDelivery::new(
        Arc::new(PlainTextRenderer::default()),
        sender.clone(),
        LocalSuppressor::from_config(&DedupeConfig::default()),
    );
    let data = json!({"event": "password changed"});
    let key = Some("alert:grace");

    assert!(
        direct
            .deliver(NotificationKind::SecurityAlert, "grace@example.com", None, &data, key)
            .await
            .is_err()
    );
    let retry = direct
        .deliver(NotificationKind::SecurityAlert, "grace@example.com", None, &data, key)
        .await
        .unwrap();
    assert_eq!(retry, DirectOutcome::Sent);
}

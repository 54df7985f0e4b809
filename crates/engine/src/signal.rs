//! Transport signal: best-effort "item queued" wakeups for the dispatch worker.
//!
//! The signal only shortens latency. Losing a message is harmless because the
//! worker also polls on a fixed tick.

use std::time::Duration;

use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use courier_common::config::{TransportConfig, TransportMode};
use courier_common::redis_pool::create_redis_pool;

const IN_PROCESS_CAPACITY: usize = 1024;
const FORWARD_CAPACITY: usize = 1024;
const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// What a subscriber receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Queued(Uuid),
    /// Messages were dropped; the receiver should drain anyway.
    Missed,
}

#[derive(Clone)]
pub enum TransportSignal {
    InProcess(broadcast::Sender<Uuid>),
    Redis {
        client: redis::Client,
        publisher: ConnectionManager,
        channel: String,
    },
}

impl TransportSignal {
    pub fn in_process() -> Self {
        let (tx, _) = broadcast::channel(IN_PROCESS_CAPACITY);
        Self::InProcess(tx)
    }

    pub async fn redis(redis_url: &str, channel: impl Into<String>) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let publisher = create_redis_pool(redis_url).await?;
        Ok(Self::Redis {
            client,
            publisher,
            channel: channel.into(),
        })
    }

    pub async fn from_config(config: &TransportConfig, redis_url: &str) -> anyhow::Result<Self> {
        match config.mode {
            TransportMode::InProcess => Ok(Self::in_process()),
            TransportMode::Redis => Self::redis(redis_url, config.channel.clone()).await,
        }
    }

    /// Announce a queued notification. Failures are logged, never returned.
    pub async fn publish(&self, id: Uuid) {
        match self {
            // No subscribers is not an error: the poll tick covers it.
            Self::InProcess(tx) => {
                let _ = tx.send(id);
            }
            Self::Redis {
                publisher, channel, ..
            } => {
                let mut conn = publisher.clone();
                if let Err(e) = conn
                    .publish::<_, _, ()>(channel.as_str(), id.to_string())
                    .await
                {
                    tracing::warn!(
                        notification_id = %id,
                        channel = %channel,
                        error = %e,
                        "Failed to publish queued signal"
                    );
                }
            }
        }
    }

    pub fn subscribe(&self) -> SignalReceiver {
        match self {
            Self::InProcess(tx) => SignalReceiver::InProcess(tx.subscribe()),
            Self::Redis {
                client, channel, ..
            } => {
                let (tx, rx) = mpsc::channel(FORWARD_CAPACITY);
                tokio::spawn(forward_pubsub(client.clone(), channel.clone(), tx));
                SignalReceiver::Forwarded(rx)
            }
        }
    }
}

pub enum SignalReceiver {
    InProcess(broadcast::Receiver<Uuid>),
    Forwarded(mpsc::Receiver<Wakeup>),
}

impl SignalReceiver {
    /// Next wakeup, or `None` once the signal source is gone for good.
    pub async fn recv(&mut self) -> Option<Wakeup> {
        match self {
            Self::InProcess(rx) => match rx.recv().await {
                Ok(id) => Some(Wakeup::Queued(id)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Signal receiver lagged");
                    Some(Wakeup::Missed)
                }
                Err(broadcast::error::RecvError::Closed) => None,
            },
            Self::Forwarded(rx) => rx.recv().await,
        }
    }
}

/// Pump Redis pub/sub messages into `tx` until the receiver is dropped,
/// reconnecting with backoff.
async fn forward_pubsub(client: redis::Client, channel: String, tx: mpsc::Sender<Wakeup>) {
    let mut backoff = RECONNECT_INITIAL;

    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => match pubsub.subscribe(channel.as_str()).await {
                Ok(()) => {
                    tracing::info!(channel = %channel, "Subscribed to queued signal channel");
                    backoff = RECONNECT_INITIAL;
                    // Anything published while disconnected was lost.
                    if tx.try_send(Wakeup::Missed).is_err() && tx.is_closed() {
                        return;
                    }

                    let mut messages = pubsub.on_message();
                    while let Some(msg) = messages.next().await {
                        let wakeup = msg
                            .get_payload::<String>()
                            .ok()
                            .and_then(|p| Uuid::parse_str(&p).ok())
                            .map(Wakeup::Queued)
                            .unwrap_or(Wakeup::Missed);

                        match tx.try_send(wakeup) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {}
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                    tracing::warn!(channel = %channel, "Signal subscription ended");
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Failed to subscribe");
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to open pub/sub connection");
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_process_delivers_ids() {
        let signal = TransportSignal::in_process();
        let mut rx = signal.subscribe();
        let id = Uuid::new_v4();
        signal.publish(id).await;
        assert_eq!(rx.recv().await, Some(Wakeup::Queued(id)));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let signal = TransportSignal::in_process();
        signal.publish(Uuid::new_v4()).await;
    }

    #[tokio::test]
    async fn test_lagged_receiver_reports_missed() {
        let (tx, _) = broadcast::channel(2);
        let signal = TransportSignal::InProcess(tx);
        let mut rx = signal.subscribe();
        for _ in 0..5 {
            signal.publish(Uuid::new_v4()).await;
        }
        assert_eq!(rx.recv().await, Some(Wakeup::Missed));
        assert!(matches!(rx.recv().await, Some(Wakeup::Queued(_))));
    }
}

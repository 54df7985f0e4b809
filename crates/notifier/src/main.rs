use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use courier_common::cipher::FieldCipher;
use courier_common::config::AppConfig;
use courier_common::db;
use courier_engine::{
    AutoResendScanner, OutboxStore, PgOutboxStore, ResendManager, RetentionSweep, StoreSettings,
    TransportSignal,
};
use courier_notifier::sender::sender_from_config;
use courier_notifier::{AttemptPolicy, DispatchWorker, PlainTextRenderer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_notifier=info,courier_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier notifier starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let cipher = FieldCipher::from_config(&config.encryption)?;
    if cipher.is_enabled() {
        tracing::info!("Field encryption enabled");
    }
    let store: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(
        pool,
        StoreSettings {
            cipher,
            claim_ttl: config.dedupe.claim_ttl(),
        },
    ));

    let signal = TransportSignal::from_config(&config.transport, &config.redis_url).await?;
    tracing::info!(mode = ?config.transport.mode, "Transport signal ready");

    let sender = sender_from_config(&config)?;
    let worker = DispatchWorker::new(
        store.clone(),
        Arc::new(PlainTextRenderer::default()),
        sender,
        AttemptPolicy::from_config(&config.dispatch),
        Duration::from_millis(config.dispatch.poll_interval_ms),
    );
    let resend = ResendManager::new(store.clone(), signal.clone(), &config.resend);
    let scanner = AutoResendScanner::new(store.clone(), resend, config.auto_resend.clone());
    let sweep = RetentionSweep::new(store, config.retention.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = vec![
        tokio::spawn(worker.run(signal.subscribe(), shutdown_rx.clone())),
        tokio::spawn(scanner.run(shutdown_rx.clone())),
        tokio::spawn(sweep.run(shutdown_rx)),
    ];

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    shutdown_tx.send(true)?;

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }

    tracing::info!("Courier notifier stopped.");
    Ok(())
}

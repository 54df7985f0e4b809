//! Courier API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_common::cipher::FieldCipher;
use courier_common::config::AppConfig;
use courier_common::db::{create_pool, run_migrations};
use courier_engine::{
    Outbox, OutboxStore, PgOutboxStore, ResendManager, StoreSettings, TransportSignal,
};

use courier_api::routes::create_router;
use courier_api::state::AppState;

const MAX_BODY_BYTES: usize = 256 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("courier_api=debug,courier_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Courier API server...");

    // Load configuration
    let config = AppConfig::from_env()?;
    if config.admin_api_token.is_none() {
        tracing::warn!("ADMIN_API_TOKEN not set, all /api routes will reject requests");
    }

    // Create database connection pool
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database pool created");

    let store: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(
        pool,
        StoreSettings {
            cipher: FieldCipher::from_config(&config.encryption)?,
            claim_ttl: config.dedupe.claim_ttl(),
        },
    ));
    let signal = TransportSignal::from_config(&config.transport, &config.redis_url).await?;

    // Build application state
    let state = AppState::new(
        Outbox::new(store.clone(), signal.clone()),
        ResendManager::new(store, signal, &config.resend),
        config.admin_api_token.clone(),
    );

    // Build router
    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}

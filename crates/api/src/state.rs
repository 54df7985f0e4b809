//! Shared application state for the Axum API server.

use std::sync::Arc;

use courier_engine::{Outbox, ResendManager};

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub outbox: Outbox,
    pub resend: ResendManager,
    /// Bearer token for `/api` routes. `None` rejects every admin request.
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(outbox: Outbox, resend: ResendManager, admin_token: Option<String>) -> Self {
        Self {
            outbox,
            resend,
            admin_token: admin_token.map(Arc::from),
        }
    }
}

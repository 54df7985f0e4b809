//! Notification routes: enqueue, lookup, resend, requeue and provider callbacks.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    NewNotification, Notification, NotificationFilter, ProviderStatusUpdate, RenderSnapshot,
};
use courier_engine::EnqueueOptions;

use crate::middleware::auth::AdminAuth;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/notifications",
            post(enqueue_notification).get(list_notifications),
        )
        .route("/api/notifications/{id}", get(get_notification))
        .route("/api/notifications/{id}/resend", post(resend_notification))
        .route("/api/notifications/{id}/requeue", post(requeue_notification))
        .route(
            "/api/notifications/{id}/provider-status",
            post(record_provider_status),
        )
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(flatten)]
    pub message: NewNotification,
    pub token_hash: Option<String>,
    pub snapshot: Option<RenderSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResendRequest {
    pub reason: Option<String>,
}

/// POST /api/notifications: Queue a notification for delivery.
async fn enqueue_notification(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    let options = EnqueueOptions {
        token_hash: request.token_hash,
        snapshot: request.snapshot,
    };
    let id = state.outbox.enqueue(request.message, options).await?;
    Ok((StatusCode::CREATED, Json(EnqueueResponse { id })))
}

/// GET /api/notifications: List notifications, newest first.
async fn list_notifications(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Query(filter): Query<NotificationFilter>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let notifications = state.outbox.list(&filter).await?;
    Ok(Json(notifications))
}

/// GET /api/notifications/:id: Fetch one notification.
async fn get_notification(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    let notification = state.outbox.get(id).await?;
    Ok(Json(notification))
}

/// POST /api/notifications/:id/resend: Clone a finished notification into a new one.
async fn resend_notification(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
    Json(request): Json<ResendRequest>,
) -> Result<(StatusCode, Json<Notification>), AppError> {
    let clone = state.resend.resend(id, request.reason.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(clone)))
}

/// POST /api/notifications/:id/requeue: Put a failed or dead-lettered notification back in the queue.
async fn requeue_notification(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.outbox.requeue(id).await? {
        return Ok(Json(json!({"requeued": true})));
    }

    // Distinguish an unknown id from a row in the wrong status.
    let current = state.outbox.get(id).await?;
    Err(AppError::InvalidState(format!(
        "notification {} is {} and cannot be requeued",
        id, current.status
    )))
}

/// POST /api/notifications/:id/provider-status: Record a delivery fact from the email provider.
async fn record_provider_status(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<Uuid>,
    Json(update): Json<ProviderStatusUpdate>,
) -> Result<StatusCode, AppError> {
    state.outbox.record_provider_status(id, &update).await?;
    Ok(StatusCode::NO_CONTENT)
}

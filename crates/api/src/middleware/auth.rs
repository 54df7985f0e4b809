//! Static admin bearer-token authentication.
//!
//! Provides an `AdminAuth` Axum extractor that validates the Authorization
//! header against `ADMIN_API_TOKEN` on protected routes.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use courier_common::error::AppError;

use crate::state::AppState;

/// Proof that the request carried the admin token.
///
/// Use as an Axum extractor on protected routes:
/// ```ignore
/// async fn handler(_admin: AdminAuth) -> impl IntoResponse { ... }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.admin_token.as_deref() else {
            return Err(AppError::Auth("Admin API is disabled".to_string()));
        };

        let provided = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| {
                AppError::Auth("Missing Authorization header. Use 'Bearer <token>'".to_string())
            })?;

        if tokens_match(provided.trim(), expected) {
            Ok(AdminAuth)
        } else {
            Err(AppError::Auth("Invalid admin token".to_string()))
        }
    }
}

/// Length-independent comparison over every byte of the expected token.
fn tokens_match(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    let mut diff = provided.len() ^ expected.len();
    for (i, byte) in expected.iter().enumerate() {
        let other = provided.get(i).copied().unwrap_or(0);
        diff |= usize::from(byte ^ other);
    }
    diff == 0
}

//! Bearer token authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use thiserror::Error;

/// Routes reachable without a token
pub const PUBLIC_PATHS: &[&str] = &["/info", "/v1/info", "/health"];

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid bearer token")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, "Authentication failed");

        let body = axum::Json(serde_json::json!({
            "success": false,
            "error": "Unauthorized",
        }));
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

/// Rejects requests whose `Authorization: Bearer <token>` header does not
/// carry `token`, except on [`PUBLIC_PATHS`]
pub async fn auth_middleware(
    State(token): State<Arc<str>>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if PUBLIC_PATHS.contains(&request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(AuthError::MissingToken)?;

    let provided = provided
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidToken)?;

    if !constant_time_eq(provided.as_bytes(), token.as_bytes()) {
        return Err(AuthError::InvalidToken);
    }

    Ok(next.run(request).await)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

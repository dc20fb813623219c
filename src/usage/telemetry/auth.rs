//! Shared-token authentication for the collector routes
//!
//! The whole `authorization` header value is compared byte for byte with
//! the configured token. No scheme is parsed, so an operator who wants
//! `Bearer xyz` configures exactly that string. An empty token disables
//! the check.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

pub const AUTHORIZATION_HEADER: &str = "authorization";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingCredentials,
    #[error("invalid authorization token")]
    InvalidCredentials,
}

/// Validate request headers against the configured token
pub fn check(token: &str, headers: &HeaderMap) -> Result<(), AuthError> {
    if token.is_empty() {
        return Ok(());
    }

    let provided = headers
        .get(AUTHORIZATION_HEADER)
        .ok_or(AuthError::MissingCredentials)?;

    if provided.as_bytes() == token.as_bytes() {
        Ok(())
    } else {
        Err(AuthError::InvalidCredentials)
    }
}

#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    code: &'static str,
    error: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = AuthErrorResponse {
            code: "UNAUTHENTICATED",
            error: self.to_string(),
        };
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// Middleware guarding unary and streaming routes alike.
///
/// Runs before the handler, so a rejected call never reaches storage and
/// a streaming response never starts.
pub async fn require_token(
    State(token): State<Arc<str>>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if let Err(e) = check(&token, request.headers()) {
        log::warn!("Rejected {} {}: {}", request.method(), request.uri().path(), e);
        return Err(e);
    }
    Ok(next.run(request).await)
}

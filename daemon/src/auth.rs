//! Gateway key check
//!
//! Every `/plugin/*` request must carry the configured key in `X-Api-Key`.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Error, Debug, PartialEq)]
pub enum AuthError {
    #[error("Missing API key")]
    MissingKey,

    #[error("Invalid API key")]
    InvalidKey,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

/// Shared gateway key
#[derive(Clone)]
pub struct ApiKey(Arc<str>);

impl ApiKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn verify(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let presented = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingKey)?;

        if constant_time_compare(presented.as_bytes(), self.0.as_bytes()) {
            Ok(())
        } else {
            Err(AuthError::InvalidKey)
        }
    }
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// axum middleware rejecting requests without the right key
pub async fn require_api_key(
    State(key): State<ApiKey>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if let Err(e) = key.verify(request.headers()) {
        warn!("Rejected {} {}: {}", request.method(), request.uri().path(), e);
        return Err(e);
    }
    Ok(next.run(request).await)
}

//! Admin gate for trigger routes.
//!
//! Compares the `Authorization: Bearer <token>` header against the configured
//! admin token. With no token configured every request passes (development
//! mode; [`AppState::new`](super::AppState::new) warns once at startup).

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::Response;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::{error_response, AppState};

/// Extractor that rejects requests without the admin bearer token.
///
/// Returns 401 when the header is missing and 403 when the token is wrong.
pub struct RequireAdmin;

/// Compare digests so the comparison time does not depend on where the
/// tokens first differ.
fn token_matches(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl FromRequestParts<Arc<AppState>> for RequireAdmin {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.admin_token.as_deref() else {
            return Ok(RequireAdmin);
        };

        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Authentication required"))?;

        if !token_matches(presented.trim(), expected) {
            return Err(error_response(StatusCode::FORBIDDEN, "Admin access required"));
        }
        Ok(RequireAdmin)
    }
}

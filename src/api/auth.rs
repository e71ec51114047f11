// =============================================================================
// Bearer Token Authentication — Axum extractor
// =============================================================================
//
// Tenants authenticate with an opaque bearer token. How tokens are issued is
// outside the core; here they are only matched — in constant time — against
// the repository's tenant records. The extractor yields the resolved Tenant,
// so handlers never see raw credentials.
//
// Usage:
//
//   async fn handler(TenantAuth(tenant): TenantAuth, ...) { ... }
//
// A missing or unknown token short-circuits the request with 403 before the
// handler body executes.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::AppState;
use crate::model::Tenant;

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. Returns `true` if they are
/// identical. The comparison always examines every byte of both slices even
/// when a mismatch is found early, preventing timing side-channels.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        // A length mismatch already leaks that lengths differ, which is
        // acceptable for token authentication (the caller does not control
        // the expected token length).
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// =============================================================================
// Extractor
// =============================================================================

/// Axum extractor resolving `Authorization: Bearer <token>` to a Tenant.
pub struct TenantAuth(pub Tenant);

/// Rejection type returned when authentication fails.
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait::async_trait]
impl FromRequestParts<Arc<AppState>> for TenantAuth {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match auth_header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "Missing or invalid authorization token",
                });
            }
        };

        match resolve_token(state, token).await {
            Some(tenant) => Ok(TenantAuth(tenant)),
            None => {
                warn!("unknown or suspended tenant token presented");
                Err(AuthRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "Invalid authorization token",
                })
            }
        }
    }
}

// =============================================================================
// Token resolution helper (shared with the WebSocket upgrade path)
// =============================================================================

/// Resolve a raw token to an active Tenant. Suspended tenants resolve to
/// `None`: their sessions die with the suspension.
pub async fn resolve_token(state: &Arc<AppState>, token: &str) -> Option<Tenant> {
    if token.is_empty() {
        return None;
    }
    match state.repo.tenant_by_token(token).await {
        Ok(Some(tenant)) if tenant.is_active() => Some(tenant),
        Ok(_) => None,
        Err(err) => {
            warn!(error = %err, "token lookup failed");
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn constant_time_eq_empty() {
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn constant_time_eq_single_bit_diff() {
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }
}

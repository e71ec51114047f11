// =============================================================================
// Core error surface
// =============================================================================
//
// Business rejections (rate limit, gate failures, panic) are *not* errors:
// they are durable Decisions served with HTTP 200. The variants here cover
// caller mistakes, capacity, adapter faults, and unexpected failures — each
// carries a stable machine code and maps onto one transport status.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Error kinds the control plane can surface to a caller.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Malformed submit or admin request. Nothing was persisted.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// The acting tenant does not own (or admin) the target.
    #[error("forbidden: {0}")]
    TenantForbidden(String),

    /// An idempotency key was replayed with a different request body.
    #[error("idempotency key conflict: {0}")]
    IdempotencyConflict(String),

    /// Target entity does not exist or is not visible to the tenant.
    #[error("not found: {0}")]
    NotFound(String),

    /// Connect would exceed the configured active-session cap.
    #[error("connection pool full (cap {cap})")]
    PoolFull { cap: usize },

    /// The broker adapter refused or failed the operation.
    #[error("broker refused: {0}")]
    BrokerRefused(String),

    /// Repository failure; safe to retry — no partial state was written.
    #[error("repository failure: {0}")]
    Repository(String),

    /// Anything unexpected. Logged with a trace id and alerted.
    #[error("internal fault: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code carried in error bodies and audit rows.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InputInvalid(_) => "input_invalid",
            Self::TenantForbidden(_) => "tenant_forbidden",
            Self::IdempotencyConflict(_) => "idempotency_conflict",
            Self::NotFound(_) => "not_found",
            Self::PoolFull { .. } => "pool_full",
            Self::BrokerRefused(_) => "broker_refused",
            Self::Repository(_) => "repository_fault",
            Self::Internal(_) => "internal_fault",
        }
    }

    /// Transport status for the REST surface.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InputInvalid(_) => StatusCode::BAD_REQUEST,
            Self::TenantForbidden(_) => StatusCode::FORBIDDEN,
            Self::IdempotencyConflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PoolFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::BrokerRefused(_) => StatusCode::BAD_GATEWAY,
            Self::Repository(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a client may retry the identical request safely.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolFull { .. } | Self::BrokerRefused(_) | Self::Repository(_) | Self::Internal(_)
        )
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });
        (self.status(), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_line_up() {
        assert_eq!(CoreError::InputInvalid("x".into()).code(), "input_invalid");
        assert_eq!(
            CoreError::InputInvalid("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CoreError::IdempotencyConflict("k".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            CoreError::PoolFull { cap: 10 }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn only_transport_faults_are_retryable() {
        assert!(!CoreError::InputInvalid("x".into()).retryable());
        assert!(!CoreError::TenantForbidden("x".into()).retryable());
        assert!(CoreError::Repository("down".into()).retryable());
        assert!(CoreError::BrokerRefused("no".into()).retryable());
        assert!(CoreError::Internal("boom".into()).retryable());
    }
}

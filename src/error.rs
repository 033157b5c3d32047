//! HTTP-boundary error type.
//!
//! Service modules return `Result<_, String>` internally; handlers lift
//! those into `ApiError` so each failure class maps to a stable status code
//! and a JSON body the frontend can branch on.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Bad request payload; never reaches a provider or the database.
    #[error("{0}")]
    Validation(String),

    /// Online ordering is closed. Expected state, not a failure.
    #[error("Online ordering is currently closed. Please call the restaurant to place an order.")]
    GateClosed,

    #[error("{0}")]
    Unauthorized(String),

    /// PIN lockout after repeated failures.
    #[error("Too many failed attempts. Try again later.")]
    Locked,

    #[error("{0}")]
    NotFound(String),

    /// Payment or email provider unreachable/misbehaving. Retryable.
    #[error("The payment service is temporarily unavailable. Please try again.")]
    Upstream(String),

    #[error("Internal error")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::GateClosed => StatusCode::CONFLICT,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Locked => StatusCode::LOCKED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Upstream/internal details are logged where they occur; clients
        // only ever see the generic message.
        if let ApiError::Upstream(detail) | ApiError::Internal(detail) = &self {
            tracing::error!(detail = %detail, "request failed");
        }

        let mut body = json!({ "error": self.to_string() });
        if matches!(self, ApiError::GateClosed) {
            body["gateClosed"] = json!(true);
        }

        (self.status(), Json(body)).into_response()
    }
}

/// Service-layer `String` errors are internal by default.
impl From<String> for ApiError {
    fn from(message: String) -> Self {
        ApiError::Internal(message)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::Validation("missing name".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::GateClosed.status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::Upstream("timeout".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ApiError::Locked.status(), StatusCode::LOCKED);
    }

    #[test]
    fn test_internal_detail_not_leaked() {
        let err = ApiError::Internal("sqlite: disk I/O error".into());
        assert_eq!(err.to_string(), "Internal error");
    }
}

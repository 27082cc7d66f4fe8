//! Error Taxonomy
//!
//! Closed set of error kinds shared by every service. Validation and domain
//! errors are returned synchronously and never retried; transport-level
//! retries happen only in the settlement coordinator, keyed by execution id.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Core error kinds
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("insufficient shares: {0}")]
    InsufficientShares(String),

    #[error("market is not open (state: {0})")]
    MarketClosed(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("settlement failed for execution {execution_id}: {reason}")]
    SettlementFailed { execution_id: String, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code for API responses and logs
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::InsufficientFunds(_) => "INSUFFICIENT_FUNDS",
            CoreError::InsufficientShares(_) => "INSUFFICIENT_SHARES",
            CoreError::MarketClosed(_) => "MARKET_CLOSED",
            CoreError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            CoreError::SettlementFailed { .. } => "SETTLEMENT_FAILED",
            CoreError::Internal(_) => "INTERNAL",
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CoreError::Internal(msg.into())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Internal(format!("store error: {}", err))
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::InsufficientFunds(_) | CoreError::InsufficientShares(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            CoreError::MarketClosed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            CoreError::SettlementFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if matches!(self, CoreError::Internal(_)) {
            tracing::error!("internal error surfaced to client: {}", self);
        }

        let body = Json(json!({
            "code": self.code(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(CoreError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(CoreError::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(CoreError::Conflict("x".into()).code(), "CONFLICT");
        assert_eq!(
            CoreError::InsufficientFunds("x".into()).code(),
            "INSUFFICIENT_FUNDS"
        );
        assert_eq!(
            CoreError::InsufficientShares("x".into()).code(),
            "INSUFFICIENT_SHARES"
        );
        assert_eq!(CoreError::MarketClosed("CLOSED".into()).code(), "MARKET_CLOSED");
        assert_eq!(CoreError::DeadlineExceeded.code(), "DEADLINE_EXCEEDED");
        assert_eq!(CoreError::Internal("x".into()).code(), "INTERNAL");
    }

    #[test]
    fn test_sqlx_error_maps_to_internal() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), "INTERNAL");
    }
}

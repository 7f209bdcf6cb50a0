//! API error taxonomy
//!
//! Every rejection carries a machine-distinguishable code so callers can
//! react appropriately: authentication failures are never retried, rate
//! limits mean back off, `no_current_epoch` is transient and retryable.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid timestamp")]
    StaleTimestamp,

    #[error("You are not validator")]
    NotValidator,

    #[error("{0}")]
    RateLimited(String),

    #[error("No current epoch")]
    NoCurrentEpoch,

    #[error("Epoch {0} not found")]
    EpochNotFound(String),

    #[error("Nonce does not match epoch")]
    NonceMismatch,

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Verification timeout - try again")]
    VerificationTimeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable code for the error class
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidSignature => "invalid_signature",
            ApiError::StaleTimestamp => "stale_timestamp",
            ApiError::NotValidator => "not_validator",
            ApiError::RateLimited(_) => "rate_limited",
            ApiError::NoCurrentEpoch => "no_current_epoch",
            ApiError::EpochNotFound(_) => "epoch_not_found",
            ApiError::NonceMismatch => "nonce_mismatch",
            ApiError::MissingField(_) => "missing_field",
            ApiError::VerificationTimeout => "verification_timeout",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidSignature
            | ApiError::StaleTimestamp
            | ApiError::NotValidator
            | ApiError::NonceMismatch => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NoCurrentEpoch | ApiError::EpochNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MissingField(_) => StatusCode::BAD_REQUEST,
            ApiError::VerificationTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.code(),
            "detail": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

/// Auth-critical paths fail closed when the chain cannot answer, with a
/// reason distinct from an invalid credential so callers know to retry.
impl From<crate::chain::OracleError> for ApiError {
    fn from(_: crate::chain::OracleError) -> Self {
        ApiError::VerificationTimeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            ApiError::InvalidSignature,
            ApiError::StaleTimestamp,
            ApiError::NotValidator,
            ApiError::RateLimited("daily".into()),
            ApiError::NoCurrentEpoch,
            ApiError::EpochNotFound("2024-09-30-12:00".into()),
            ApiError::NonceMismatch,
            ApiError::VerificationTimeout,
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_rate_limit_distinct_from_auth() {
        assert_ne!(
            ApiError::RateLimited("limit".into()).status(),
            ApiError::InvalidSignature.status()
        );
    }
}

//! Error types for ModPatrol
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// This enum represents all possible errors that can occur
/// in the application. It implements `IntoResponse` to
/// automatically convert errors to appropriate HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Signing keys could not be fetched or refreshed (503)
    ///
    /// Fatal for the attempt; the request must not be sent.
    #[error("Signing keys unavailable: {0}")]
    KeyUnavailable(String),

    /// Request signing failed for a single attempt (500)
    #[error("Request signing failed: {0}")]
    SigningFailed(String),

    /// Account credentials rejected by the platform (422)
    ///
    /// The account is skipped; execution continues with the others.
    #[error("Account {account_id} is invalid: {reason}")]
    AccountInvalid { account_id: String, reason: String },

    /// Transport-level failure talking to the platform (502)
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Application-level rejection from the platform (502)
    #[error("Platform rejected request: code {code}: {message}")]
    RemoteRejected { code: i64, message: String },

    /// Every eligible account failed; the target is marked failed (502)
    #[error("All accounts exhausted for target {0}")]
    AllAccountsExhausted(String),

    /// Target already claimed by another execution (409)
    #[error("Target {0} is already claimed")]
    ClaimConflict(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether another attempt against the same account may succeed.
    ///
    /// Consumed by the executor's retry policy: transport failures and
    /// bounded platform rejections are retried, everything else is
    /// terminal for the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Transport(_) | AppError::RemoteRejected { .. }
        )
    }

    /// Short machine-readable label, used for metrics and log events.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Validation(_) => "validation",
            AppError::KeyUnavailable(_) => "key_unavailable",
            AppError::SigningFailed(_) => "signing_failed",
            AppError::AccountInvalid { .. } => "account_invalid",
            AppError::Transport(_) => "transport",
            AppError::RemoteRejected { .. } => "remote_rejected",
            AppError::AllAccountsExhausted(_) => "all_accounts_exhausted",
            AppError::ClaimConflict(_) => "claim_conflict",
            AppError::Database(_) => "database",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::ClaimConflict(_) => StatusCode::CONFLICT,
            AppError::AccountInvalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::KeyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Transport(_)
            | AppError::RemoteRejected { .. }
            | AppError::AllAccountsExhausted(_) => StatusCode::BAD_GATEWAY,
            AppError::SigningFailed(_)
            | AppError::Database(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let error_type = self.kind();

        // Record error metric
        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let error_message = match &self {
            // Don't leak SQL or internal details to API clients.
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
            "error_type": error_type,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_remote_rejections_are_retryable() {
        let rejected = AppError::RemoteRejected {
            code: 412,
            message: "precondition failed".to_string(),
        };
        assert!(rejected.is_retryable());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!AppError::KeyUnavailable("fetch failed".to_string()).is_retryable());
        assert!(!AppError::SigningFailed("no keys".to_string()).is_retryable());
        assert!(
            !AppError::AccountInvalid {
                account_id: "a1".to_string(),
                reason: "expired".to_string(),
            }
            .is_retryable()
        );
    }
}

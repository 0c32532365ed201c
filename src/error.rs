//! Error types for chanfed
//!
//! Every fallible path in the crate returns `AppError`. Federation-facing
//! variants follow the failure classes peers can trigger; the rest are
//! local operational faults. `IntoResponse` turns them into JSON errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Operator credentials missing or wrong (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Signature mismatch, stale date or unknown key (401).
    ///
    /// Carries no detail so a peer cannot tell which check failed.
    #[error("Authentication failed")]
    Authentication,

    /// Malformed envelope, missing fields, locked thread, failed existence check (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Expected refusal such as a main-actor follow of a remote board (403)
    #[error("Rejected by policy: {0}")]
    PolicyRejection(String),

    /// Peer unreachable or returned garbage (502)
    #[error("Network error: {0}")]
    TransientNetwork(String),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Store unavailable (500)
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Private key file absent for a local actor (500)
    #[error("Missing private key: {0}")]
    MissingKey(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Authentication => "authentication",
            AppError::Validation(_) => "validation",
            AppError::PolicyRejection(_) => "policy",
            AppError::TransientNetwork(_) | AppError::HttpClient(_) => "network",
            AppError::Persistence(_) => "persistence",
            AppError::MissingKey(_) => "missing_key",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Unauthorized | AppError::Authentication => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::PolicyRejection(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::TransientNetwork(_) | AppError::HttpClient(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            AppError::Persistence(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Persistence error".to_string(),
            ),
            AppError::MissingKey(_) | AppError::Config(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[self.kind()]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
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
    fn authentication_response_is_generic() {
        let response = AppError::Authentication.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Authentication.to_string(), "Authentication failed");
    }

    #[test]
    fn persistence_detail_is_not_exposed() {
        let response = AppError::Persistence(sqlx::Error::RowNotFound).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

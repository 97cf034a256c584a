//! Error types for Fedshelf
//!
//! All errors in the federation layer are converted to `AppError`,
//! which implements `IntoResponse` so inbox handlers can return them directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Variants follow the federation error taxonomy: parse failures (400),
/// authentication failures (401), permission failures (403), unknown
/// targets or unsupported shapes (404), delivery failures (internal) and
/// infrastructure failures (5xx).
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed JSON or activity envelope (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Signature verification failed or signer unresolvable (401)
    #[error("Invalid signature")]
    InvalidSignature,

    /// Deactivated or blocked actor (403)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown local target (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Activity type neither registered nor ignorable (404)
    #[error("Unsupported activity: {0}")]
    UnsupportedActivity(String),

    /// Object subtype a handler does not understand (404)
    #[error("Unsupported object: {0}")]
    UnsupportedObject(String),

    /// Remote inbox timed out or answered 5xx/429; retried with backoff
    #[error("Transient delivery failure: {0}")]
    TransientDelivery(String),

    /// Remote inbox answered 4xx; the job is dropped
    #[error("Permanent delivery failure: {0}")]
    PermanentDelivery(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error (500)
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Remote server returned something unusable (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether a failed delivery should be attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::TransientDelivery(_))
    }

    /// Status code and metric label for this error
    pub fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::InvalidSignature => (StatusCode::UNAUTHORIZED, "invalid_signature"),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::UnsupportedActivity(_) => (StatusCode::NOT_FOUND, "unsupported_activity"),
            AppError::UnsupportedObject(_) => (StatusCode::NOT_FOUND, "unsupported_object"),
            AppError::TransientDelivery(_) => (StatusCode::BAD_GATEWAY, "transient_delivery"),
            AppError::PermanentDelivery(_) => (StatusCode::BAD_GATEWAY, "permanent_delivery"),
            AppError::Federation(_) => (StatusCode::BAD_GATEWAY, "federation"),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, "http_client"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database"),
            AppError::Migration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "migration"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
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
    /// Internal details (database, migration, anyhow) are not echoed to the
    /// remote server.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_type) = self.status_and_type();
        let error_message = match &self {
            AppError::Database(_) | AppError::Migration(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        };

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type, "inbox"]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

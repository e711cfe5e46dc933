//! Error types for TestRail API operations.

use chrono::{Duration, Utc};
use thiserror::Error;

use crate::service::ServiceError;

/// Errors that can occur when talking to TestRail.
#[derive(Debug, Error)]
pub enum TestRailError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON parsing failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Too many requests; `retry_after` is in seconds when the server sent one.
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<i64> },

    /// The entity kind has no listing endpoint.
    #[error("Unsupported listing: {0}")]
    Unsupported(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<TestRailError> for ServiceError {
    fn from(err: TestRailError) -> Self {
        match err {
            TestRailError::Http(message) => ServiceError::Network { message },
            TestRailError::Json(e) => ServiceError::Internal {
                message: format!("JSON parse error: {e}"),
            },
            TestRailError::Api { status, message } => match status {
                401 | 403 => ServiceError::AuthRequired,
                404 => ServiceError::NotFound { resource: message },
                400 => ServiceError::Validation { message },
                _ => ServiceError::Api { message },
            },
            TestRailError::RateLimited { retry_after } => ServiceError::RateLimited {
                reset_at: retry_after.map(|secs| Utc::now() + Duration::seconds(secs)),
            },
            TestRailError::Unsupported(operation) => ServiceError::Unsupported { operation },
            TestRailError::Config(message) => ServiceError::Internal { message },
        }
    }
}

/// Pull the `error` field out of a TestRail error body, falling back to the
/// raw text.
pub(crate) fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

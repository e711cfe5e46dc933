//! Error types for Qase API operations.

use chrono::{Duration, Utc};
use thiserror::Error;

use crate::service::ServiceError;

/// Errors that can occur when talking to Qase.
#[derive(Debug, Error)]
pub enum QaseError {
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

    /// The response was missing a field the client needs.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The entity kind cannot be created through the API.
    #[error("Unsupported entity: {0}")]
    Unsupported(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<QaseError> for ServiceError {
    fn from(err: QaseError) -> Self {
        match err {
            QaseError::Http(message) => ServiceError::Network { message },
            QaseError::Json(e) => ServiceError::Internal {
                message: format!("JSON parse error: {e}"),
            },
            QaseError::Api { status, message } => match status {
                401 | 403 => ServiceError::AuthRequired,
                404 => ServiceError::NotFound { resource: message },
                400 | 422 => ServiceError::Validation { message },
                429 => ServiceError::RateLimited { reset_at: None },
                _ => ServiceError::Api { message },
            },
            QaseError::RateLimited { retry_after } => ServiceError::RateLimited {
                reset_at: retry_after.map(|secs| Utc::now() + Duration::seconds(secs)),
            },
            QaseError::UnexpectedResponse(message) => ServiceError::Api { message },
            QaseError::Unsupported(operation) => ServiceError::Unsupported { operation },
            QaseError::Config(message) => ServiceError::Internal { message },
        }
    }
}

/// Human-readable message from a Qase error body.
///
/// Validation failures carry an `errorFields` list that is more useful than
/// the generic `errorMessage`.
pub(crate) fn error_message(body: &[u8]) -> String {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return String::from_utf8_lossy(body).trim().to_string();
    };

    let message = value
        .get("errorMessage")
        .or_else(|| value.get("message"))
        .or_else(|| value.get("detail"))
        .and_then(|m| m.as_str())
        .unwrap_or("request failed")
        .to_string();

    let fields: Vec<String> = value
        .get("errorFields")
        .and_then(|f| f.as_array())
        .map(|fields| {
            fields
                .iter()
                .filter_map(|f| {
                    let field = f.get("field")?.as_str()?;
                    let error = f.get("error")?.as_str()?;
                    Some(format!("{field}: {error}"))
                })
                .collect()
        })
        .unwrap_or_default();

    if fields.is_empty() {
        message
    } else {
        format!("{message} ({})", fields.join("; "))
    }
}

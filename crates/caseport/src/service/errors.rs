use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur when talking to the source or destination platform.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// API error from the platform.
    #[error("API error: {message}")]
    Api { message: String },

    /// The platform rejected the payload.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Rate limit exceeded.
    #[error("Rate limit exceeded{}", reset_at.map(|t| format!(". Resets at {t}")).unwrap_or_default())]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    /// Authentication required or failed.
    #[error("Authentication required")]
    AuthRequired,

    /// Resource not found.
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Network or connection error.
    #[error("Network error: {message}")]
    Network { message: String },

    /// The collaborator does not implement this operation.
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// Unexpected/internal error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ServiceError {
    /// Create an API error.
    #[inline]
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
        }
    }

    /// Create a validation error.
    #[inline]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error.
    #[inline]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a network error.
    #[inline]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create an unsupported-operation error.
    #[inline]
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Create an internal error.
    #[inline]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is a rate limit error.
    #[inline]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if a later attempt of the same call could succeed.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Network { .. })
    }
}

/// Extract a short error message suitable for display.
///
/// Takes the first line of an error message, which keeps multi-line API
/// bodies out of progress output and failure summaries.
#[inline]
pub fn short_error_message(e: &impl std::error::Error) -> String {
    let full = e.to_string();
    full.lines().next().unwrap_or(&full).to_string()
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

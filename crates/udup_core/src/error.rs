//! Core error types for udup.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Payload could not be encoded or decoded
    InvalidEncoding {
        /// Codec failure description
        reason: String,
    },

    /// Validation error
    Validation {
        /// Offending field
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Not found
    NotFound {
        /// Kind of entity
        kind: String,
        /// Entity identifier
        id: String,
    },

    /// A backing service (store, lock, remote node) cannot be reached
    Unavailable {
        /// Name of the unavailable resource
        resource: String,
        /// Failure description
        reason: String,
    },

    /// Timeout
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Cancelled
    Cancelled,

    /// Internal error (for unexpected errors)
    Internal {
        /// Error message
        message: String,
    },
}

impl CoreError {
    /// Build an `Unavailable` error for a resource
    #[must_use]
    pub fn unavailable(resource: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Unavailable {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a `Validation` error for a field
    #[must_use]
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding { reason } => write!(f, "Invalid encoding: {}", reason),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::Unavailable { resource, reason } => {
                write!(f, "{} unavailable: {}", resource, reason)
            }
            Self::Timeout { operation } => write!(f, "Timeout: {}", operation),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}

//! Error types and result aliases for Quay.
//!
//! Errors are structured for programmatic handling: callers match on the
//! variant to decide on an HTTP status or a retry, and use the message for logs.

use std::fmt;

/// The result type used throughout Quay.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Quay core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid record identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// An entity name or collection did not match the catalogue.
    #[error("unknown entity: {name}")]
    UnknownEntity {
        /// The name that was looked up.
        name: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an invalid-input error for a named field.
    #[must_use]
    pub fn invalid_field(field: &str, problem: impl fmt::Display) -> Self {
        Self::InvalidInput(format!("field '{field}' {problem}"))
    }

    /// Returns true if the error was caused by the caller's input.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidId { .. } | Self::UnknownEntity { .. } | Self::InvalidInput(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

//! Error types for store operations.

use quay_core::EntityKind;
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while reading or writing either store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller supplied an invalid record, id, filter or field.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the problem.
        message: String,
    },

    /// A create collided with an existing record.
    #[error("{entity} '{id}' already exists")]
    AlreadyExists {
        /// Entity kind of the record.
        entity: EntityKind,
        /// Record identifier.
        id: String,
    },

    /// The record does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Entity kind of the record.
        entity: EntityKind,
        /// Record identifier.
        id: String,
    },

    /// The relational database failed.
    #[error("database error: {message}")]
    Database {
        /// Description of the failure.
        message: String,
        /// The underlying driver error, if any.
        #[source]
        source: Option<rusqlite::Error>,
    },

    /// The object storage under the document store failed.
    #[error("document storage error: {0}")]
    Backend(#[source] quay_core::Error),

    /// Serialization/deserialization failed.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// CAS (Compare-And-Swap) kept losing to concurrent writers.
    #[error("CAS failed: {message}")]
    CasFailed {
        /// Description of the CAS failure.
        message: String,
    },

    /// An internal error occurred (poisoned lock, cancelled blocking task).
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StoreError {
    /// Creates an invalid-input error.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(entity: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<quay_core::Error> for StoreError {
    fn from(err: quay_core::Error) -> Self {
        if err.is_client_error() {
            return Self::InvalidInput {
                message: err.to_string(),
            };
        }
        match err {
            quay_core::Error::Serialization { message } => Self::Serialization { message },
            other => Self::Backend(other),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::internal(format!("blocking store task failed: {err}"))
    }
}

//! Error types for harbor core.

use harbor_storage::StorageError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Persistence rejected a write even after eviction.
    #[error("storage full: could not persist {collection}/{key}")]
    StorageFull {
        /// Collection of the rejected write.
        collection: String,
        /// Key of the rejected write.
        key: String,
    },

    /// Any other storage failure.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// A record, payload or patch is malformed.
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong.
        message: String,
    },

    /// No live record has the given id.
    #[error("record not found: {id}")]
    NotFound {
        /// The id that was looked up.
        id: String,
    },
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Full { collection, key } => CoreError::StorageFull { collection, key },
            other => CoreError::Storage(other),
        }
    }
}

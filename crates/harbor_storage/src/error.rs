//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A backend rejected a write because it would exceed its quota.
    #[error("quota exceeded: write needs {required} bytes, limit is {limit}")]
    QuotaExceeded {
        /// Total bytes the backend would hold after the write.
        required: usize,
        /// Configured byte limit.
        limit: usize,
    },

    /// Every available backend rejected the write, even after eviction.
    #[error("storage full: could not persist {collection}/{key}")]
    Full {
        /// Collection of the rejected write.
        collection: String,
        /// Key of the rejected write.
        key: String,
    },

    /// A value could not be serialized for storage.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend is not usable in this environment.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Returns true for failures caused by running out of space.
    pub fn is_quota(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. } | StorageError::Full { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

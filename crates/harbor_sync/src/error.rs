//! Error types for the sync layer.

use harbor_core::{CoreError, RecordId};
use harbor_storage::StorageError;
use thiserror::Error;

/// Result type for remote transport calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Failure of a single remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The remote service could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The call did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The remote service answered with a non-success status.
    #[error("server responded with status {code}: {message}")]
    HttpStatus {
        /// HTTP status code.
        code: u16,
        /// Response text.
        message: String,
    },

    /// The response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The request could not be built from the queued operation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Creates a status error.
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::HttpStatus {
            code,
            message: message.into(),
        }
    }

    /// Returns true if repeating the call may succeed.
    ///
    /// Client errors (4xx other than 408) and malformed requests are not
    /// retryable; everything else is.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::HttpStatus { code, .. } => !(400..500).contains(code) || *code == 408,
            TransportError::InvalidRequest(_) => false,
            _ => true,
        }
    }

    /// Returns true for a 404 answer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::HttpStatus { code: 404, .. })
    }
}

/// Failure surfaced by the offline client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Persistence rejected a write even after eviction.
    #[error("storage full: could not persist {collection}/{key}")]
    StorageFull {
        /// Collection of the rejected write.
        collection: String,
        /// Key of the rejected write.
        key: String,
    },

    /// A remote call failed.
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    /// A record, payload or patch is malformed.
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// An operation ran out of delivery attempts and left the queue.
    #[error("queued operation for {id} exhausted after {attempts} attempts")]
    QueueExhausted {
        /// Target record.
        id: RecordId,
        /// Attempts made.
        attempts: u32,
    },

    /// No live record has the given id.
    #[error("record not found: {0}")]
    NotFound(String),

    /// Any other storage failure.
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<CoreError> for ClientError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::StorageFull { collection, key } => Self::StorageFull { collection, key },
            CoreError::Storage(err) => Self::Storage(err),
            CoreError::Validation { message } => Self::ValidationFailure(message),
            CoreError::NotFound { id } => Self::NotFound(id),
        }
    }
}

impl From<StorageError> for ClientError {
    fn from(err: StorageError) -> Self {
        CoreError::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(TransportError::Network("reset".into()).is_retryable());
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::status(500, "boom").is_retryable());
        assert!(TransportError::status(408, "slow").is_retryable());
        assert!(!TransportError::status(400, "bad").is_retryable());
        assert!(!TransportError::status(404, "gone").is_retryable());
        assert!(!TransportError::InvalidRequest("no payload".into()).is_retryable());
    }

    #[test]
    fn not_found() {
        assert!(TransportError::status(404, "gone").is_not_found());
        assert!(!TransportError::status(410, "gone").is_not_found());
    }

    #[test]
    fn core_errors_map_onto_taxonomy() {
        let err: ClientError = CoreError::validation("bad").into();
        assert!(matches!(err, ClientError::ValidationFailure(_)));

        let err: ClientError = StorageError::Full {
            collection: "orders".into(),
            key: "A".into(),
        }
        .into();
        assert!(matches!(err, ClientError::StorageFull { .. }));

        let err: ClientError = CoreError::not_found("A").into();
        assert_eq!(err.to_string(), "record not found: A");
    }
}

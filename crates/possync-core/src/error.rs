//! Error types for the offline store and sync engine

use thiserror::Error;

/// Main error type for local store and sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Record is not a JSON object or lacks its key field
    #[error("Invalid record for {collection}: {reason}")]
    InvalidRecord {
        /// Collection the record was written to
        collection: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// Secondary index is not declared for the collection
    #[error("Unknown index '{index}' on {collection}")]
    UnknownIndex {
        /// Collection that was queried
        collection: &'static str,
        /// Index name that was requested
        index: String,
    },

    /// Collection name did not match any known collection
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// On-disk schema is newer than this build understands
    #[error("Schema mismatch: stored version {stored}, running version {running}")]
    SchemaMismatch {
        /// Version recorded in the database
        stored: u32,
        /// Version compiled into this build
        running: u32,
    },

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

/// Failure of a single call against the remote API.
///
/// The push phase uses [`RemoteError::is_retryable`] to decide whether an
/// action keeps its place in the queue or is dropped right away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection refused, DNS failure, timeout, reset
    #[error("Network error: {0}")]
    Network(String),

    /// Server answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// Response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Payload cannot be replayed (missing id, unsupported action)
    #[error("Rejected locally: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Whether a later attempt may succeed.
    ///
    /// 401 stays retryable: the credential is refreshed by the auth
    /// collaborator, not by the engine.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::Status { status, .. } => {
                *status >= 500 || matches!(status, 401 | 408 | 429)
            }
            RemoteError::Decode(_) => true,
            RemoteError::Rejected(_) => false,
        }
    }

    /// Terminal failures are dropped without consuming retry budget
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::UnknownCollection("orders".into());
        assert_eq!(format!("{}", err), "Unknown collection: orders");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }

    #[test]
    fn test_status_classification() {
        let status = |status| RemoteError::Status {
            status,
            body: String::new(),
        };

        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(401).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(400).is_terminal());
        assert!(status(404).is_terminal());
        assert!(status(422).is_terminal());
    }

    #[test]
    fn test_network_and_rejected_classification() {
        assert!(RemoteError::Network("connection refused".into()).is_retryable());
        assert!(RemoteError::Rejected("missing id".into()).is_terminal());
    }
}

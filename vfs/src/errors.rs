use thiserror::Error;

use crate::nodes::FileId;

/// Errors surfaced by the engine, its record stores and delegates.
#[derive(Debug, Error)]
pub enum Error {
    /// The file id does not (or no longer) denote a live entry.
    #[error("invalid file access: {0}")]
    InvalidAccess(FileId),

    /// Persisted state is inconsistent (loops, missing children, …).
    #[error("record store corrupted: {0}")]
    Corrupted(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal storage error: {0}")]
    StorageError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            Error::InvalidAccess(id) => Self::new(
                std::io::ErrorKind::NotFound,
                format!("invalid file access: {}", id),
            ),
            Error::NotFound(msg) => Self::new(std::io::ErrorKind::NotFound, msg),
            Error::InvalidRequest(msg) => Self::new(std::io::ErrorKind::InvalidInput, msg),
            Error::Corrupted(msg) | Error::StorageError(msg) => {
                Self::new(std::io::ErrorKind::Other, msg)
            }
        }
    }
}

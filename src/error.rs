//! Error types for idu
//!
//! One enum covers the whole crate:
//! - database lifecycle and I/O failures
//! - record decoding failures
//! - configuration and CLI errors
//! - scan cancellation
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Errors should be actionable - include the path or name that failed
//! - Per-entry scan failures are recorded in the error log, not propagated

use thiserror::Error;

/// Top-level error type for the idu application
#[derive(Error, Debug)]
pub enum Error {
    /// A requested key or record does not exist
    #[error("not found")]
    NotFound,

    /// The database writer lock could not be acquired within the deadline
    #[error("timeout")]
    Timeout,

    /// Operation attempted on a closed database handle
    #[error("database is closed")]
    Closed,

    /// The scan was cancelled
    #[error("cancelled")]
    Cancelled,

    /// I/O failure from the filesystem or the storage engine
    #[error("i/o error: {0}")]
    Io(String),

    /// A stored record failed to decode
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    /// Configuration file is invalid
    #[error("configuration error: {0}")]
    BadConfig(String),

    /// Unknown disk usage calculator name
    #[error("unsupported disk usage calculator: {0}")]
    UnsupportedCalculator(String),

    /// An exclusion regex failed to compile
    #[error("invalid exclusion pattern '{pattern}': {reason}")]
    RegexCompile { pattern: String, reason: String },
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        match e {
            redb::TableError::TableDoesNotExist(_) => Error::NotFound,
            other => Error::Io(other.to_string()),
        }
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::BadConfig(e.to_string())
    }
}

/// Result type alias for idu
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::Timeout.to_string(), "timeout");
        assert_eq!(Error::NotFound.to_string(), "not found");
        let err = Error::CorruptRecord("bad magic".into());
        assert_eq!(err.to_string(), "corrupt record: bad magic");
    }
}

//! Storage error types

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite operation failed
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The database is not open
    #[error("database is closed")]
    Closed,

    /// A database file name that does not follow `<prefix>_<start>[_<end>].db`
    #[error("invalid database file name: {0}")]
    InvalidFileName(String),

    /// Expression compilation failed
    #[error(transparent)]
    Expr(#[from] crate::expr::ExprError),
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(StorageError::Closed.to_string(), "database is closed");
        assert_eq!(
            StorageError::InvalidFileName("x.db".into()).to_string(),
            "invalid database file name: x.db"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Io(_)));
    }
}

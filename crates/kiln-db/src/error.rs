//! Storage error types for kiln-db.
//!
//! [`StorageError`] covers every failure of the persisted dependency
//! database: SQLite and migration failures, serialization, decoding of
//! persisted keys, and integrity violations. Lock contention is the only
//! transient failure (see [`StorageError::is_transient`]).

use thiserror::Error;

use kiln_core::CoreError;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Applying schema migrations failed.
    #[error("schema migration failed: {0}")]
    Migration(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted key, node or hash could not be decoded.
    #[error("corrupt persisted identifier: {0}")]
    Core(#[from] CoreError),

    /// Filesystem I/O around the database file failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A data integrity violation was detected.
    #[error("integrity error: {reason}")]
    Integrity { reason: String },

    /// The database stayed locked through every retry.
    #[error("database busy after {attempts} attempts: {last}")]
    Busy { attempts: u32, last: String },

    /// An injected failure from the in-memory backend.
    #[error("backend failure: {reason}")]
    Backend { reason: String, transient: bool },
}

impl StorageError {
    /// True for lock contention, which is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            StorageError::Backend { transient, .. } => *transient,
            _ => false,
        }
    }
}

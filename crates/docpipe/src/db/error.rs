//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

use rusqlite::ErrorCode;

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored value could not be decoded into its domain type.
    #[error("Corrupt {column} value in row '{id}': {reason}")]
    Decode {
        id: String,
        column: &'static str,
        reason: String,
    },

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,
}

impl DatabaseError {
    /// True when the failure means the store itself is unreachable (file
    /// missing, locked past the busy timeout, I/O failure) rather than a
    /// problem with the data being written.
    pub fn is_connectivity(&self) -> bool {
        match self {
            DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::CannotOpen
                    | ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::NotADatabase
                    | ErrorCode::DiskFull
                    | ErrorCode::ReadOnly
            ),
            DatabaseError::Io { .. } | DatabaseError::LockPoisoned => true,
            _ => false,
        }
    }
}

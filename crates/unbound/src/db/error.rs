//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the SQLite layer shared by the document store and the queue.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored column could not be decoded (bad JSON, unknown enum value).
    #[error("Corrupt value in column '{column}': {reason}")]
    Corrupt { column: &'static str, reason: String },

    #[error("Deadline passed {late_by:?} before the transaction started")]
    DeadlineExceeded { late_by: std::time::Duration },

    #[error("Blocking database task did not finish: {0}")]
    Interrupted(String),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

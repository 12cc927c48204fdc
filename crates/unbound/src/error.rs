use std::path::PathBuf;
use thiserror::Error;

use crate::db::DatabaseError;
use crate::document::ProcessingState;
use crate::logging::LoggingError;

#[derive(Error, Debug)]
pub enum UnboundError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Input rejected before anything is persisted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Title is required")]
    MissingTitle,

    #[error("Owner is required")]
    MissingOwner,

    #[error("Source location is required")]
    MissingSourceLocation,

    #[error("Structure must contain at least one chapter")]
    EmptyStructure,

    #[error("Chapter with slug '{slug}' has no title")]
    MissingChapterTitle { slug: String },

    #[error("Invalid chapter slug '{slug}': only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidSlug { slug: String },

    #[error("Duplicate chapter slug '{slug}'")]
    DuplicateSlug { slug: String },
}

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Error, Debug)]
pub enum QueueError {
    /// The broker cannot be reached, is closed, or did not answer in time.
    #[error("Queue unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Job not found: {0}")]
    UnknownJob(String),

    #[error("Lease on job '{job_id}' is no longer held by '{worker_id}'")]
    LeaseLost { job_id: String, worker_id: String },

    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl QueueError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        QueueError::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::Unavailable { .. })
    }
}

impl From<DatabaseError> for QueueError {
    fn from(e: DatabaseError) -> Self {
        QueueError::unavailable(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Invalid state transition for document '{document_id}': expected '{expected}', found '{actual}'")]
    InvalidStateTransition {
        document_id: String,
        expected: ProcessingState,
        actual: ProcessingState,
    },

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl ReconcileError {
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, ReconcileError::InvalidStateTransition { .. })
    }
}

pub type Result<T> = std::result::Result<T, UnboundError>;

//! Durable handoff between document upload and asynchronous processing.
//!
//! Uploads become `pending` [`DocumentRecord`]s and a job on the
//! `pdf-processing` queue. Workers consume the queue and move each document
//! through `processing` to `completed` or `failed` via guarded transitions.

pub mod app;
pub mod config;
pub mod db;
pub mod document;
pub mod enqueue;
pub mod error;
pub mod events;
pub mod logging;
pub mod queue;
pub mod reconcile;
pub mod worker;

pub use app::UnboundApp;
pub use config::{load_config, Config, QueueConfig};
pub use db::Database;
pub use document::{ChapterNode, DocumentRecord, DocumentService, NewDocument, ProcessingState};
pub use enqueue::{EnqueueOutcome, EnqueueService};
pub use error::{
    ConfigError, DocumentError, QueueError, ReconcileError, Result, UnboundError, ValidationError,
};
pub use events::{DocumentEvent, DocumentEventBroadcaster};
pub use logging::init_logging;
pub use queue::{JobPayload, JobQueue, SqliteQueue, SubmitOptions, PDF_PROCESSING_QUEUE};
pub use reconcile::StatusReconciler;
pub use worker::{ConsumerPool, JobOutcome, JobProcessor, ProcessingOutput, QueueConsumer};

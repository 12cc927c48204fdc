//! Durable processing queue.

mod client;
mod sqlite;

pub use client::{
    AbandonedJob, Backoff, Delivery, FailureOutcome, JobHandle, JobPayload, JobQueue,
    ProcessingJob, QueueStats, SubmitOptions,
};
pub use sqlite::SqliteQueue;

/// Queue consumed by the PDF processing workers.
pub const PDF_PROCESSING_QUEUE: &str = "pdf-processing";

/// Job name stored with every submitted job.
pub const PROCESS_PDF_JOB: &str = "process-pdf";

//! Queue-facing types and the producer seam.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Wire payload read by processing workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub document_id: String,
    pub source_location: String,
}

impl JobPayload {
    pub fn new(document_id: impl Into<String>, source_location: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            source_location: source_location.into(),
        }
    }
}

/// Delay between a failed delivery and the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay: u64 },
    /// `delay * 2^(attempt - 1)` milliseconds.
    Exponential { delay: u64 },
}

impl Backoff {
    /// Wait before the delivery that follows failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => Duration::from_millis(delay),
            Backoff::Exponential { delay } => {
                let exponent = attempt.saturating_sub(1);
                let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
                Duration::from_millis(delay.saturating_mul(factor))
            }
        }
    }
}

/// Per-job delivery policy, stored alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOptions {
    /// Total deliveries before the job is abandoned.
    #[serde(rename = "attempts")]
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Drop the job from the log once a consumer acknowledges it.
    pub remove_on_complete: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential { delay: 5000 },
            remove_on_complete: true,
        }
    }
}

/// Returned by a successful submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    pub queue: String,
    /// True when an outstanding or completed job for the same document was
    /// found and nothing new was enqueued.
    pub deduplicated: bool,
}

/// A job as seen by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingJob {
    pub job_id: String,
    pub document_id: String,
    pub source_location: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl ProcessingJob {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// A reserved job together with the lease that guards it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: ProcessingJob,
    pub worker_id: String,
    pub lease_expires_at: DateTime<Utc>,
}

/// What the queue did with a delivery reported as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { next_attempt: u32, delay: Duration },
    Abandoned,
}

/// A job that ran out of attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedJob {
    pub job_id: String,
    pub document_id: String,
    pub source_location: String,
    pub attempts_made: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub abandoned: u64,
}

/// Producer side of the processing queue.
///
/// `submit` returns once the job is durable and visible to consumers; it
/// never waits for processing.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(
        &self,
        payload: JobPayload,
        options: &SubmitOptions,
    ) -> Result<JobHandle, QueueError>;
}

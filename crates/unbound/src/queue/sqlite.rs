//! SQLite-backed queue with leases, retries and idempotent submit.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::client::{
    AbandonedJob, Delivery, FailureOutcome, JobHandle, JobPayload, JobQueue, QueueStats,
    SubmitOptions,
};
use super::PROCESS_PDF_JOB;
use crate::config::QueueConfig;
use crate::db::job_repo::{self, LeaseOutcome, QueueJobRow};
use crate::db::Database;
use crate::error::QueueError;

/// Extra wait past the operation deadline for a transaction that started in
/// time to commit.
pub(crate) const COMMIT_GRACE: Duration = Duration::from_millis(100);

/// A named queue stored in the shared database.
///
/// Every call runs on the blocking pool and is bounded by the configured
/// operation timeout. A closed queue, a database failure or a timeout all
/// surface as [`QueueError::Unavailable`]. Clones share the open/closed state.
#[derive(Clone)]
pub struct SqliteQueue {
    name: String,
    db: Database,
    lease: Duration,
    operation_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl SqliteQueue {
    /// Opens the queue database at `path`.
    pub fn open(path: &Path, config: &QueueConfig) -> Result<Self, QueueError> {
        let db = Database::open_with_busy_timeout(path, config.operation_timeout())?;
        Ok(Self::with_database(db, config))
    }

    /// Uses an already-open database, typically the one the document store uses.
    pub fn with_database(db: Database, config: &QueueConfig) -> Self {
        log::info!(
            "Queue '{}' ready (lease {:?}, timeout {:?})",
            config.name,
            config.lease(),
            config.operation_timeout()
        );
        Self {
            name: config.name.clone(),
            db,
            lease: config.lease(),
            operation_timeout: config.operation_timeout(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn open_in_memory(config: &QueueConfig) -> Result<Self, QueueError> {
        let db = Database::open_in_memory()?;
        Ok(Self::with_database(db, config))
    }

    /// Stops accepting calls. Jobs already stored stay put.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::info!("Queue '{}' closed", self.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &str, DateTime<Utc>) -> Result<T, QueueError> + Send + 'static,
    {
        if self.is_closed() {
            return Err(QueueError::unavailable(format!(
                "queue '{}' is closed",
                self.name
            )));
        }

        // A task still blocked on the lock when the caller gives up finds the
        // deadline passed and writes nothing.
        let db = self.db.until(Instant::now() + self.operation_timeout);
        let name = self.name.clone();
        let task = tokio::task::spawn_blocking(move || f(&db, &name, Utc::now()));

        match tokio::time::timeout(self.operation_timeout + COMMIT_GRACE, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(QueueError::unavailable(format!("{} task failed: {}", op, e))),
            Err(_) => Err(QueueError::unavailable(format!(
                "{} timed out after {:?}",
                op, self.operation_timeout
            ))),
        }
    }

    /// Requeues jobs whose lease expired and returns the ones that ran out
    /// of attempts.
    pub async fn reclaim_expired(&self) -> Result<Vec<AbandonedJob>, QueueError> {
        let abandoned = self
            .run("reclaim", |db, queue, now| {
                Ok(job_repo::reclaim_expired(db, queue, now)?)
            })
            .await?;
        for job in &abandoned {
            log::warn!(
                "Job {} for document {} abandoned after {} attempts: lease expired",
                job.job_id,
                job.document_id,
                job.attempts_made
            );
        }
        Ok(abandoned)
    }

    /// Claims the next ready job for `worker_id`, if any.
    pub async fn reserve(&self, worker_id: &str) -> Result<Option<Delivery>, QueueError> {
        let worker = worker_id.to_string();
        let lease = self.lease;
        self.run("reserve", move |db, queue, now| {
            let reserved = job_repo::reserve(db, queue, &worker, lease, now)?;
            Ok(reserved.map(|(job, lease_expires_at)| Delivery {
                job,
                worker_id: worker,
                lease_expires_at,
            }))
        })
        .await
    }

    /// Acknowledges a delivery as processed.
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let job_id = delivery.job.job_id.clone();
        let worker = delivery.worker_id.clone();
        self.run("ack", move |db, _, now| {
            match job_repo::ack(db, &job_id, &worker, now)? {
                LeaseOutcome::Done(()) => Ok(()),
                LeaseOutcome::UnknownJob => Err(QueueError::UnknownJob(job_id)),
                LeaseOutcome::LeaseLost => Err(QueueError::LeaseLost {
                    job_id,
                    worker_id: worker,
                }),
            }
        })
        .await
    }

    /// Reports a failed delivery.
    pub async fn fail(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<FailureOutcome, QueueError> {
        let job_id = delivery.job.job_id.clone();
        let worker = delivery.worker_id.clone();
        let reason = reason.to_string();
        let outcome = self
            .run("fail", move |db, _, now| {
                match job_repo::fail(db, &job_id, &worker, &reason, now)? {
                    LeaseOutcome::Done(outcome) => Ok(outcome),
                    LeaseOutcome::UnknownJob => Err(QueueError::UnknownJob(job_id)),
                    LeaseOutcome::LeaseLost => Err(QueueError::LeaseLost {
                        job_id,
                        worker_id: worker,
                    }),
                }
            })
            .await?;

        match &outcome {
            FailureOutcome::Retrying {
                next_attempt,
                delay,
            } => log::info!(
                "Job {} will be retried (attempt {}) in {:?}",
                delivery.job.job_id,
                next_attempt,
                delay
            ),
            FailureOutcome::Abandoned => log::warn!(
                "Job {} for document {} abandoned after {} attempts",
                delivery.job.job_id,
                delivery.job.document_id,
                delivery.job.attempt_count
            ),
        }
        Ok(outcome)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.run("stats", |db, queue, _| Ok(job_repo::stats(db, queue)?))
            .await
    }

    pub async fn abandoned_jobs(&self) -> Result<Vec<AbandonedJob>, QueueError> {
        self.run("abandoned", |db, queue, _| {
            Ok(job_repo::list_abandoned(db, queue)?)
        })
        .await
    }

    /// Abandoned jobs whose document has not been escalated yet.
    pub async fn pending_escalations(&self) -> Result<Vec<AbandonedJob>, QueueError> {
        self.run("pending escalations", |db, queue, _| {
            Ok(job_repo::list_unescalated(db, queue)?)
        })
        .await
    }

    /// Records that an abandoned job's document was escalated.
    pub async fn mark_escalated(&self, job_id: &str) -> Result<(), QueueError> {
        let job_id = job_id.to_string();
        self.run("mark escalated", move |db, _, now| {
            if !job_repo::mark_escalated(db, &job_id, now)? {
                log::debug!("Job {} was already escalated or is not abandoned", job_id);
            }
            Ok(())
        })
        .await
    }

    /// Raw row of a job, for inspection.
    pub async fn job(&self, job_id: &str) -> Result<Option<QueueJobRow>, QueueError> {
        let job_id = job_id.to_string();
        self.run("find", move |db, _, _| Ok(job_repo::find_by_id(db, &job_id)?))
            .await
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(
        &self,
        payload: JobPayload,
        options: &SubmitOptions,
    ) -> Result<JobHandle, QueueError> {
        let options = options.clone();
        self.run("submit", move |db, queue, now| {
            Ok(job_repo::submit(
                db,
                queue,
                PROCESS_PDF_JOB,
                &payload,
                &options,
                now,
            )?)
        })
        .await
    }
}

//! Consumer side of the processing queue.
//!
//! A consumer reserves one job at a time, moves the document through its
//! lifecycle via the [`StatusReconciler`], and settles the job with the queue.
//! When the queue gives up on a job the document is escalated to `failed`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::db;
use crate::document::{ChapterNode, ProcessingState};
use crate::error::{ReconcileError, UnboundError};
use crate::queue::{Delivery, FailureOutcome, JobQueue, ProcessingJob, SqliteQueue};
use crate::reconcile::StatusReconciler;

/// Result of extracting a document.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingOutput {
    pub structure: Vec<ChapterNode>,
    pub page_count: u32,
}

/// Turns a source document into its chapter structure.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Returns a human-readable reason on failure; it is recorded on the job
    /// and, once retries are exhausted, on the document.
    async fn process(&self, job: &ProcessingJob) -> Result<ProcessingOutput, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    DocumentMissing,
    /// The document already reached a terminal state.
    AlreadyFinished(ProcessingState),
}

/// What a single consumer step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// No job was ready.
    Idle,
    Completed {
        document_id: String,
    },
    Retrying {
        document_id: String,
        next_attempt: u32,
        delay: Duration,
    },
    /// Retries exhausted; the document was escalated to `failed`.
    Failed {
        document_id: String,
        reason: String,
    },
    Skipped {
        document_id: String,
        reason: SkipReason,
    },
    /// The store refused the completion; the job was acknowledged anyway.
    Rejected {
        document_id: String,
        error: String,
    },
}

pub struct QueueConsumer {
    queue: SqliteQueue,
    reconciler: StatusReconciler,
    processor: Arc<dyn JobProcessor>,
}

impl QueueConsumer {
    pub fn new(
        queue: SqliteQueue,
        reconciler: StatusReconciler,
        processor: Arc<dyn JobProcessor>,
    ) -> Self {
        Self {
            queue,
            reconciler,
            processor,
        }
    }

    pub fn queue(&self) -> &SqliteQueue {
        &self.queue
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Reclaims expired leases and escalates abandoned jobs, then processes
    /// at most one job.
    pub async fn run_once(&self, worker_id: &str) -> Result<JobOutcome, UnboundError> {
        self.queue.reclaim_expired().await?;
        for abandoned in self.queue.pending_escalations().await? {
            let reason = abandoned
                .last_error
                .unwrap_or_else(|| "lease expired".to_string());
            self.escalate(&abandoned.job_id, &abandoned.document_id, &reason)
                .await?;
        }

        let Some(delivery) = self.queue.reserve(worker_id).await? else {
            return Ok(JobOutcome::Idle);
        };
        let document_id = delivery.job.document_id.clone();
        log::debug!(
            "Worker {} reserved job {} for document {} (attempt {}/{})",
            worker_id,
            delivery.job.job_id,
            document_id,
            delivery.job.attempt_count,
            delivery.job.max_attempts
        );

        let current = {
            let id = document_id.clone();
            self.reconcile(move |r| r.current_state(&id)).await
        };
        match current {
            Ok(ProcessingState::Pending) => {
                let id = document_id.clone();
                match self.reconcile(move |r| r.mark_processing(&id)).await {
                    Ok(_) => {}
                    Err(ReconcileError::InvalidStateTransition { actual, .. })
                        if actual.is_terminal() =>
                    {
                        return self.skip(&delivery, SkipReason::AlreadyFinished(actual)).await;
                    }
                    // Another delivery got there first; the completion write is guarded anyway.
                    Err(ReconcileError::InvalidStateTransition { .. }) => {}
                    Err(ReconcileError::NotFound(_)) => {
                        return self.skip(&delivery, SkipReason::DocumentMissing).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(ProcessingState::Processing) => {
                log::info!(
                    "Document {} is already processing, resuming on attempt {}",
                    document_id,
                    delivery.job.attempt_count
                );
            }
            Ok(state) => {
                return self.skip(&delivery, SkipReason::AlreadyFinished(state)).await;
            }
            Err(ReconcileError::NotFound(_)) => {
                return self.skip(&delivery, SkipReason::DocumentMissing).await;
            }
            Err(e) => return Err(e.into()),
        }

        let budget = (delivery.lease_expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let result = match tokio::time::timeout(budget, self.processor.process(&delivery.job)).await
        {
            Ok(result) => result,
            Err(_) => Err(format!("processing exceeded lease of {:?}", self.queue.lease())),
        };

        match result {
            Ok(output) => self.complete(&delivery, output).await,
            Err(reason) => self.handle_failure(&delivery, &reason).await,
        }
    }

    async fn complete(
        &self,
        delivery: &Delivery,
        output: ProcessingOutput,
    ) -> Result<JobOutcome, UnboundError> {
        let document_id = delivery.job.document_id.clone();

        let completion = {
            let id = document_id.clone();
            self.reconcile(move |r| r.mark_completed(&id, &output.structure, output.page_count))
                .await
        };
        match completion {
            Ok(_) => {
                self.settle(delivery).await?;
                Ok(JobOutcome::Completed { document_id })
            }
            Err(ReconcileError::Validation(e)) => {
                self.handle_failure(delivery, &format!("invalid structure: {}", e))
                    .await
            }
            Err(e @ ReconcileError::InvalidStateTransition { .. }) => {
                log::error!(
                    "Completion of document {} refused, dropping job {}: {}",
                    document_id,
                    delivery.job.job_id,
                    e
                );
                self.settle(delivery).await?;
                Ok(JobOutcome::Rejected {
                    document_id,
                    error: e.to_string(),
                })
            }
            Err(ReconcileError::NotFound(_)) => {
                self.skip(delivery, SkipReason::DocumentMissing).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_failure(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<JobOutcome, UnboundError> {
        let document_id = delivery.job.document_id.clone();
        log::warn!(
            "Job {} for document {} failed on attempt {}: {}",
            delivery.job.job_id,
            document_id,
            delivery.job.attempt_count,
            reason
        );

        match self.queue.fail(delivery, reason).await? {
            FailureOutcome::Retrying {
                next_attempt,
                delay,
            } => Ok(JobOutcome::Retrying {
                document_id,
                next_attempt,
                delay,
            }),
            FailureOutcome::Abandoned => {
                self.escalate(&delivery.job.job_id, &document_id, reason)
                    .await?;
                Ok(JobOutcome::Failed {
                    document_id,
                    reason: reason.to_string(),
                })
            }
        }
    }

    async fn skip(&self, delivery: &Delivery, reason: SkipReason) -> Result<JobOutcome, UnboundError> {
        log::info!(
            "Skipping job {} for document {}: {:?}",
            delivery.job.job_id,
            delivery.job.document_id,
            reason
        );
        self.settle(delivery).await?;
        Ok(JobOutcome::Skipped {
            document_id: delivery.job.document_id.clone(),
            reason,
        })
    }

    /// Acks a delivery. Losing the lease at this point only means the job
    /// will be redelivered and skipped, so it is logged rather than raised.
    async fn settle(&self, delivery: &Delivery) -> Result<(), UnboundError> {
        match self.queue.ack(delivery).await {
            Ok(()) => Ok(()),
            Err(e @ crate::error::QueueError::LeaseLost { .. }) => {
                log::warn!("{}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Runs a reconciler call off the runtime's worker threads.
    async fn reconcile<T, F>(&self, f: F) -> Result<T, ReconcileError>
    where
        F: FnOnce(&StatusReconciler) -> Result<T, ReconcileError> + Send + 'static,
        T: Send + 'static,
    {
        let reconciler = self.reconciler.clone();
        db::blocking(move || f(&reconciler)).await
    }

    /// Dead-letter escalation for a job the queue gave up on.
    ///
    /// The job stays pending escalation until the document store has given
    /// a definite answer, so a crash or store error here is retried on the
    /// next step.
    async fn escalate(
        &self,
        job_id: &str,
        document_id: &str,
        reason: &str,
    ) -> Result<(), UnboundError> {
        let failed = {
            let (id, reason) = (document_id.to_string(), reason.to_string());
            self.reconcile(move |r| r.mark_failed(&id, &reason)).await
        };
        match failed {
            Ok(_) => log::warn!("Document {} marked failed: {}", document_id, reason),
            Err(ReconcileError::InvalidStateTransition { actual, .. }) => log::info!(
                "Not escalating document {}: already {}",
                document_id,
                actual
            ),
            Err(ReconcileError::NotFound(_)) => {
                log::info!("Not escalating document {}: it no longer exists", document_id)
            }
            Err(e) => {
                log::error!("Failed to escalate document {}: {}", document_id, e);
                return Ok(());
            }
        }
        self.queue.mark_escalated(job_id).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replays scripted results, then succeeds.
    #[derive(Default)]
    pub struct ScriptedProcessor {
        pub script: Mutex<VecDeque<Result<ProcessingOutput, String>>>,
        pub calls: Mutex<Vec<ProcessingJob>>,
    }

    impl ScriptedProcessor {
        pub fn new(script: Vec<Result<ProcessingOutput, String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    pub fn sample_output() -> ProcessingOutput {
        ProcessingOutput {
            structure: vec![ChapterNode::new("Cells", "cells").with_page_start(1)],
            page_count: 42,
        }
    }

    #[async_trait]
    impl JobProcessor for ScriptedProcessor {
        async fn process(&self, job: &ProcessingJob) -> Result<ProcessingOutput, String> {
            self.calls.lock().unwrap().push(job.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(sample_output()))
        }
    }
}

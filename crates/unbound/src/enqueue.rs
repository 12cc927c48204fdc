//! Hands newly created documents to the processing queue.

use std::sync::Arc;
use std::time::Duration;

use crate::config::QueueConfig;
use crate::queue::{JobHandle, JobPayload, JobQueue, SubmitOptions};

/// How much longer than the queue's own operation timeout a submit may take.
/// The queue reports its timeout first and guarantees nothing was written.
const SUBMIT_GRACE: Duration = Duration::from_millis(500);

/// Result of an enqueue attempt. Never an error: a document whose job could
/// not be submitted simply stays `pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Submitted(JobHandle),
    Deferred { reason: String },
}

impl EnqueueOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, EnqueueOutcome::Submitted(_))
    }
}

#[derive(Clone)]
pub struct EnqueueService {
    queue: Arc<dyn JobQueue>,
    options: SubmitOptions,
    submit_timeout: Duration,
}

impl EnqueueService {
    pub fn new(queue: Arc<dyn JobQueue>, config: &QueueConfig) -> Self {
        Self::with_options(
            queue,
            config.submit_options(),
            config.operation_timeout() + SUBMIT_GRACE,
        )
    }

    pub fn with_options(
        queue: Arc<dyn JobQueue>,
        options: SubmitOptions,
        submit_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            options,
            submit_timeout,
        }
    }

    pub fn options(&self) -> &SubmitOptions {
        &self.options
    }

    /// Submits a processing job for `document_id`. Queue failures and
    /// timeouts are logged and reported as [`EnqueueOutcome::Deferred`].
    pub async fn enqueue_processing(
        &self,
        document_id: &str,
        source_location: &str,
    ) -> EnqueueOutcome {
        let payload = JobPayload::new(document_id, source_location);
        let submit = self.queue.submit(payload, &self.options);

        let reason = match tokio::time::timeout(self.submit_timeout, submit).await {
            Ok(Ok(handle)) => {
                if handle.deduplicated {
                    log::info!(
                        "Document {} already has job {} on '{}'",
                        document_id,
                        handle.job_id,
                        handle.queue
                    );
                } else {
                    log::info!(
                        "Enqueued job {} for document {} on '{}'",
                        handle.job_id,
                        document_id,
                        handle.queue
                    );
                }
                return EnqueueOutcome::Submitted(handle);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("submit timed out after {:?}", self.submit_timeout),
        };

        log::warn!(
            "Could not enqueue document {} on '{}', leaving it pending: {}",
            document_id,
            self.queue.name(),
            reason
        );
        EnqueueOutcome::Deferred { reason }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::queue::SqliteQueue;

    #[tokio::test]
    async fn test_enqueue_submits_payload() {
        let queue = Arc::new(RecordingQueue::default());
        let service = EnqueueService::new(queue.clone(), &QueueConfig::default());

        let outcome = service
            .enqueue_processing("doc-1", "s3://bucket/bio101.pdf")
            .await;
        assert!(outcome.is_submitted());

        let submitted = queue.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0, JobPayload::new("doc-1", "s3://bucket/bio101.pdf"));
        assert_eq!(submitted[0].1, SubmitOptions::default());
    }

    #[tokio::test]
    async fn test_enqueue_swallows_unavailable() {
        let service = EnqueueService::new(Arc::new(DownQueue), &QueueConfig::default());

        let outcome = service.enqueue_processing("doc-1", "file://a.pdf").await;
        match outcome {
            EnqueueOutcome::Deferred { reason } => assert!(reason.contains("connection refused")),
            other => panic!("expected deferred, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timed_out_submit_leaves_no_job() {
        let config = QueueConfig {
            operation_timeout_ms: 50,
            ..QueueConfig::default()
        };
        let queue = SqliteQueue::open_in_memory(&config).unwrap();
        let service = EnqueueService::new(Arc::new(queue.clone()), &config);

        let db = queue.database().clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            db.with_conn(|_| {
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
        });
        locked_rx.recv().unwrap();

        let outcome = service.enqueue_processing("doc-1", "file://a.pdf").await;
        match outcome {
            EnqueueOutcome::Deferred { reason } => {
                assert!(reason.contains("submit timed out after 50ms"), "{}", reason)
            }
            other => panic!("expected deferred, got {:?}", other),
        }

        holder.join().unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.stats().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_enqueue_times_out() {
        let service = EnqueueService::with_options(
            Arc::new(HangingQueue),
            SubmitOptions::default(),
            Duration::from_millis(20),
        );

        let outcome = service.enqueue_processing("doc-1", "file://a.pdf").await;
        match outcome {
            EnqueueOutcome::Deferred { reason } => assert!(reason.contains("timed out")),
            other => panic!("expected deferred, got {:?}", other),
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::worker::consumer::{JobOutcome, QueueConsumer};

/// A fixed set of async consumer loops polling one queue.
pub struct ConsumerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl ConsumerPool {
    /// Spawns `concurrency` consumer loops on the current runtime.
    ///
    /// # Panics
    /// Panics if `concurrency` is 0.
    pub fn start(consumer: Arc<QueueConsumer>, concurrency: usize, poll_interval: Duration) -> Self {
        assert!(concurrency > 0, "concurrency must be > 0");
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pool_id = uuid::Uuid::new_v4().simple().to_string();
        let pool_id = &pool_id[..8];

        let workers = (0..concurrency)
            .map(|i| {
                let worker_id = format!("{}-{}", pool_id, i);
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&consumer),
                    shutdown_rx.clone(),
                    poll_interval,
                ))
            })
            .collect();

        info!("Started {} consumers on '{}'", concurrency, consumer.queue_name());

        Self { workers, shutdown }
    }

    /// Asks every consumer to stop after its current job.
    pub fn shutdown(&self) {
        info!("Shutting down consumer pool...");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every consumer to stop. Call [`ConsumerPool::shutdown`] first.
    pub async fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                error!("Consumer {} panicked: {:?}", i, e);
            } else {
                debug!("Consumer {} finished", i);
            }
        }

        info!("All consumers have stopped");
    }
}

async fn run_worker(
    worker_id: String,
    consumer: Arc<QueueConsumer>,
    mut shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    debug!("Consumer {} started", worker_id);

    loop {
        if *shutdown.borrow_and_update() {
            debug!("Consumer {} received shutdown signal", worker_id);
            break;
        }

        let idle = match consumer.run_once(&worker_id).await {
            Ok(JobOutcome::Idle) => true,
            Ok(outcome) => {
                debug!("Consumer {}: {:?}", worker_id, outcome);
                false
            }
            Err(e) => {
                error!("Consumer {} error: {}", worker_id, e);
                true
            }
        };

        if idle {
            tokio::select! {
                changed = shutdown.changed() => {
                    // Pool dropped without an explicit shutdown.
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    debug!("Consumer {} stopped", worker_id);
}

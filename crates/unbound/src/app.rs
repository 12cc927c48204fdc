//! Wires the document store, queue and reconciler over one database.

use std::sync::Arc;

use crate::config::{resolve_database_path, Config};
use crate::db::Database;
use crate::document::DocumentService;
use crate::enqueue::EnqueueService;
use crate::error::Result;
use crate::events::DocumentEventBroadcaster;
use crate::queue::SqliteQueue;
use crate::reconcile::StatusReconciler;
use crate::worker::{ConsumerPool, JobProcessor, QueueConsumer};

pub struct UnboundApp {
    config: Config,
    db: Database,
    queue: SqliteQueue,
    documents: DocumentService,
    reconciler: StatusReconciler,
    events: DocumentEventBroadcaster,
}

impl UnboundApp {
    /// Opens the configured database file and builds every service on it.
    pub fn open(config: Config) -> Result<Self> {
        let path = resolve_database_path(&config)?;
        let db = Database::open_with_busy_timeout(&path, config.queue.operation_timeout())?;
        Ok(Self::with_database(config, db))
    }

    pub fn open_in_memory(config: Config) -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::with_database(config, db))
    }

    fn with_database(config: Config, db: Database) -> Self {
        let events = DocumentEventBroadcaster::default();
        let queue = SqliteQueue::with_database(db.clone(), &config.queue);
        let enqueue = EnqueueService::new(Arc::new(queue.clone()), &config.queue);
        let documents = DocumentService::new(db.clone(), enqueue).with_events(events.clone());
        let reconciler = StatusReconciler::new(db.clone()).with_events(events.clone());

        Self {
            config,
            db,
            queue,
            documents,
            reconciler,
            events,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn documents(&self) -> &DocumentService {
        &self.documents
    }

    pub fn queue(&self) -> &SqliteQueue {
        &self.queue
    }

    pub fn reconciler(&self) -> &StatusReconciler {
        &self.reconciler
    }

    pub fn events(&self) -> &DocumentEventBroadcaster {
        &self.events
    }

    pub fn consumer(&self, processor: Arc<dyn JobProcessor>) -> QueueConsumer {
        QueueConsumer::new(self.queue.clone(), self.reconciler.clone(), processor)
    }

    /// Starts the configured number of consumers. Must be called inside a
    /// tokio runtime.
    pub fn start_consumers(&self, processor: Arc<dyn JobProcessor>) -> ConsumerPool {
        ConsumerPool::start(
            Arc::new(self.consumer(processor)),
            self.config.worker.concurrency,
            self.config.worker.poll_interval(),
        )
    }

    /// Closes the queue; later enqueues leave documents `pending`.
    pub fn close(&self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{NewDocument, ProcessingState};

    #[tokio::test]
    async fn test_open_file_database() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = Config {
            database_path: Some(temp.path().join("db/unbound.db").to_string_lossy().to_string()),
            ..Config::default()
        };

        let app = UnboundApp::open(config).unwrap();
        let record = app
            .documents()
            .create_document(NewDocument::new("user-1", "Bio 101", "file://bio101.pdf"))
            .await
            .unwrap();

        assert_eq!(record.processing_state, ProcessingState::Pending);
        assert_eq!(app.queue().stats().await.unwrap().waiting, 1);
        assert!(temp.path().join("db/unbound.db").exists());
    }

    #[tokio::test]
    async fn test_closed_app_still_creates_documents() {
        let app = UnboundApp::open_in_memory(Config::default()).unwrap();
        app.close();

        let record = app
            .documents()
            .create_document(NewDocument::new("user-1", "Bio 101", "file://bio101.pdf"))
            .await
            .unwrap();
        assert_eq!(
            app.documents().get_document(&record.id).unwrap().processing_state,
            ProcessingState::Pending
        );

        assert!(app.queue().stats().await.unwrap_err().is_unavailable());
    }
}

//! Test harness for isolated test execution.
//!
//! Each `TestHarness` owns a temporary directory holding its SQLite file, so
//! tests never share queue or document state.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use unbound::config::{Config, QueueConfig};
use unbound::queue::{Backoff, SubmitOptions};
use unbound::worker::JobProcessor;
use unbound::{QueueConsumer, UnboundApp};

pub struct TestHarness {
    temp_dir: TempDir,
    pub db_path: PathBuf,
    pub app: UnboundApp,
}

impl TestHarness {
    /// Harness with a zero-delay fixed backoff so retries are immediately
    /// reservable.
    pub fn new() -> Self {
        Self::with_queue(QueueConfig {
            backoff_ms: 0,
            backoff_kind: unbound::config::BackoffKind::Fixed,
            ..QueueConfig::default()
        })
    }

    pub fn with_queue(queue: QueueConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("data").join("unbound.db");

        let config = Config {
            database_path: Some(db_path.to_string_lossy().to_string()),
            queue,
            ..Config::default()
        };
        let app = UnboundApp::open(config).expect("Failed to open app");

        Self {
            temp_dir,
            db_path,
            app,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn consumer(&self, processor: Arc<dyn JobProcessor>) -> QueueConsumer {
        self.app.consumer(processor)
    }

    pub fn submit_options(&self) -> SubmitOptions {
        self.app.config().queue.submit_options()
    }

    pub fn backoff(&self) -> Backoff {
        self.app.config().queue.backoff()
    }
}

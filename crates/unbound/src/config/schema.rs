use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::queue::{Backoff, SubmitOptions, PDF_PROCESSING_QUEUE};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// SQLite file shared by the document store and the queue. Defaults to
    /// `~/.unbound/data/unbound.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: None,
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_kind")]
    pub backoff_kind: BackoffKind,
    #[serde(default = "default_true")]
    pub remove_on_complete: bool,
    /// Upper bound for a single queue call, including submit.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// How long a consumer may hold a job before it is redelivered.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
}

fn default_queue_name() -> String {
    PDF_PROCESSING_QUEUE.to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    5000
}

fn default_backoff_kind() -> BackoffKind {
    BackoffKind::Exponential
}

fn default_true() -> bool {
    true
}

fn default_operation_timeout_ms() -> u64 {
    2000
}

fn default_lease_ms() -> u64 {
    60_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_kind: default_backoff_kind(),
            remove_on_complete: true,
            operation_timeout_ms: default_operation_timeout_ms(),
            lease_ms: default_lease_ms(),
        }
    }
}

impl QueueConfig {
    pub fn backoff(&self) -> Backoff {
        match self.backoff_kind {
            BackoffKind::Fixed => Backoff::Fixed {
                delay: self.backoff_ms,
            },
            BackoffKind::Exponential => Backoff::Exponential {
                delay: self.backoff_ms,
            },
        }
    }

    pub fn submit_options(&self) -> SubmitOptions {
        SubmitOptions {
            max_attempts: self.max_attempts,
            backoff: self.backoff(),
            remove_on_complete: self.remove_on_complete,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_concurrency() -> usize {
    num_cpus::get()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

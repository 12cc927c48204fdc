pub mod loader;
pub mod schema;

pub use loader::{
    apply_env_overrides, load_config, load_config_from_str, resolve_database_path,
    validate_config,
};
pub use schema::{BackoffKind, Config, LoggingConfig, QueueConfig, WorkerConfig};

use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;

pub const ENV_DATABASE_PATH: &str = "UNBOUND_DATABASE_PATH";
pub const ENV_QUEUE_NAME: &str = "UNBOUND_QUEUE_NAME";
pub const ENV_LOG_LEVEL: &str = "UNBOUND_LOG_LEVEL";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let mut config: Config = serde_json::from_str(content)?;

    apply_env_overrides(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Overrides file settings with `UNBOUND_*` environment variables. Empty
/// values are ignored.
pub fn apply_env_overrides(config: &mut Config) {
    if let Some(path) = non_empty_env(ENV_DATABASE_PATH) {
        config.database_path = Some(path);
    }
    if let Some(name) = non_empty_env(ENV_QUEUE_NAME) {
        config.queue.name = name;
    }
    if let Some(level) = non_empty_env(ENV_LOG_LEVEL) {
        config.logging.level = level;
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let queue = &config.queue;
    if queue.name.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "queue.name must not be empty".to_string(),
        });
    }
    if queue.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "queue.max_attempts must be at least 1".to_string(),
        });
    }
    if queue.operation_timeout_ms == 0 {
        return Err(ConfigError::Validation {
            message: "queue.operation_timeout_ms must be greater than 0".to_string(),
        });
    }
    if queue.lease_ms == 0 {
        return Err(ConfigError::Validation {
            message: "queue.lease_ms must be greater than 0".to_string(),
        });
    }

    if config.worker.concurrency == 0 {
        return Err(ConfigError::Validation {
            message: "worker.concurrency must be at least 1".to_string(),
        });
    }
    if config.worker.poll_interval_ms == 0 {
        return Err(ConfigError::Validation {
            message: "worker.poll_interval_ms must be greater than 0".to_string(),
        });
    }

    if let Some(path) = &config.database_path {
        if path.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "database_path must not be empty when set".to_string(),
            });
        }
    }

    Ok(())
}

/// Resolves the database file, falling back to the per-user default.
pub fn resolve_database_path(config: &Config) -> Result<PathBuf, ConfigError> {
    if let Some(path) = &config.database_path {
        return Ok(expand_home(path));
    }
    crate::db::default_database_path().ok_or_else(|| ConfigError::Validation {
        message: "database_path is not set and no home directory was found".to_string(),
    })
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

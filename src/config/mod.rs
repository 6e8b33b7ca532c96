/// Configuration management for the dagflow engine
///
/// Every knob has a compiled-in default and can be overridden through a
/// `DAGFLOW_*` environment variable, so the binary runs unconfigured locally and
/// is tuned through the environment in containers.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Orchestrator defaults (retries, timeouts, event bus)
    pub engine: EngineConfig,
    /// In-process task queue sizing
    pub queue: QueueConfig,
    /// Built-in node executor limits
    pub nodes: NodesConfig,
    /// SQLite location for workflow definitions and execution records
    pub database: DatabaseConfig,
}

/// Orchestrator defaults, overridable per workflow through `WorkflowSettings`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts per node task, including the first one
    pub default_attempts: u32,
    /// First retry delay; doubles on every further attempt
    pub backoff_base_ms: u64,
    /// Per-attempt node timeout enforced by the task queue
    pub node_timeout_ms: u64,
    /// Whole-execution ceiling; `None` disables the watchdog check
    pub execution_timeout_ms: Option<u64>,
    /// How long a synchronous `execute_workflow` call waits for a terminal status
    pub sync_timeout_ms: u64,
    /// Period of the whole-execution timeout watchdog, which also refreshes
    /// the heartbeat of every live execution
    pub watchdog_interval_ms: u64,
    /// Heartbeat silence after which an unfinished execution counts as interrupted
    pub recovery_grace_ms: u64,
    /// Capacity of the broadcast event bus
    pub event_capacity: usize,
}

/// In-process task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of node attempts running at the same time
    pub concurrency: usize,
}

/// Limits for the built-in node executors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesConfig {
    /// Request timeout of the `http-request` node
    pub http_timeout_ms: u64,
    /// Wall-clock budget of one `custom-code` evaluation
    pub code_timeout_ms: u64,
    /// Lua heap ceiling of one `custom-code` evaluation
    pub code_memory_limit_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding `dagflow.db` (default: "data")
    pub data_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            queue: QueueConfig::default(),
            nodes: NodesConfig::default(),
            database: DatabaseConfig {
                data_dir: std::env::var("DAGFLOW_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_attempts: env_or("DAGFLOW_DEFAULT_ATTEMPTS", 3),
            backoff_base_ms: env_or("DAGFLOW_BACKOFF_BASE_MS", 2000),
            node_timeout_ms: env_or("DAGFLOW_NODE_TIMEOUT_MS", 30_000),
            execution_timeout_ms: std::env::var("DAGFLOW_EXECUTION_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok()),
            sync_timeout_ms: env_or("DAGFLOW_SYNC_TIMEOUT_MS", 300_000),
            watchdog_interval_ms: env_or("DAGFLOW_WATCHDOG_INTERVAL_MS", 1000),
            recovery_grace_ms: env_or("DAGFLOW_RECOVERY_GRACE_MS", 30_000),
            event_capacity: env_or("DAGFLOW_EVENT_CAPACITY", 256),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: env_or("DAGFLOW_QUEUE_CONCURRENCY", 8),
        }
    }
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            http_timeout_ms: env_or("DAGFLOW_HTTP_TIMEOUT_MS", 30_000),
            code_timeout_ms: env_or("DAGFLOW_CODE_TIMEOUT_MS", 5000),
            code_memory_limit_bytes: env_or("DAGFLOW_CODE_MEMORY_LIMIT", 16 * 1024 * 1024),
        }
    }
}

impl DatabaseConfig {
    /// Path of the SQLite file inside the data directory
    pub fn database_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("dagflow.db")
    }
}

/// Read `key` from the environment, keeping `default` when unset or unparsable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("DAGFLOW_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or::<u32>("DAGFLOW_TEST_GARBAGE", 7), 7);
        assert_eq!(env_or::<u32>("DAGFLOW_TEST_UNSET_KEY", 3), 3);
    }

    #[test]
    fn database_path_joins_data_dir() {
        let db = DatabaseConfig {
            data_dir: "/tmp/flows".into(),
        };
        assert_eq!(db.database_path(), std::path::PathBuf::from("/tmp/flows/dagflow.db"));
    }
}

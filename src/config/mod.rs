//! Configuration management for the weaveflow service
//!
//! Server binding, storage location and engine defaults, all overridable
//! through `WEAVEFLOW_*` environment variables for container deployment.

use crate::runtime::options::{ExecutionOptions, RetryPolicy};
use crate::runtime::plan::DEFAULT_MAX_CONCURRENCY;
use crate::runtime::state::DEFAULT_HISTORY_LIMIT;
use crate::validation::{DEFAULT_ENTRY_TYPES, DEFAULT_EXIT_TYPES};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding `weaveflow.db` (default: "data")
    pub data_dir: String,
}

/// Engine defaults applied when a run does not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub retry_policy: RetryPolicy,
    /// Per-invocation processor timeout; `None` waits indefinitely
    pub node_timeout_ms: Option<u64>,
    /// Finished runs kept in memory
    pub history_limit: usize,
    pub entry_types: Vec<String>,
    pub exit_types: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let retry_defaults = RetryPolicy::default();
        Self {
            max_concurrency: env_or("WEAVEFLOW_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY),
            retry_policy: RetryPolicy {
                max_retries: env_or("WEAVEFLOW_MAX_RETRIES", retry_defaults.max_retries),
                retry_delay_ms: env_or("WEAVEFLOW_RETRY_DELAY_MS", retry_defaults.retry_delay_ms),
                backoff_multiplier: env_or("WEAVEFLOW_BACKOFF_MULTIPLIER", retry_defaults.backoff_multiplier),
            },
            node_timeout_ms: std::env::var("WEAVEFLOW_NODE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok()),
            history_limit: env_or("WEAVEFLOW_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT),
            entry_types: DEFAULT_ENTRY_TYPES.iter().map(|t| t.to_string()).collect(),
            exit_types: DEFAULT_EXIT_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    /// Options a run gets when the caller supplies none
    pub fn default_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            max_concurrency: Some(self.max_concurrency),
            timeout_ms: self.node_timeout_ms,
            retry_policy: Some(self.retry_policy.clone()),
            ..ExecutionOptions::default()
        }
    }

    /// Node types whose failure aborts a run unless overridden
    pub fn critical_types(&self) -> Vec<String> {
        self.entry_types.iter().chain(&self.exit_types).cloned().collect()
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("WEAVEFLOW_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("WEAVEFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("WEAVEFLOW_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            engine: EngineConfig::default(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("⚠️ Ignoring unparsable {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

//! Per-run execution options
//!
//! Every field is optional on the wire; missing values fall back to the
//! engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduling strategy for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
    Conditional,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Conditional => "conditional",
        }
    }
}

/// Retry behaviour for failing nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt; a node runs at most `max_retries + 1` times
    pub max_retries: u32,
    /// Base delay, multiplied by `backoff_multiplier^retry_count`
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry_count` (1-based)
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry_count as i32);
        let millis = (self.retry_delay_ms as f64 * factor).min(u64::MAX as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Caller-supplied options for `execute_workflow`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionOptions {
    /// Force a strategy instead of letting the planner choose
    pub mode: Option<ExecutionMode>,
    /// In-flight node limit for parallel runs
    pub max_concurrency: Option<usize>,
    /// Per-processor-invocation timeout
    pub timeout_ms: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
    /// Parallel groups wait for every member (default true)
    pub wait_for_all: Option<bool>,
    /// Parallel groups tolerate member failures (default true)
    pub continue_on_error: Option<bool>,
    /// Node types whose failure aborts the run; defaults to entry and exit types
    pub critical_node_types: Option<Vec<String>>,
}

impl ExecutionOptions {
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

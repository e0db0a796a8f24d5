//! Lifecycle observations for running workflows
//!
//! The engine publishes typed events on a broadcast channel. Consumers (the
//! HTTP layer, logs, tests) subscribe independently; publishing never blocks
//! and never fails a run, even when nobody is listening.

use crate::runtime::plan::{NodeStatus, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutionEvent {
    #[serde(rename_all = "camelCase")]
    RunStarted {
        run_id: String,
        workflow_id: String,
        mode: String,
        node_count: usize,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    NodeStarted {
        run_id: String,
        node_id: String,
        node_type: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// Intermediate progress, e.g. a retry being scheduled or a branch decision
    #[serde(rename_all = "camelCase")]
    NodeProgress {
        run_id: String,
        node_id: String,
        node_type: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    NodeCompleted {
        run_id: String,
        node_id: String,
        node_type: String,
        duration_ms: u64,
        output: Value,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    NodeFailed {
        run_id: String,
        node_id: String,
        node_type: String,
        error: String,
        retry_count: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    RunCompleted {
        run_id: String,
        workflow_id: String,
        status: RunStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    RunFailed {
        run_id: String,
        workflow_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeProgress { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. } => run_id,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeProgress { node_id, .. }
            | Self::NodeCompleted { node_id, .. }
            | Self::NodeFailed { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// Broadcast bus for execution events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: ExecutionEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("📭 Execution event dropped: no subscribers");
        }
    }
}

/// Per-node status report delivered to an `execute_workflow` caller
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdate {
    pub run_id: String,
    pub node_id: String,
    pub status: NodeStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    pub output: Option<Value>,
}

/// Optional per-node callback, independent of the event bus
pub type NodeUpdateCallback = Arc<dyn Fn(NodeUpdate) + Send + Sync>;

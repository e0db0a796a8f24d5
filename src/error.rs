//! Error types for the workflow engine

use thiserror::Error;

use crate::validation::ValidationResult;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by plan construction and run execution
#[derive(Debug, Error)]
pub enum EngineError {
    /// Structural validation failed; no plan was built
    #[error("Workflow validation failed: {}", .0.error_summary())]
    Validation(ValidationResult),

    /// The dependency graph contains one or more cycles
    #[error("Circular dependency detected: {}", cycles.join("; "))]
    CircularDependency { cycles: Vec<String> },

    /// Topological sort could not place every node
    #[error("Topological sort left {} node(s) unordered: {}", missing.len(), missing.join(", "))]
    IncompleteOrder { missing: Vec<String> },

    /// Neither a registered processor nor the fallback could be resolved
    #[error("No processor registered for node type '{node_type}' and no fallback processor is configured")]
    ProcessorUnavailable { node_type: String },

    /// A critical node exhausted its retries
    #[error("Critical node '{node_id}' ({node_type}) failed after {attempts} attempt(s): {message}")]
    CriticalNodeFailed {
        node_id: String,
        node_type: String,
        attempts: u32,
        message: String,
    },

    /// A member of a parallel group failed and the group does not tolerate errors
    #[error("Parallel group '{group_id}' aborted: node '{node_id}' failed: {message}")]
    GroupFailed {
        group_id: String,
        node_id: String,
        message: String,
    },

    /// A node referenced by the plan is missing from it
    #[error("Node '{0}' is not part of the execution plan")]
    UnknownNode(String),

    /// The run was cancelled
    #[error("Execution cancelled")]
    Cancelled,

    /// A strategy panicked or otherwise failed outside any node
    #[error("Execution aborted: {0}")]
    Aborted(String),
}

impl EngineError {
    /// Map key under which this error is recorded in a plan's error map
    pub fn record_key(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            _ => "root",
        }
    }
}

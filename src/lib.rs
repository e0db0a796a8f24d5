//! weaveflow: graph-validated workflow execution engine
//!
//! Workflows are directed graphs of typed nodes. The engine proves a graph is
//! executable, builds a run plan, schedules nodes sequentially, in parallel
//! waves or along conditional branches, and runs each node through a
//! retrying lifecycle against pluggable processors.

pub mod config;
pub mod error;
pub mod graph;
pub mod validation;

// Workflow definitions, persistence and the hot-reload registry
pub mod workflow;

pub mod runtime;

pub mod api;
pub mod server;

pub use error::EngineError;
pub use runtime::{
    ExecutionEngine, ExecutionMode, ExecutionOptions, ExecutionPlan, NodeProcessor, ProcessorRegistry,
    RetryPolicy,
};
pub use server::start_server;
pub use validation::{ValidationResult, WorkflowValidator};
pub use workflow::{Edge, Node, Workflow};

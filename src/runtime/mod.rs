//! Runtime execution engine
//!
//! Plan construction, the three scheduling strategies, the per-node
//! lifecycle with retry and backoff, run state tracking and the processor
//! contract with its built-in implementations.

pub mod condition;
pub mod engine;
pub mod events;
pub mod lifecycle;
pub mod options;
pub mod plan;
pub mod processor;
pub mod processors;
pub mod state;
pub mod strategy;
pub mod template;

pub use engine::ExecutionEngine;
pub use events::{EventBus, ExecutionEvent, NodeUpdate, NodeUpdateCallback};
pub use options::{ExecutionMode, ExecutionOptions, RetryPolicy};
pub use plan::{ExecutionContext, ExecutionPlan, NodeStatus, RunStatus};
pub use processor::{NodeProcessor, ProcessorRegistry, RunView};
pub use state::{ExecutionStateStore, ExecutionStats};

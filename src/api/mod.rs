//! HTTP API layer
//!
//! - Workflow CRUD and validation under `/api/workflows`
//! - Run execution, inspection and cancellation under `/api/executions`

pub mod executions;
pub mod workflows;

pub use executions::create_execution_routes;
pub use workflows::{create_workflow_routes, AppState};

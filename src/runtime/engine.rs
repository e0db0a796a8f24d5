//! Workflow execution engine
//!
//! Validates a workflow graph, turns it into an execution plan, picks the
//! scheduling strategy and drives the run to a terminal status. An engine
//! instance owns its processor registry, event bus and state store; nothing
//! is global.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::runtime::events::{EventBus, ExecutionEvent, NodeUpdateCallback};
use crate::runtime::lifecycle::RunScope;
use crate::runtime::options::ExecutionOptions;
use crate::runtime::plan::{ExecutionPlan, PlanBuilder, RunStatus};
use crate::runtime::processor::ProcessorRegistry;
use crate::runtime::state::ExecutionStateStore;
use crate::runtime::strategy::strategy_for;
use crate::validation::{IssueCategory, Severity, ValidationIssue, ValidationResult, WorkflowValidator};
use crate::workflow::types::{Edge, Node};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct ExecutionEngine {
    registry: Arc<ProcessorRegistry>,
    events: EventBus,
    state: Arc<ExecutionStateStore>,
    validator: WorkflowValidator,
    planner: PlanBuilder,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(registry: ProcessorRegistry, config: EngineConfig) -> Self {
        tracing::info!(
            "🚀 Initializing execution engine ({} processor types)",
            registry.node_types().len()
        );
        Self {
            registry: Arc::new(registry),
            events: EventBus::default(),
            state: Arc::new(ExecutionStateStore::new(config.history_limit)),
            validator: WorkflowValidator::new(config.entry_types.clone(), config.exit_types.clone()),
            planner: PlanBuilder::new(
                config.retry_policy.clone(),
                config.max_concurrency,
                config.node_timeout_ms,
                config.critical_types(),
            ),
            config,
        }
    }

    /// Engine with the built-in processors
    pub fn with_builtins(config: EngineConfig) -> Self {
        Self::new(ProcessorRegistry::with_builtins(), config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn state(&self) -> &ExecutionStateStore {
        &self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Structural validation plus unknown-node-type warnings
    pub fn validate(&self, nodes: &[Node], edges: &[Edge]) -> ValidationResult {
        let mut result = self.validator.validate(nodes, edges);

        let unknown: BTreeSet<&str> = nodes
            .iter()
            .map(|node| node.node_type.as_str())
            .filter(|node_type| !self.registry.contains(node_type))
            .collect();
        for node_type in unknown {
            let node_ids = nodes
                .iter()
                .filter(|node| node.node_type == node_type)
                .map(|node| node.id.clone())
                .collect();
            let suggestions = self.registry.suggestions(node_type);
            let suggestion = if suggestions.is_empty() {
                format!(
                    "Register a processor for '{}' or use one of: {}",
                    node_type,
                    self.registry.node_types().join(", ")
                )
            } else {
                format!("Did you mean: {}?", suggestions.join(", "))
            };
            if self.registry.has_fallback() {
                result.push_warning(ValidationIssue {
                    severity: Severity::Warning,
                    category: IssueCategory::UnknownNodeType,
                    node_ids,
                    message: format!(
                        "No processor registered for node type '{}'; it will run as pass-through",
                        node_type
                    ),
                    suggestion,
                });
            } else {
                result.push_error(ValidationIssue {
                    severity: Severity::Error,
                    category: IssueCategory::UnknownNodeType,
                    node_ids,
                    message: format!(
                        "No processor registered for node type '{}' and no fallback processor is configured",
                        node_type
                    ),
                    suggestion,
                });
            }
        }
        result
    }

    /// Validate and build a plan without running it
    pub fn build_plan(
        &self,
        workflow_id: &str,
        nodes: &[Node],
        edges: &[Edge],
        options: &ExecutionOptions,
    ) -> Result<ExecutionPlan> {
        let validation = self.validate(nodes, edges);
        if !validation.is_valid {
            tracing::error!(
                "🚫 Workflow '{}' failed validation: {}",
                workflow_id,
                validation.error_summary()
            );
            return Err(EngineError::Validation(validation));
        }

        let mut plan = self.planner.build(workflow_id, nodes, edges, options)?;
        plan.warnings = validation.warnings.iter().map(|w| w.message.clone()).collect();
        Ok(plan)
    }

    /// Validate, plan and run a workflow
    ///
    /// Structural problems are returned as `EngineError::Validation` before
    /// any node runs. Once a plan exists the run always reaches a terminal
    /// status and the plan is returned as the run record, failed runs
    /// included.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        nodes: &[Node],
        edges: &[Edge],
        options: ExecutionOptions,
        on_update: Option<NodeUpdateCallback>,
    ) -> Result<ExecutionPlan> {
        let plan = self.build_plan(workflow_id, nodes, edges, &options)?;
        self.run_plan(plan, on_update).await
    }

    /// Run an already-built plan to a terminal status
    pub async fn run_plan(&self, mut plan: ExecutionPlan, on_update: Option<NodeUpdateCallback>) -> Result<ExecutionPlan> {
        let run_id = plan.id.clone();
        let workflow_id = plan.workflow_id.clone();
        let mode = plan.mode;
        plan.status = RunStatus::Running;
        plan.started_at = Some(Utc::now());

        tracing::info!(
            "🚀 Starting run {} of '{}' ({} nodes, {} mode)",
            run_id,
            workflow_id,
            plan.contexts.len(),
            mode.as_str()
        );
        let node_count = plan.contexts.len();
        let shared = Arc::new(Mutex::new(plan));
        let cancel = CancellationToken::new();
        self.state.register(&run_id, shared.clone(), cancel.clone()).await;
        self.events.emit(ExecutionEvent::RunStarted {
            run_id: run_id.clone(),
            workflow_id: workflow_id.clone(),
            mode: mode.as_str().to_string(),
            node_count,
            timestamp: Utc::now(),
        });

        let scope = RunScope {
            run_id: run_id.clone(),
            workflow_id: workflow_id.clone(),
            plan: shared.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
            on_update,
        };

        let started = Instant::now();
        let strategy = strategy_for(mode);
        let outcome = match AssertUnwindSafe(strategy.run(&scope)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(EngineError::Aborted(panic_message(panic.as_ref()))),
        };
        drop(scope);

        let mut plan = shared.lock().await.clone();
        let status = match outcome {
            _ if cancel.is_cancelled() => RunStatus::Paused,
            Ok(()) => RunStatus::Completed,
            Err(EngineError::Cancelled) => RunStatus::Paused,
            Err(err) => {
                tracing::error!("❌ Run {} failed: {}", run_id, err);
                plan.errors.insert(err.record_key().to_string(), err.to_string());
                RunStatus::Failed
            }
        };
        plan.status = status;
        plan.finished_at = Some(Utc::now());
        plan.duration_ms = Some(started.elapsed().as_millis() as u64);
        let duration_ms = plan.duration_ms.unwrap_or(0);

        match plan.status {
            RunStatus::Failed => self.events.emit(ExecutionEvent::RunFailed {
                run_id: run_id.clone(),
                workflow_id: workflow_id.clone(),
                error: plan.errors.get("root").cloned().unwrap_or_default(),
                timestamp: Utc::now(),
            }),
            status => self.events.emit(ExecutionEvent::RunCompleted {
                run_id: run_id.clone(),
                workflow_id: workflow_id.clone(),
                status,
                duration_ms,
                timestamp: Utc::now(),
            }),
        }
        tracing::info!(
            "🏁 Run {} of '{}' finished as {} in {}ms",
            run_id,
            workflow_id,
            plan.status.as_str(),
            duration_ms
        );

        self.state.finish(plan.clone()).await;
        Ok(plan)
    }

    /// Cancel an active run; false when it is unknown or already finished
    pub async fn cancel(&self, run_id: &str) -> bool {
        self.state.cancel(run_id).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("strategy panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("strategy panicked: {}", message)
    } else {
        "strategy panicked".to_string()
    }
}

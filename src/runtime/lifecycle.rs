//! Node execution lifecycle
//!
//! Runs one node to a settled state: gather inputs, substitute templates,
//! resolve the processor, invoke it under the node timeout and the run's
//! cancellation token, and retry with exponential backoff until the node
//! succeeds or exhausts `max_retries + 1` attempts.

use crate::error::EngineError;
use crate::runtime::events::{EventBus, ExecutionEvent, NodeUpdate, NodeUpdateCallback};
use crate::runtime::plan::{ExecutionContext, ExecutionPlan, NodeStatus};
use crate::runtime::processor::{ProcessorRegistry, RunView};
use crate::runtime::template::substitute_value;
use anyhow::anyhow;
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Everything a lifecycle needs from the run it belongs to
#[derive(Clone)]
pub struct RunScope {
    pub run_id: String,
    pub workflow_id: String,
    pub plan: Arc<Mutex<ExecutionPlan>>,
    pub registry: Arc<ProcessorRegistry>,
    pub events: EventBus,
    pub cancel: CancellationToken,
    pub on_update: Option<NodeUpdateCallback>,
}

/// Why a node did not complete
#[derive(Debug)]
pub enum NodeFailure {
    /// Every attempt failed
    Exhausted {
        node_id: String,
        node_type: String,
        attempts: u32,
        message: String,
        critical: bool,
    },
    /// The run was cancelled while the node was in flight or backing off
    Cancelled,
    /// Configuration problem no retry can fix
    Fatal(EngineError),
}

impl NodeFailure {
    pub fn is_critical(&self) -> bool {
        match self {
            Self::Exhausted { critical, .. } => *critical,
            Self::Cancelled | Self::Fatal(_) => true,
        }
    }

    pub fn into_error(self) -> EngineError {
        match self {
            Self::Exhausted {
                node_id,
                node_type,
                attempts,
                message,
                ..
            } => EngineError::CriticalNodeFailed {
                node_id,
                node_type,
                attempts,
                message,
            },
            Self::Cancelled => EngineError::Cancelled,
            Self::Fatal(err) => err,
        }
    }
}

impl RunScope {
    pub async fn snapshot(&self) -> ExecutionPlan {
        self.plan.lock().await.clone()
    }

    fn notify(&self, ctx: &ExecutionContext, output: Option<Value>) {
        if let Some(callback) = &self.on_update {
            callback(NodeUpdate {
                run_id: self.run_id.clone(),
                node_id: ctx.node_id.clone(),
                status: ctx.status,
                retry_count: ctx.retry_count,
                error: ctx.error.clone(),
                output,
            });
        }
    }

    fn progress(&self, ctx: &ExecutionContext, message: String) {
        self.events.emit(ExecutionEvent::NodeProgress {
            run_id: self.run_id.clone(),
            node_id: ctx.node_id.clone(),
            node_type: ctx.node_type.clone(),
            message,
            timestamp: Utc::now(),
        });
    }

    /// Mark a node skipped; it never ran and produces no output
    pub async fn skip_node(&self, node_id: &str, reason: &str) -> Result<(), NodeFailure> {
        let mut plan = self.plan.lock().await;
        let ctx = plan
            .context_mut(node_id)
            .ok_or_else(|| NodeFailure::Fatal(EngineError::UnknownNode(node_id.to_string())))?;
        ctx.status = NodeStatus::Skipped;
        tracing::info!("⏭️ Skipping node '{}' ({}): {}", ctx.node_id, ctx.node_type, reason);
        self.progress(ctx, format!("skipped: {}", reason));
        self.notify(ctx, None);
        Ok(())
    }

    /// Run a node through its lifecycle until it settles
    pub async fn execute_node(&self, node_id: &str) -> Result<(), NodeFailure> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(NodeFailure::Cancelled);
            }

            let (snapshot, view, retry_policy) = self.prepare_attempt(node_id).await?;

            let resolution = match self.registry.resolve(&snapshot.node_type) {
                Ok(resolution) => resolution,
                Err(err) => {
                    let mut plan = self.plan.lock().await;
                    if let Some(ctx) = plan.context_mut(node_id) {
                        ctx.status = NodeStatus::Failed;
                        ctx.error = Some(err.to_string());
                        ctx.finished_at = Some(Utc::now());
                        self.notify(ctx, None);
                    }
                    plan.errors.insert(node_id.to_string(), err.to_string());
                    tracing::error!("❌ {}", err);
                    return Err(NodeFailure::Fatal(err));
                }
            };
            if let Some(warning) = resolution.warning(&snapshot.node_type) {
                let mut plan = self.plan.lock().await;
                if let Some(ctx) = plan.context_mut(node_id) {
                    if !ctx.warnings.contains(&warning) {
                        ctx.warnings.push(warning);
                    }
                }
            }

            tracing::info!(
                "📍 Executing node '{}' ({}) attempt {}/{}",
                snapshot.node_id,
                snapshot.node_type,
                snapshot.retry_count + 1,
                snapshot.max_retries + 1
            );
            self.events.emit(ExecutionEvent::NodeStarted {
                run_id: self.run_id.clone(),
                node_id: snapshot.node_id.clone(),
                node_type: snapshot.node_type.clone(),
                attempt: snapshot.retry_count + 1,
                timestamp: Utc::now(),
            });
            self.notify(&snapshot, None);

            let started = Instant::now();
            let call = resolution.processor.process(&snapshot, &view);
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.abandon(node_id).await;
                    return Err(NodeFailure::Cancelled);
                }
                outcome = with_timeout(call, snapshot.timeout_ms) => outcome,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(value) => {
                    self.complete(node_id, value, duration_ms).await?;
                    return Ok(());
                }
                Err(err) => {
                    let message = err.to_string();
                    let Some(retry_count) = self.fail_attempt(node_id, &message, duration_ms).await? else {
                        let plan = self.plan.lock().await;
                        let ctx = plan
                            .context(node_id)
                            .ok_or_else(|| NodeFailure::Fatal(EngineError::UnknownNode(node_id.to_string())))?;
                        return Err(NodeFailure::Exhausted {
                            node_id: ctx.node_id.clone(),
                            node_type: ctx.node_type.clone(),
                            attempts: ctx.retry_count + 1,
                            message,
                            critical: ctx.critical,
                        });
                    };

                    let delay = retry_policy.delay_for(retry_count);
                    tracing::warn!(
                        "🔁 Node '{}' ({}) failed: {}; retry {} in {:?}",
                        snapshot.node_id,
                        snapshot.node_type,
                        message,
                        retry_count,
                        delay
                    );
                    self.progress(&snapshot, format!("retry {} scheduled in {} ms", retry_count, delay.as_millis()));
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(NodeFailure::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn prepare_attempt(
        &self,
        node_id: &str,
    ) -> Result<(ExecutionContext, RunView, crate::runtime::options::RetryPolicy), NodeFailure> {
        let mut plan = self.plan.lock().await;
        let upstream: Vec<String> = plan.incoming(node_id).map(|edge| edge.from.clone()).collect();
        let inputs = upstream
            .into_iter()
            .filter_map(|id| plan.results.get(&id).cloned().map(|value| (id, value)))
            .collect();
        let view = RunView {
            plan_id: plan.id.clone(),
            workflow_id: plan.workflow_id.clone(),
            results: plan.results.clone(),
            label_lookup: plan.label_lookup.clone(),
        };
        let retry_policy = plan.retry_policy.clone();

        let ctx = plan
            .context_mut(node_id)
            .ok_or_else(|| NodeFailure::Fatal(EngineError::UnknownNode(node_id.to_string())))?;
        ctx.status = NodeStatus::Running;
        ctx.started_at = Some(Utc::now());
        ctx.finished_at = None;
        ctx.inputs = inputs;
        ctx.config = substitute_value(&ctx.raw_config, &view.results, &view.label_lookup);
        Ok((ctx.clone(), view, retry_policy))
    }

    async fn complete(&self, node_id: &str, value: Value, duration_ms: u64) -> Result<(), NodeFailure> {
        let mut plan = self.plan.lock().await;
        plan.results.insert(node_id.to_string(), value.clone());
        let ctx = plan
            .context_mut(node_id)
            .ok_or_else(|| NodeFailure::Fatal(EngineError::UnknownNode(node_id.to_string())))?;
        ctx.record_output(&value);
        ctx.status = NodeStatus::Completed;
        ctx.error = None;
        ctx.finished_at = Some(Utc::now());
        ctx.duration_ms = Some(duration_ms);

        tracing::info!("✅ Node '{}' ({}) completed in {}ms", ctx.node_id, ctx.node_type, duration_ms);
        self.events.emit(ExecutionEvent::NodeCompleted {
            run_id: self.run_id.clone(),
            node_id: ctx.node_id.clone(),
            node_type: ctx.node_type.clone(),
            duration_ms,
            output: value.clone(),
            timestamp: Utc::now(),
        });
        self.notify(ctx, Some(value));
        Ok(())
    }

    /// Record a failed attempt; returns the new retry count when another attempt follows
    async fn fail_attempt(&self, node_id: &str, message: &str, duration_ms: u64) -> Result<Option<u32>, NodeFailure> {
        let mut plan = self.plan.lock().await;
        let ctx = plan
            .context_mut(node_id)
            .ok_or_else(|| NodeFailure::Fatal(EngineError::UnknownNode(node_id.to_string())))?;
        ctx.status = NodeStatus::Failed;
        ctx.error = Some(message.to_string());
        ctx.finished_at = Some(Utc::now());
        ctx.duration_ms = Some(duration_ms);

        let will_retry = ctx.retry_count < ctx.max_retries;
        self.events.emit(ExecutionEvent::NodeFailed {
            run_id: self.run_id.clone(),
            node_id: ctx.node_id.clone(),
            node_type: ctx.node_type.clone(),
            error: message.to_string(),
            retry_count: ctx.retry_count,
            will_retry,
            timestamp: Utc::now(),
        });
        self.notify(ctx, None);

        if will_retry {
            ctx.retry_count += 1;
            ctx.status = NodeStatus::Pending;
            return Ok(Some(ctx.retry_count));
        }

        tracing::error!(
            "❌ Node '{}' ({}) failed after {} attempt(s): {}",
            ctx.node_id,
            ctx.node_type,
            ctx.retry_count + 1,
            message
        );
        plan.errors.insert(node_id.to_string(), message.to_string());
        Ok(None)
    }

    /// Put an interrupted node back to pending
    async fn abandon(&self, node_id: &str) {
        let mut plan = self.plan.lock().await;
        if let Some(ctx) = plan.context_mut(node_id) {
            ctx.status = NodeStatus::Pending;
            ctx.finished_at = Some(Utc::now());
            tracing::info!("⏹️ Node '{}' ({}) interrupted by cancellation", ctx.node_id, ctx.node_type);
            self.progress(ctx, "cancelled".to_string());
            self.notify(ctx, None);
        }
    }
}

async fn with_timeout<F>(call: F, timeout_ms: Option<u64>) -> anyhow::Result<Value>
where
    F: Future<Output = anyhow::Result<Value>>,
{
    match timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), call)
            .await
            .map_err(|_| anyhow!("Processor timed out after {} ms", ms))?,
        None => call.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::options::{ExecutionOptions, RetryPolicy};
    use crate::runtime::plan::PlanBuilder;
    use crate::runtime::processor::NodeProcessor;
    use crate::workflow::types::{Edge, Node};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    }

    #[async_trait]
    impl NodeProcessor for Flaky {
        async fn process(&self, ctx: &ExecutionContext, _run: &RunView) -> anyhow::Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(json!({ "call": call, "greeting": ctx.config["greeting"] }))
            } else {
                Err(anyhow!("attempt {} failed", call))
            }
        }
    }

    fn scope(succeed_on: u32, max_retries: u32) -> (RunScope, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = ProcessorRegistry::new().with(
            "flaky",
            Flaky {
                calls: calls.clone(),
                succeed_on,
            },
        );
        let nodes = vec![
            Node::new("src", "dataInput").with_label("Source"),
            Node::new("step", "flaky").with_config(json!({ "greeting": "hi {{Source.name}}" })),
        ];
        let options = ExecutionOptions::default().with_retry_policy(RetryPolicy {
            max_retries,
            retry_delay_ms: 1,
            backoff_multiplier: 2.0,
        });
        let mut plan = PlanBuilder::default()
            .build("wf", &nodes, &[Edge::new("e", "src", "step")], &options)
            .unwrap();
        plan.results.insert("src".to_string(), json!({ "name": "Ada" }));

        let scope = RunScope {
            run_id: plan.id.clone(),
            workflow_id: "wf".to_string(),
            plan: Arc::new(Mutex::new(plan)),
            registry: Arc::new(registry),
            events: EventBus::default(),
            cancel: CancellationToken::new(),
            on_update: None,
        };
        (scope, calls)
    }

    #[tokio::test]
    async fn retries_until_success_and_substitutes_each_attempt() {
        let (scope, calls) = scope(3, 3);
        scope.execute_node("step").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let plan = scope.snapshot().await;
        let ctx = plan.context("step").unwrap();
        assert_eq!(ctx.status, NodeStatus::Completed);
        assert_eq!(ctx.retry_count, 2);
        assert_eq!(ctx.inputs["src"], json!({ "name": "Ada" }));
        assert_eq!(ctx.outputs["greeting"], json!("hi Ada"));
        assert_eq!(plan.results["step"]["call"], json!(3));
        assert!(ctx.error.is_none());
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts() {
        let (scope, calls) = scope(u32::MAX, 2);
        let failure = scope.execute_node("step").await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match failure {
            NodeFailure::Exhausted { attempts, critical, .. } => {
                assert_eq!(attempts, 3);
                assert!(!critical);
            }
            other => panic!("unexpected failure: {:?}", other),
        }
        let plan = scope.snapshot().await;
        assert_eq!(plan.status_of("step"), Some(NodeStatus::Failed));
        assert_eq!(plan.errors["step"], "attempt 3 failed");
    }

    #[tokio::test]
    async fn cancelled_scope_does_not_start_nodes() {
        let (scope, calls) = scope(1, 0);
        scope.cancel.cancel();
        assert!(matches!(scope.execute_node("step").await, Err(NodeFailure::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn skipped_nodes_record_status() {
        let (scope, _) = scope(1, 0);
        scope.skip_node("step", "no live incoming edge").await.unwrap();
        assert_eq!(scope.snapshot().await.status_of("step"), Some(NodeStatus::Skipped));
    }
}

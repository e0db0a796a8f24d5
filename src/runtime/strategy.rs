//! Execution strategies
//!
//! Sequential, parallel and conditional scheduling over one shared plan. All
//! three drive nodes through the same lifecycle and differ only in which node
//! may start when.

use crate::error::{EngineError, Result};
use crate::graph::dependency_waves;
use crate::runtime::condition::evaluate_condition;
use crate::runtime::events::ExecutionEvent;
use crate::runtime::lifecycle::{NodeFailure, RunScope};
use crate::runtime::options::ExecutionMode;
use crate::runtime::plan::{condition_key, ExecutionPlan, NodeStatus, ParallelGroup};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Drive every node of the scope's plan to a settled state
    async fn run(&self, scope: &RunScope) -> Result<()>;
}

pub fn strategy_for(mode: ExecutionMode) -> Box<dyn ExecutionStrategy> {
    match mode {
        ExecutionMode::Sequential => Box::new(SequentialStrategy),
        ExecutionMode::Parallel => Box::new(ParallelStrategy),
        ExecutionMode::Conditional => Box::new(ConditionalStrategy),
    }
}

/// Tolerate non-critical failures, abort on the rest
fn settle(node_id: &str, outcome: std::result::Result<(), NodeFailure>) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(failure) if failure.is_critical() => Err(failure.into_error()),
        Err(failure) => {
            tracing::warn!("⚠️ Continuing past non-critical failure of '{}': {:?}", node_id, failure);
            Ok(())
        }
    }
}

/// One node at a time in topological order
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialStrategy;

#[async_trait]
impl ExecutionStrategy for SequentialStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    async fn run(&self, scope: &RunScope) -> Result<()> {
        let order = scope.plan.lock().await.order.clone();
        for (step, node_id) in order.iter().enumerate() {
            tracing::debug!("📍 Step {}/{}: '{}'", step + 1, order.len(), node_id);
            settle(node_id, scope.execute_node(node_id).await)?;
        }
        Ok(())
    }
}

/// Dependency waves run concurrently under a semaphore
///
/// A node starts once all of its predecessors settled and every earlier wave
/// is done. A wave is done when all members settled, or when any member
/// settled for groups with `wait_for_all = false`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParallelStrategy;

struct WaveState {
    members: Vec<String>,
    settled: usize,
    wait_for_all: bool,
    group_id: Option<String>,
    continue_on_error: bool,
}

impl WaveState {
    fn is_done(&self) -> bool {
        if self.wait_for_all {
            self.settled == self.members.len()
        } else {
            self.settled > 0 || self.members.is_empty()
        }
    }
}

type InFlight = BoxFuture<'static, (String, std::result::Result<(), NodeFailure>)>;

#[async_trait]
impl ExecutionStrategy for ParallelStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Parallel
    }

    async fn run(&self, scope: &RunScope) -> Result<()> {
        let (waves, wave_groups, predecessors, global_limit) = {
            let plan = scope.plan.lock().await;
            let graph = plan.dependency_graph();
            let waves = dependency_waves(&graph)?;
            let wave_groups: Vec<Option<ParallelGroup>> = waves
                .iter()
                .map(|wave| wave.iter().find_map(|id| plan.group_of(id)).cloned())
                .collect();
            let predecessors: HashMap<String, Vec<String>> = graph.reverse_adjacency();
            (waves, wave_groups, predecessors, plan.max_concurrency)
        };

        let global = Arc::new(Semaphore::new(global_limit.max(1)));
        let mut group_limits: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let mut wave_of: HashMap<String, usize> = HashMap::new();
        let mut states: Vec<WaveState> = Vec::with_capacity(waves.len());

        for (index, (wave, group)) in waves.into_iter().zip(wave_groups).enumerate() {
            if let Some(group) = &group {
                if let Some(limit) = group.max_concurrency {
                    group_limits.insert(group.id.clone(), Arc::new(Semaphore::new(limit.max(1))));
                }
            }
            for id in &wave {
                wave_of.insert(id.clone(), index);
            }
            states.push(WaveState {
                members: wave,
                settled: 0,
                wait_for_all: group.as_ref().map(|g| g.wait_for_all).unwrap_or(true),
                group_id: group.as_ref().map(|g| g.id.clone()),
                continue_on_error: group.as_ref().map(|g| g.continue_on_error).unwrap_or(true),
            });
        }

        // Aborting a run stops only this strategy's in-flight nodes
        let local = RunScope {
            cancel: scope.cancel.child_token(),
            ..scope.clone()
        };

        let mut settled: HashSet<String> = HashSet::new();
        let mut started: HashSet<String> = HashSet::new();
        let mut in_flight: FuturesUnordered<InFlight> = FuturesUnordered::new();
        let mut abort: Option<EngineError> = None;

        loop {
            if abort.is_none() {
                for (index, state) in states.iter().enumerate() {
                    if !states[..index].iter().all(WaveState::is_done) {
                        break;
                    }
                    for node_id in &state.members {
                        if started.contains(node_id) {
                            continue;
                        }
                        let ready = predecessors
                            .get(node_id)
                            .map(|preds| preds.iter().all(|p| settled.contains(p)))
                            .unwrap_or(true);
                        if !ready {
                            continue;
                        }
                        started.insert(node_id.clone());

                        let semaphore = state
                            .group_id
                            .as_ref()
                            .and_then(|id| group_limits.get(id))
                            .unwrap_or(&global)
                            .clone();
                        let node_scope = local.clone();
                        let node_id = node_id.clone();
                        in_flight.push(
                            async move {
                                let _permit = match semaphore.acquire_owned().await {
                                    Ok(permit) => permit,
                                    Err(_) => return (node_id, Err(NodeFailure::Cancelled)),
                                };
                                let outcome = node_scope.execute_node(&node_id).await;
                                (node_id, outcome)
                            }
                            .boxed(),
                        );
                    }
                }
            }

            let Some((node_id, outcome)) = in_flight.next().await else {
                break;
            };
            settled.insert(node_id.clone());
            let Some(&index) = wave_of.get(&node_id) else {
                continue;
            };
            let state = &mut states[index];
            let was_done = state.is_done();
            state.settled += 1;
            if !was_done && state.is_done() {
                if let Some(group_id) = &state.group_id {
                    tracing::info!(
                        "🧵 Parallel group '{}' done ({}/{} settled)",
                        group_id,
                        state.settled,
                        state.members.len()
                    );
                }
            }

            let Err(failure) = outcome else { continue };
            if abort.is_some() {
                continue;
            }
            let tolerated = !failure.is_critical() && state.continue_on_error;
            if tolerated {
                tracing::warn!("⚠️ Continuing past non-critical failure of '{}': {:?}", node_id, failure);
                continue;
            }

            let error = match (&state.group_id, failure) {
                (Some(group_id), NodeFailure::Exhausted { message, critical: false, .. }) => {
                    EngineError::GroupFailed {
                        group_id: group_id.clone(),
                        node_id: node_id.clone(),
                        message,
                    }
                }
                (_, failure) => failure.into_error(),
            };
            tracing::error!("🛑 Aborting parallel run: {}", error);
            local.cancel.cancel();
            abort = Some(error);
        }

        match abort {
            // A run-level cancel outranks whatever the aborted nodes reported
            Some(_) if scope.cancel.is_cancelled() => Err(EngineError::Cancelled),
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Topological order with edge conditions deciding which nodes run
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionalStrategy;

impl ConditionalStrategy {
    /// A node with incoming edges runs only if at least one of them is live
    fn has_live_edge(plan: &ExecutionPlan, node_id: &str) -> bool {
        let mut incoming = plan.incoming(node_id).peekable();
        if incoming.peek().is_none() {
            return true;
        }
        incoming.any(|edge| {
            let source = plan.status_of(&edge.from);
            match &edge.condition {
                None => {
                    matches!(source, Some(NodeStatus::Completed | NodeStatus::Failed))
                        && !Self::branch_not_taken(plan, &edge.from, &edge.to)
                }
                Some(_) => {
                    source == Some(NodeStatus::Completed)
                        && plan.condition_results.get(&edge.key()).copied().unwrap_or(false)
                }
            }
        })
    }

    /// Whether a decided branch at `source` routes away from `target`
    ///
    /// A true condition rules out its false path, a false one its true path.
    /// Only plain edges leaving the deciding node are cut; skips then spread
    /// downstream through the live-edge rule.
    fn branch_not_taken(plan: &ExecutionPlan, source: &str, target: &str) -> bool {
        plan.branches.iter().filter(|branch| branch.source == source).any(|branch| {
            match plan.condition_results.get(&condition_key(&branch.source, &branch.target)) {
                Some(true) => branch.false_path.iter().any(|id| id == target),
                Some(false) => branch.true_path.iter().any(|id| id == target),
                None => false,
            }
        })
    }

    /// Evaluate the conditioned out-edges of a completed node
    async fn evaluate_outgoing(scope: &RunScope, node_id: &str) {
        let mut plan = scope.plan.lock().await;
        let edges: Vec<(String, String, String)> = plan
            .outgoing(node_id)
            .filter_map(|edge| edge.condition.clone().map(|c| (edge.key(), edge.to.clone(), c)))
            .collect();

        for (key, target, condition) in edges {
            let result = match evaluate_condition(&condition, &plan.results) {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!("⚠️ Condition on {} -> {} failed: {}", node_id, target, err);
                    plan.errors.insert(key.clone(), err.to_string());
                    false
                }
            };
            tracing::info!("🔀 Condition {} -> {} evaluated to {}", node_id, target, result);
            plan.condition_results.insert(key, result);

            if let Some(ctx) = plan.context(node_id) {
                scope.events.emit(ExecutionEvent::NodeProgress {
                    run_id: scope.run_id.clone(),
                    node_id: ctx.node_id.clone(),
                    node_type: ctx.node_type.clone(),
                    message: format!("condition to '{}' evaluated to {}", target, result),
                    timestamp: Utc::now(),
                });
            }
        }
    }
}

#[async_trait]
impl ExecutionStrategy for ConditionalStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Conditional
    }

    async fn run(&self, scope: &RunScope) -> Result<()> {
        let order = scope.plan.lock().await.order.clone();
        for node_id in &order {
            if scope.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let live = Self::has_live_edge(&*scope.plan.lock().await, node_id);
            if !live {
                scope
                    .skip_node(node_id, "no live incoming edge")
                    .await
                    .map_err(NodeFailure::into_error)?;
                continue;
            }

            let outcome = scope.execute_node(node_id).await;
            let completed = outcome.is_ok();
            settle(node_id, outcome)?;
            if completed {
                Self::evaluate_outgoing(scope, node_id).await;
            }
        }
        Ok(())
    }
}

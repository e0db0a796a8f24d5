//! Execution plans
//!
//! A plan is the run-scoped materialization of a workflow: one context per
//! node, normalized edges, the chosen strategy, parallel groups, branch
//! conditions and the state accumulated while the run progresses. Once a run
//! finishes the plan is the durable record of what happened.

use crate::error::Result;
use crate::graph::{dependency_waves, execution_order, DependencyGraph};
use crate::runtime::options::{ExecutionMode, ExecutionOptions, RetryPolicy};
use crate::workflow::types::{Edge, Node};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Default in-flight limit for parallel runs
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }
}

/// Per-node, per-run execution state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub node_id: String,
    pub node_type: String,
    pub label: String,
    /// Configuration after template substitution for the current attempt
    pub config: Value,
    /// Configuration as authored; substitution re-reads it on every attempt
    pub raw_config: Value,
    /// Upstream outputs keyed by upstream node id
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    pub status: NodeStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: Option<u64>,
    /// Failure of a critical node aborts the run
    pub critical: bool,
    /// Non-fatal diagnostics, e.g. processor fallback
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ExecutionContext {
    /// Store a processor result in the output mapping
    ///
    /// Object results contribute their entries; the whole value is also kept
    /// under `output` unless the object already defines that key.
    pub fn record_output(&mut self, value: &Value) {
        self.outputs.clear();
        if let Value::Object(map) = value {
            for (key, field) in map {
                self.outputs.insert(key.clone(), field.clone());
            }
        }
        self.outputs
            .entry("output".to_string())
            .or_insert_with(|| value.clone());
    }
}

/// Normalized edge as stored in a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEdge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl PlanEdge {
    pub fn key(&self) -> String {
        condition_key(&self.from, &self.to)
    }
}

/// Lookup key for an edge condition: `"{source}_{target}"`
pub fn condition_key(source: &str, target: &str) -> String {
    format!("{}_{}", source, target)
}

/// Nodes with no transitive dependency among them, eligible to run together
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroup {
    pub id: String,
    pub node_ids: Vec<String>,
    /// Settle every member before the group is done
    pub wait_for_all: bool,
    /// Member failures do not abort the run
    pub continue_on_error: bool,
    /// Overrides the run-wide in-flight limit for this group
    pub max_concurrency: Option<usize>,
}

/// Paths selected by a conditioned edge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalBranch {
    pub source: String,
    pub target: String,
    pub condition: String,
    /// The edge target and everything reachable from it
    pub true_path: Vec<String>,
    /// Reachable through the source's other edges, outside the true path
    pub false_path: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub id: String,
    pub workflow_id: String,
    pub contexts: Vec<ExecutionContext>,
    pub edges: Vec<PlanEdge>,
    pub mode: ExecutionMode,
    pub parallel_groups: Vec<ParallelGroup>,
    pub branches: Vec<ConditionalBranch>,
    /// Edge conditions keyed by `source_target`
    pub conditions: BTreeMap<String, String>,
    /// Evaluated edge conditions keyed by `source_target`
    pub condition_results: BTreeMap<String, bool>,
    /// Topological order the sequential and conditional strategies follow
    pub order: Vec<String>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Node id -> processor output
    pub results: BTreeMap<String, Value>,
    /// Node id, `root` or condition key -> message
    pub errors: BTreeMap<String, String>,
    /// Trimmed node label -> node id
    pub label_lookup: HashMap<String, String>,
    pub retry_policy: RetryPolicy,
    pub max_concurrency: usize,
    /// Validation warnings carried into the run record
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ExecutionPlan {
    pub fn context(&self, node_id: &str) -> Option<&ExecutionContext> {
        self.contexts.iter().find(|c| c.node_id == node_id)
    }

    pub fn context_mut(&mut self, node_id: &str) -> Option<&mut ExecutionContext> {
        self.contexts.iter_mut().find(|c| c.node_id == node_id)
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.context(node_id).map(|c| c.status)
    }

    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a PlanEdge> + 'a {
        self.edges.iter().filter(move |e| e.to == node_id)
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a PlanEdge> + 'a {
        self.edges.iter().filter(move |e| e.from == node_id)
    }

    pub fn group_of(&self, node_id: &str) -> Option<&ParallelGroup> {
        self.parallel_groups
            .iter()
            .find(|g| g.node_ids.iter().any(|id| id == node_id))
    }

    /// Rebuild the dependency graph the plan was derived from
    pub fn dependency_graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        for context in &self.contexts {
            graph.add_node(&context.node_id);
        }
        for edge in &self.edges {
            graph.add_dependency(&edge.from, &edge.to);
        }
        graph
    }

    /// Count of contexts in each status
    pub fn status_counts(&self) -> BTreeMap<NodeStatus, usize> {
        let mut counts = BTreeMap::new();
        for context in &self.contexts {
            *counts.entry(context.status).or_insert(0) += 1;
        }
        counts
    }
}

/// Builds execution plans from validated workflow graphs
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    retry_policy: RetryPolicy,
    max_concurrency: usize,
    timeout_ms: Option<u64>,
    critical_types: HashSet<String>,
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new(
            RetryPolicy::default(),
            DEFAULT_MAX_CONCURRENCY,
            None,
            crate::validation::DEFAULT_ENTRY_TYPES
                .iter()
                .chain(crate::validation::DEFAULT_EXIT_TYPES)
                .map(|t| t.to_string()),
        )
    }
}

impl PlanBuilder {
    pub fn new(
        retry_policy: RetryPolicy,
        max_concurrency: usize,
        timeout_ms: Option<u64>,
        critical_types: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            retry_policy,
            max_concurrency,
            timeout_ms,
            critical_types: critical_types.into_iter().collect(),
        }
    }

    /// Build a run-scoped plan
    ///
    /// Callers validate first; this still refuses graphs with cycles because
    /// the scheduler cannot order them.
    pub fn build(
        &self,
        workflow_id: &str,
        nodes: &[Node],
        edges: &[Edge],
        options: &ExecutionOptions,
    ) -> Result<ExecutionPlan> {
        tracing::debug!(
            "🏗️ Building execution plan for '{}' ({} nodes, {} edges)",
            workflow_id,
            nodes.len(),
            edges.len()
        );

        let graph = DependencyGraph::build(nodes, edges);
        let order = execution_order(&graph)?;
        let waves = dependency_waves(&graph)?;

        let retry_policy = options.retry_policy.clone().unwrap_or_else(|| self.retry_policy.clone());
        let timeout_ms = options.timeout_ms.or(self.timeout_ms);
        let critical_types: HashSet<String> = match &options.critical_node_types {
            Some(types) => types.iter().cloned().collect(),
            None => self.critical_types.clone(),
        };

        let contexts: Vec<ExecutionContext> = nodes
            .iter()
            .map(|node| {
                let config = &node.config;
                ExecutionContext {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                    label: node.label.clone(),
                    config: config.clone(),
                    raw_config: config.clone(),
                    inputs: BTreeMap::new(),
                    outputs: BTreeMap::new(),
                    status: NodeStatus::Pending,
                    error: None,
                    started_at: None,
                    finished_at: None,
                    duration_ms: None,
                    retry_count: 0,
                    max_retries: config
                        .get("maxRetries")
                        .and_then(Value::as_u64)
                        .map(|n| n.min(u32::MAX as u64) as u32)
                        .unwrap_or(retry_policy.max_retries),
                    timeout_ms: config
                        .get("timeout")
                        .or_else(|| config.get("timeoutMs"))
                        .and_then(Value::as_u64)
                        .or(timeout_ms),
                    critical: config
                        .get("critical")
                        .and_then(Value::as_bool)
                        .unwrap_or_else(|| critical_types.contains(&node.node_type)),
                    warnings: Vec::new(),
                }
            })
            .collect();

        let mut label_lookup = HashMap::new();
        for node in nodes {
            let label = node.label.trim();
            if label.is_empty() {
                continue;
            }
            if let Some(existing) = label_lookup.get(label) {
                tracing::warn!(
                    "⚠️ Label '{}' is shared by '{}' and '{}'; templates resolve to '{}'",
                    label,
                    existing,
                    node.id,
                    existing
                );
                continue;
            }
            label_lookup.insert(label.to_string(), node.id.clone());
        }

        let plan_edges: Vec<PlanEdge> = edges
            .iter()
            .filter(|e| graph.contains(&e.source) && graph.contains(&e.target) && e.source != e.target)
            .map(|e| PlanEdge {
                from: e.source.clone(),
                to: e.target.clone(),
                condition: e.condition().map(str::to_string),
            })
            .collect();

        let conditions: BTreeMap<String, String> = plan_edges
            .iter()
            .filter_map(|e| e.condition.as_ref().map(|c| (e.key(), c.clone())))
            .collect();

        let mode = match options.mode {
            Some(mode) => mode,
            None if !conditions.is_empty() => ExecutionMode::Conditional,
            None if waves.iter().any(|wave| wave.len() > 1) => ExecutionMode::Parallel,
            None => ExecutionMode::Sequential,
        };

        let parallel_groups = if mode == ExecutionMode::Parallel {
            waves
                .iter()
                .filter(|wave| wave.len() > 1)
                .enumerate()
                .map(|(i, wave)| ParallelGroup {
                    id: format!("group-{}", i + 1),
                    node_ids: wave.clone(),
                    wait_for_all: options.wait_for_all.unwrap_or(true),
                    continue_on_error: options.continue_on_error.unwrap_or(true),
                    max_concurrency: None,
                })
                .collect()
        } else {
            Vec::new()
        };

        let branches = build_branches(&graph, &plan_edges, &order);

        let plan = ExecutionPlan {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            contexts,
            edges: plan_edges,
            mode,
            parallel_groups,
            branches,
            conditions,
            condition_results: BTreeMap::new(),
            order,
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            results: BTreeMap::new(),
            errors: BTreeMap::new(),
            label_lookup,
            retry_policy,
            max_concurrency: options.max_concurrency.unwrap_or(self.max_concurrency).max(1),
            warnings: Vec::new(),
        };

        tracing::info!(
            "📋 Plan {} built: mode={:?}, {} parallel group(s), {} condition(s)",
            plan.id,
            plan.mode,
            plan.parallel_groups.len(),
            plan.conditions.len()
        );
        Ok(plan)
    }
}

fn build_branches(graph: &DependencyGraph, edges: &[PlanEdge], order: &[String]) -> Vec<ConditionalBranch> {
    let in_order = |set: &HashSet<String>| -> Vec<String> {
        order.iter().filter(|id| set.contains(*id)).cloned().collect()
    };

    edges
        .iter()
        .filter_map(|edge| {
            let condition = edge.condition.clone()?;
            let true_set = graph.reachable_from([edge.to.as_str()]);
            let other_targets: Vec<&str> = graph
                .successors(&edge.from)
                .into_iter()
                .filter(|id| *id != edge.to)
                .collect();
            let false_set: HashSet<String> = graph
                .reachable_from(other_targets)
                .into_iter()
                .filter(|id| !true_set.contains(id))
                .collect();
            Some(ConditionalBranch {
                source: edge.from.clone(),
                target: edge.to.clone(),
                condition,
                true_path: in_order(&true_set),
                false_path: in_order(&false_set),
            })
        })
        .collect()
}

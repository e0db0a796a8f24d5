//! Node processor contract and registry
//!
//! Processors are opaque async functions keyed by node type. The registry is
//! built explicitly and owned by an engine instance. Unknown types resolve to
//! a pass-through fallback unless the registry is built without one, in which
//! case validation refuses them.

use crate::error::{EngineError, Result};
use crate::runtime::plan::ExecutionContext;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Read-only view of the run a processor is executing in
#[derive(Debug, Clone)]
pub struct RunView {
    pub plan_id: String,
    pub workflow_id: String,
    /// Outputs of every node completed so far
    pub results: BTreeMap<String, Value>,
    pub label_lookup: HashMap<String, String>,
}

#[async_trait]
pub trait NodeProcessor: Send + Sync {
    /// Run one attempt for a node
    ///
    /// `ctx.config` is already substituted and `ctx.inputs` holds upstream
    /// outputs keyed by node id.
    async fn process(&self, ctx: &ExecutionContext, run: &RunView) -> anyhow::Result<Value>;
}

/// Forwards upstream data unchanged
///
/// A single input is returned as-is, several are returned as an object keyed
/// by node id and a node without inputs returns its config.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughProcessor;

#[async_trait]
impl NodeProcessor for PassThroughProcessor {
    async fn process(&self, ctx: &ExecutionContext, _run: &RunView) -> anyhow::Result<Value> {
        Ok(match ctx.inputs.len() {
            0 => ctx.config.clone(),
            1 => ctx.inputs.values().next().cloned().unwrap_or(Value::Null),
            _ => Value::Object(
                ctx.inputs
                    .iter()
                    .map(|(id, value)| (id.clone(), value.clone()))
                    .collect::<Map<String, Value>>(),
            ),
        })
    }
}

/// Outcome of looking up a processor for a node type
#[derive(Clone)]
pub struct Resolution {
    pub processor: Arc<dyn NodeProcessor>,
    /// The type was unknown and the fallback was chosen
    pub fallback: bool,
    /// Registered types resembling the unknown one
    pub suggestions: Vec<String>,
}

impl Resolution {
    /// Diagnostic recorded on a context that ran on the fallback
    pub fn warning(&self, node_type: &str) -> Option<String> {
        if !self.fallback {
            return None;
        }
        Some(if self.suggestions.is_empty() {
            format!("Unknown node type '{}'; ran pass-through processor", node_type)
        } else {
            format!(
                "Unknown node type '{}'; ran pass-through processor (did you mean: {}?)",
                node_type,
                self.suggestions.join(", ")
            )
        })
    }
}

#[derive(Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn NodeProcessor>>,
    fallback: Option<Arc<dyn NodeProcessor>>,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self {
            processors: HashMap::new(),
            fallback: Some(Arc::new(PassThroughProcessor)),
        }
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("node_types", &self.node_types())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the processor for a node type
    pub fn register(&mut self, node_type: impl Into<String>, processor: Arc<dyn NodeProcessor>) -> &mut Self {
        let node_type = node_type.into();
        tracing::debug!("🧩 Registered processor for '{}'", node_type);
        self.processors.insert(node_type, processor);
        self
    }

    pub fn with(mut self, node_type: impl Into<String>, processor: impl NodeProcessor + 'static) -> Self {
        self.register(node_type, Arc::new(processor));
        self
    }

    /// Unknown types become a fatal configuration error
    pub fn without_fallback(mut self) -> Self {
        self.fallback = None;
        self
    }

    /// Whether unknown node types can still run
    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.processors.contains_key(node_type)
    }

    pub fn node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.processors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn resolve(&self, node_type: &str) -> Result<Resolution> {
        if let Some(processor) = self.processors.get(node_type) {
            return Ok(Resolution {
                processor: processor.clone(),
                fallback: false,
                suggestions: Vec::new(),
            });
        }

        let processor = self.fallback.clone().ok_or_else(|| EngineError::ProcessorUnavailable {
            node_type: node_type.to_string(),
        })?;
        let suggestions = self.suggestions(node_type);
        tracing::warn!(
            "⚠️ No processor for node type '{}', using pass-through (candidates: {:?})",
            node_type,
            suggestions
        );
        Ok(Resolution {
            processor,
            fallback: true,
            suggestions,
        })
    }

    /// Up to three registered types close to `node_type`
    pub fn suggestions(&self, node_type: &str) -> Vec<String> {
        let wanted = node_type.to_lowercase();
        let mut scored: Vec<(usize, String)> = self
            .processors
            .keys()
            .filter_map(|candidate| {
                let lowered = candidate.to_lowercase();
                let distance = edit_distance(&wanted, &lowered);
                let related = !wanted.is_empty() && (lowered.contains(&wanted) || wanted.contains(&lowered));
                (distance <= 3 || related).then(|| (distance, candidate.clone()))
            })
            .collect();
        scored.sort();
        scored.into_iter().take(3).map(|(_, candidate)| candidate).collect()
    }
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut current = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != *cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        previous = current;
    }
    previous[b.len()]
}

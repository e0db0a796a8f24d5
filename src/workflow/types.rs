//! Core workflow type definitions
//!
//! Defines the structures an editor hands to the engine: workflows, nodes and
//! edges. These types are serialized/deserialized from JSON for persistence
//! and for the HTTP API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete workflow definition containing nodes and their connections
///
/// Workflows are stored as JSON in SQLite and validated into dependency graphs
/// before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-summarize")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// List of nodes in this workflow
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// List of edges connecting nodes
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// A single node in the workflow graph
///
/// The node type is an open string tag resolved against the processor
/// registry at run time, so editors can ship new node kinds without touching
/// the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "n1", "fetch-page")
    pub id: String,
    /// Declared node type (e.g., "dataInput", "luaScript", "dataOutput")
    #[serde(rename = "type")]
    pub node_type: String,
    /// Node-specific configuration as flexible JSON
    #[serde(default = "empty_config")]
    pub config: Value,
    /// Human-readable label, used by `{{label.field}}` template lookups
    #[serde(default)]
    pub label: String,
}

/// Directed dependency between two nodes, optionally guarded by a condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Edge identifier, unique within its workflow
    pub id: String,
    /// Source node ID
    pub source: String,
    /// Target node ID
    pub target: String,
    /// Optional boolean expression, e.g. `${classify.score} > 0.5`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

fn empty_config() -> Value {
    Value::Object(Default::default())
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            node_type: node_type.into(),
            config: empty_config(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    /// Attach a branch condition to this edge
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Condition text, ignoring blank strings left behind by editors
    pub fn condition(&self) -> Option<&str> {
        self.condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

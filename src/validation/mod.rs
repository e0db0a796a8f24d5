//! Structural workflow validation
//!
//! Proves a workflow graph is executable before any node runs: non-empty,
//! entry/exit complete, well-formed edges, acyclic, reachable and draining.
//! Validation never fails; it always returns a result with every issue found.

use crate::graph::{cycle, DependencyGraph};
use crate::workflow::types::{Edge, Node};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Node types that start a workflow when no configuration overrides them
pub const DEFAULT_ENTRY_TYPES: &[&str] = &["dataInput", "webhookTrigger", "scheduleTrigger", "manualTrigger"];

/// Node types that terminate a workflow when no configuration overrides them
pub const DEFAULT_EXIT_TYPES: &[&str] = &["dataOutput", "webhookResponse", "notification"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// What kind of structural problem an issue describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueCategory {
    EmptyWorkflow,
    DuplicateNode,
    MissingEntry,
    MissingExit,
    InvalidEdge,
    CircularDependency,
    IsolatedComponent,
    UnreachableNode,
    DanglingNode,
    NoPath,
    UnknownNodeType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub severity: Severity,
    pub category: IssueCategory,
    pub node_ids: Vec<String>,
    pub message: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub node_count: usize,
    pub edge_count: usize,
    pub input_node_count: usize,
    pub output_node_count: usize,
    pub connected_components: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub summary: ValidationSummary,
}

impl ValidationResult {
    /// All error messages joined for logs and error displays
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return "no errors".to_string();
        }
        self.errors
            .iter()
            .map(|issue| issue.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Append a warning without affecting validity
    pub fn push_warning(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    /// Append an error; the workflow is no longer valid
    pub fn push_error(&mut self, issue: ValidationIssue) {
        self.errors.push(issue);
        self.is_valid = false;
    }
}

/// Issue collector used while a validation pass is running
#[derive(Default)]
struct Report {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

impl Report {
    fn error(&mut self, category: IssueCategory, node_ids: Vec<String>, message: String, suggestion: &str) {
        tracing::debug!("🚫 Validation error [{:?}]: {}", category, message);
        self.errors.push(ValidationIssue {
            severity: Severity::Error,
            category,
            node_ids,
            message,
            suggestion: suggestion.to_string(),
        });
    }

    fn warning(&mut self, category: IssueCategory, node_ids: Vec<String>, message: String, suggestion: &str) {
        tracing::debug!("⚠️ Validation warning [{:?}]: {}", category, message);
        self.warnings.push(ValidationIssue {
            severity: Severity::Warning,
            category,
            node_ids,
            message,
            suggestion: suggestion.to_string(),
        });
    }
}

/// Structural validator with configurable entry/exit node types
#[derive(Debug, Clone)]
pub struct WorkflowValidator {
    entry_types: HashSet<String>,
    exit_types: HashSet<String>,
}

impl Default for WorkflowValidator {
    fn default() -> Self {
        Self::new(
            DEFAULT_ENTRY_TYPES.iter().map(|t| t.to_string()),
            DEFAULT_EXIT_TYPES.iter().map(|t| t.to_string()),
        )
    }
}

impl WorkflowValidator {
    pub fn new(entry_types: impl IntoIterator<Item = String>, exit_types: impl IntoIterator<Item = String>) -> Self {
        Self {
            entry_types: entry_types.into_iter().collect(),
            exit_types: exit_types.into_iter().collect(),
        }
    }

    fn is_entry(&self, node_type: &str) -> bool {
        self.entry_types.contains(node_type)
    }

    fn is_exit(&self, node_type: &str) -> bool {
        self.exit_types.contains(node_type)
    }

    /// Validate a workflow graph
    pub fn validate(&self, nodes: &[Node], edges: &[Edge]) -> ValidationResult {
        let mut report = Report::default();
        let mut summary = ValidationSummary {
            node_count: nodes.len(),
            edge_count: edges.len(),
            ..Default::default()
        };

        // (a) something to run
        if nodes.is_empty() {
            report.error(
                IssueCategory::EmptyWorkflow,
                Vec::new(),
                "Workflow has no nodes".to_string(),
                "Add at least an input node and an output node",
            );
            return finish(report, summary);
        }

        let mut seen_nodes = HashSet::new();
        for node in nodes {
            if !seen_nodes.insert(node.id.as_str()) {
                report.error(
                    IssueCategory::DuplicateNode,
                    vec![node.id.clone()],
                    format!("Node id '{}' is used more than once", node.id),
                    "Give every node a unique id",
                );
            }
        }

        // (b) entry and exit coverage
        let entries: Vec<&Node> = nodes.iter().filter(|n| self.is_entry(&n.node_type)).collect();
        let exits: Vec<&Node> = nodes.iter().filter(|n| self.is_exit(&n.node_type)).collect();
        summary.input_node_count = entries.len();
        summary.output_node_count = exits.len();

        if entries.is_empty() {
            report.error(
                IssueCategory::MissingEntry,
                Vec::new(),
                format!("Workflow has no entry node (expected one of: {})", sorted(&self.entry_types)),
                "Add an input or trigger node where the workflow should start",
            );
        }
        if exits.is_empty() {
            report.error(
                IssueCategory::MissingExit,
                Vec::new(),
                format!("Workflow has no exit node (expected one of: {})", sorted(&self.exit_types)),
                "Add an output node where results should be collected",
            );
        }

        // (c) edges: malformed ones are reported and kept out of the graph
        let mut seen_edges = HashSet::new();
        let mut valid_edges: Vec<&Edge> = Vec::with_capacity(edges.len());
        for edge in edges {
            let mut problems = Vec::new();
            if !seen_edges.insert(edge.id.as_str()) {
                problems.push(format!("duplicate edge id '{}'", edge.id));
            }
            if !seen_nodes.contains(edge.source.as_str()) {
                problems.push(format!("unknown source node '{}'", edge.source));
            }
            if !seen_nodes.contains(edge.target.as_str()) {
                problems.push(format!("unknown target node '{}'", edge.target));
            }
            if edge.source == edge.target {
                problems.push(format!("self-loop on '{}'", edge.source));
            }

            if problems.is_empty() {
                valid_edges.push(edge);
            } else {
                report.error(
                    IssueCategory::InvalidEdge,
                    vec![edge.source.clone(), edge.target.clone()],
                    format!("Edge '{}' is invalid: {}", edge.id, problems.join(", ")),
                    "Reconnect or delete the edge in the editor",
                );
            }
        }

        let mut graph = DependencyGraph::default();
        for node in nodes {
            graph.add_node(&node.id);
        }
        for edge in &valid_edges {
            graph.add_dependency(&edge.source, &edge.target);
        }

        // (d) cycles
        for cycle_path in cycle::find_cycles(&graph) {
            let mut members = cycle_path.clone();
            members.pop();
            report.error(
                IssueCategory::CircularDependency,
                members,
                format!("Circular dependency: {}", cycle_path.join(" -> ")),
                "Remove one of the edges in the loop so data flows in one direction",
            );
        }

        // (e) components without both an entry and an exit
        let entry_ids: HashSet<&str> = entries.iter().map(|n| n.id.as_str()).collect();
        let exit_ids: HashSet<&str> = exits.iter().map(|n| n.id.as_str()).collect();
        let components = graph.weak_components();
        summary.connected_components = components.len();
        if components.len() > 1 {
            for component in &components {
                let has_entry = component.iter().any(|id| entry_ids.contains(id.as_str()));
                let has_exit = component.iter().any(|id| exit_ids.contains(id.as_str()));
                if !has_entry && !has_exit {
                    report.warning(
                        IssueCategory::IsolatedComponent,
                        component.clone(),
                        format!("Nodes [{}] are isolated from every input and output", component.join(", ")),
                        "Connect these nodes to the main flow or remove them",
                    );
                }
            }
        }

        // (f) reachability from entries and towards exits
        let reachable = graph.reachable_from(entry_ids.iter().copied());
        let draining = graph.reaching(exit_ids.iter().copied());
        if !entry_ids.is_empty() {
            let unreachable: Vec<String> = graph
                .node_ids()
                .iter()
                .filter(|id| !reachable.contains(*id))
                .cloned()
                .collect();
            for id in unreachable {
                report.error(
                    IssueCategory::UnreachableNode,
                    vec![id.clone()],
                    format!("Node '{}' ({}) is not reachable from any entry node", id, node_type_of(nodes, &id)),
                    "Connect an upstream node to it",
                );
            }
        }
        if !exit_ids.is_empty() {
            let dangling: Vec<String> = graph
                .node_ids()
                .iter()
                .filter(|id| !draining.contains(*id))
                .cloned()
                .collect();
            for id in dangling {
                report.error(
                    IssueCategory::DanglingNode,
                    vec![id.clone()],
                    format!("Node '{}' ({}) does not lead to any exit node", id, node_type_of(nodes, &id)),
                    "Connect it to a downstream node that reaches an output",
                );
            }
        }

        // (g) at least one entry -> exit path
        if !entry_ids.is_empty() && !exit_ids.is_empty() {
            let connected = exit_ids.iter().any(|exit| reachable.contains(*exit));
            if !connected {
                report.error(
                    IssueCategory::NoPath,
                    Vec::new(),
                    "No path leads from an entry node to an exit node".to_string(),
                    "Connect the input nodes through to an output node",
                );
            }
        }

        finish(report, summary)
    }
}

fn finish(report: Report, summary: ValidationSummary) -> ValidationResult {
    let result = ValidationResult {
        is_valid: report.errors.is_empty(),
        errors: report.errors,
        warnings: report.warnings,
        summary,
    };
    tracing::debug!(
        "🔍 Validation finished: valid={} errors={} warnings={}",
        result.is_valid,
        result.errors.len(),
        result.warnings.len()
    );
    result
}

fn node_type_of<'a>(nodes: &'a [Node], id: &str) -> &'a str {
    nodes
        .iter()
        .find(|n| n.id == id)
        .map(|n| n.node_type.as_str())
        .unwrap_or("unknown")
}

fn sorted(types: &HashSet<String>) -> String {
    let mut types: Vec<&str> = types.iter().map(String::as_str).collect();
    types.sort_unstable();
    types.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(nodes: &[Node], edges: &[Edge]) -> ValidationResult {
        WorkflowValidator::default().validate(nodes, edges)
    }

    fn has_category(result: &ValidationResult, category: IssueCategory) -> bool {
        result.errors.iter().chain(&result.warnings).any(|issue| issue.category == category)
    }

    #[test]
    fn empty_workflow_is_rejected() {
        let result = validate(&[], &[]);
        assert!(!result.is_valid);
        assert!(has_category(&result, IssueCategory::EmptyWorkflow));
    }

    #[test]
    fn missing_exit_is_an_error() {
        let result = validate(&[Node::new("in", "dataInput")], &[]);
        assert!(!result.is_valid);
        assert!(has_category(&result, IssueCategory::MissingExit));
        assert!(!has_category(&result, IssueCategory::MissingEntry));
        assert_eq!(result.summary.input_node_count, 1);
    }

    #[test]
    fn minimal_workflow_passes() {
        let result = validate(
            &[Node::new("in", "dataInput"), Node::new("out", "dataOutput")],
            &[Edge::new("e1", "in", "out")],
        );
        assert!(result.is_valid, "{:?}", result.errors);
        assert_eq!(result.summary.connected_components, 1);
        assert_eq!(result.summary.edge_count, 1);
    }

    #[test]
    fn cycle_is_an_error() {
        let nodes = [
            Node::new("in", "dataInput"),
            Node::new("A", "luaScript"),
            Node::new("B", "luaScript"),
            Node::new("C", "luaScript"),
            Node::new("out", "dataOutput"),
        ];
        let edges = [
            Edge::new("e0", "in", "A"),
            Edge::new("e1", "A", "B"),
            Edge::new("e2", "B", "C"),
            Edge::new("e3", "C", "A"),
            Edge::new("e4", "C", "out"),
        ];
        let result = validate(&nodes, &edges);
        assert!(!result.is_valid);
        let cycle = result
            .errors
            .iter()
            .find(|i| i.category == IssueCategory::CircularDependency)
            .unwrap();
        assert_eq!(cycle.message, "Circular dependency: A -> B -> C -> A");
        assert_eq!(cycle.node_ids, vec!["A", "B", "C"]);
    }

    #[test]
    fn malformed_edges_are_reported_individually() {
        let nodes = [Node::new("in", "dataInput"), Node::new("out", "dataOutput")];
        let edges = [
            Edge::new("e1", "in", "out"),
            Edge::new("e1", "in", "out"),
            Edge::new("e2", "in", "ghost"),
            Edge::new("e3", "out", "out"),
        ];
        let result = validate(&nodes, &edges);
        let invalid: Vec<_> = result
            .errors
            .iter()
            .filter(|i| i.category == IssueCategory::InvalidEdge)
            .collect();
        assert_eq!(invalid.len(), 3);
        // The valid edge still connects the graph
        assert!(!has_category(&result, IssueCategory::NoPath));
        assert!(!has_category(&result, IssueCategory::UnreachableNode));
    }

    #[test]
    fn isolated_component_is_a_warning_but_its_nodes_are_unreachable() {
        let nodes = [
            Node::new("in", "dataInput"),
            Node::new("out", "dataOutput"),
            Node::new("x", "luaScript"),
            Node::new("y", "luaScript"),
        ];
        let edges = [Edge::new("e1", "in", "out"), Edge::new("e2", "x", "y")];
        let result = validate(&nodes, &edges);

        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].category, IssueCategory::IsolatedComponent);
        assert_eq!(result.summary.connected_components, 2);
        assert!(has_category(&result, IssueCategory::UnreachableNode));
        assert!(has_category(&result, IssueCategory::DanglingNode));
    }

    #[test]
    fn dangling_node_is_an_error() {
        let nodes = [
            Node::new("in", "dataInput"),
            Node::new("side", "luaScript"),
            Node::new("out", "dataOutput"),
        ];
        let edges = [Edge::new("e1", "in", "out"), Edge::new("e2", "in", "side")];
        let result = validate(&nodes, &edges);
        let dangling: Vec<_> = result
            .errors
            .iter()
            .filter(|i| i.category == IssueCategory::DanglingNode)
            .collect();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].node_ids, vec!["side"]);
        assert!(!dangling[0].suggestion.is_empty());
    }

    #[test]
    fn disconnected_entry_and_exit_have_no_path() {
        let nodes = [Node::new("in", "dataInput"), Node::new("out", "dataOutput")];
        let result = validate(&nodes, &[]);
        assert!(has_category(&result, IssueCategory::NoPath));
    }

    #[test]
    fn custom_entry_and_exit_types() {
        let validator = WorkflowValidator::new(["source".to_string()], ["sink".to_string()]);
        let result = validator.validate(
            &[Node::new("a", "source"), Node::new("b", "sink")],
            &[Edge::new("e", "a", "b")],
        );
        assert!(result.is_valid);
    }
}

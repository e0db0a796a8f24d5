//! Dependency graph shared by the validator and the scheduler
//!
//! Wraps a petgraph `DiGraph` keyed by node id and keeps the insertion order of
//! both nodes and edges so every traversal is deterministic.

use crate::workflow::types::{Edge, Node};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// Adjacency view of a workflow: `source -> target` means target depends on source
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    node_id_to_index: HashMap<String, NodeIndex>,
    /// Node ids in the order they were added
    node_ids: Vec<String>,
}

impl DependencyGraph {
    /// Build a graph from workflow nodes and edges
    ///
    /// Edges pointing at unknown nodes and self-loops are left out; the
    /// validator reports them separately. Repeated source/target pairs collapse
    /// into one dependency.
    pub fn build(nodes: &[Node], edges: &[Edge]) -> Self {
        let mut graph = Self::default();
        for node in nodes {
            graph.add_node(&node.id);
        }
        for edge in edges {
            if edge.source != edge.target {
                graph.add_dependency(&edge.source, &edge.target);
            }
        }
        tracing::debug!(
            "📊 Built dependency graph: {} nodes, {} edges",
            graph.len(),
            graph.graph.edge_count()
        );
        graph
    }

    /// Add a node; adding an id twice is a no-op
    pub fn add_node(&mut self, id: &str) {
        if self.node_id_to_index.contains_key(id) {
            return;
        }
        let index = self.graph.add_node(id.to_string());
        self.node_id_to_index.insert(id.to_string(), index);
        self.node_ids.push(id.to_string());
    }

    /// Record that `target` depends on `source`
    ///
    /// Returns false when either endpoint is unknown.
    pub fn add_dependency(&mut self, source: &str, target: &str) -> bool {
        match (self.node_id_to_index.get(source), self.node_id_to_index.get(target)) {
            (Some(&from), Some(&to)) => {
                self.graph.update_edge(from, to, ());
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node_id_to_index.contains_key(id)
    }

    /// Node ids in insertion order
    pub fn node_ids(&self) -> &[String] {
        &self.node_ids
    }

    /// Direct dependents of `id`, in edge insertion order
    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Direct dependencies of `id`, in edge insertion order
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<&str> {
        let Some(&index) = self.node_id_to_index.get(id) else {
            return Vec::new();
        };
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(index, direction)
            .map(|edge| {
                let other = match direction {
                    Direction::Outgoing => edge.target(),
                    Direction::Incoming => edge.source(),
                };
                (edge.id(), other)
            })
            .collect();
        edges.sort_by_key(|(edge_index, _)| *edge_index);
        edges
            .into_iter()
            .map(|(_, other)| self.graph[other].as_str())
            .collect()
    }

    /// Number of dependencies per node
    pub fn in_degrees(&self) -> HashMap<&str, usize> {
        self.node_ids
            .iter()
            .map(|id| {
                let degree = self
                    .node_id_to_index
                    .get(id)
                    .map(|&index| self.graph.edges_directed(index, Direction::Incoming).count())
                    .unwrap_or(0);
                (id.as_str(), degree)
            })
            .collect()
    }

    /// `node -> dependencies` map
    pub fn reverse_adjacency(&self) -> HashMap<String, Vec<String>> {
        self.node_ids
            .iter()
            .map(|id| {
                let prev = self.predecessors(id).into_iter().map(str::to_string).collect();
                (id.clone(), prev)
            })
            .collect()
    }

    /// Every node reachable from any of `starts`, the starts included
    pub fn reachable_from<'a>(&self, starts: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
        self.walk(starts, Direction::Outgoing)
    }

    /// Every node that can reach any of `targets`, the targets included
    pub fn reaching<'a>(&self, targets: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
        self.walk(targets, Direction::Incoming)
    }

    fn walk<'a>(&self, starts: impl IntoIterator<Item = &'a str>, direction: Direction) -> HashSet<String> {
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();

        for start in starts {
            if let Some(&index) = self.node_id_to_index.get(start) {
                if seen.insert(index) {
                    queue.push_back(index);
                }
            }
        }

        while let Some(current) = queue.pop_front() {
            for next in self.graph.neighbors_directed(current, direction) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        seen.into_iter().map(|index| self.graph[index].clone()).collect()
    }

    /// Weakly connected components, each listed in node insertion order
    pub fn weak_components(&self) -> Vec<Vec<String>> {
        let mut sets = UnionFind::new(self.graph.node_count());
        for edge in self.graph.edge_references() {
            sets.union(edge.source().index(), edge.target().index());
        }

        let mut components: Vec<Vec<String>> = Vec::new();
        let mut root_to_component: HashMap<usize, usize> = HashMap::new();
        for id in &self.node_ids {
            let index = self.node_id_to_index[id];
            let root = sets.find(index.index());
            let slot = *root_to_component.entry(root).or_insert_with(|| {
                components.push(Vec::new());
                components.len() - 1
            });
            components[slot].push(id.clone());
        }
        components
    }
}

//! Topological scheduling
//!
//! Kahn's algorithm for sequential/conditional order and Kahn "waves" for
//! parallel execution. A wave is the set of nodes whose last dependency sits in
//! the previous wave, so no two members of a wave depend on each other.

use crate::error::{EngineError, Result};
use crate::graph::{cycle, dependency::DependencyGraph};
use std::collections::{HashMap, VecDeque};

/// Topological order via Kahn's algorithm
///
/// Fails with `IncompleteOrder` when the queue drains before every node is
/// placed. Ties are broken by node insertion order.
pub fn topological_order(graph: &DependencyGraph) -> Result<Vec<String>> {
    let mut in_degree = graph.in_degrees();
    let mut queue: VecDeque<&str> = graph
        .node_ids()
        .iter()
        .map(String::as_str)
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut order = Vec::with_capacity(graph.len());

    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());
        for next in graph.successors(current) {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if order.len() != graph.len() {
        let missing: Vec<String> = graph
            .node_ids()
            .iter()
            .filter(|id| in_degree[id.as_str()] > 0)
            .cloned()
            .collect();
        tracing::error!("❌ Topological sort incomplete, unordered nodes: {:?}", missing);
        return Err(EngineError::IncompleteOrder { missing });
    }

    Ok(order)
}

/// Cycle check followed by a topological sort
///
/// This is the entry point the planner uses: cycles are reported by name before
/// Kahn's algorithm gets a chance to silently drop nodes.
pub fn execution_order(graph: &DependencyGraph) -> Result<Vec<String>> {
    let cycles = cycle::describe_cycles(graph);
    if !cycles.is_empty() {
        tracing::error!("❌ Workflow contains cycles: {:?}", cycles);
        return Err(EngineError::CircularDependency { cycles });
    }
    let order = topological_order(graph)?;
    tracing::debug!("📋 Execution order: {:?}", order);
    Ok(order)
}

/// Partition nodes into dependency waves
///
/// Wave `n` holds every node whose longest dependency chain has length `n`.
/// Members of one wave never depend on each other, and every dependency of a
/// wave lives in an earlier wave.
pub fn dependency_waves(graph: &DependencyGraph) -> Result<Vec<Vec<String>>> {
    let order = execution_order(graph)?;
    let mut depth: HashMap<&str, usize> = HashMap::with_capacity(order.len());

    for id in &order {
        let level = graph
            .predecessors(id)
            .into_iter()
            .filter_map(|pred| depth.get(pred).map(|d| d + 1))
            .max()
            .unwrap_or(0);
        depth.insert(id.as_str(), level);
    }

    let wave_count = depth.values().copied().max().map(|d| d + 1).unwrap_or(0);
    let mut waves: Vec<Vec<String>> = vec![Vec::new(); wave_count];
    // Keep node insertion order inside each wave
    for id in graph.node_ids() {
        if let Some(&level) = depth.get(id.as_str()) {
            waves[level].push(id.clone());
        }
    }
    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        for node in nodes {
            graph.add_node(node);
        }
        for (from, to) in edges {
            graph.add_dependency(from, to);
        }
        graph
    }

    fn assert_topological(g: &DependencyGraph, order: &[String]) {
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        assert_eq!(order.len(), g.len());
        for id in g.node_ids() {
            for pred in g.predecessors(id) {
                assert!(position[pred] < position[id.as_str()], "{pred} must precede {id}");
            }
        }
    }

    #[test]
    fn kahn_order_respects_every_edge() {
        let g = graph(
            &["d", "c", "b", "a", "e"],
            &[("a", "b"), ("b", "c"), ("a", "c"), ("c", "d"), ("e", "d")],
        );
        let order = topological_order(&g).unwrap();
        assert_topological(&g, &order);
    }

    #[test]
    fn simple_chain_order() {
        let g = graph(&["in", "out"], &[("in", "out")]);
        assert_eq!(execution_order(&g).unwrap(), vec!["in", "out"]);
    }

    #[test]
    fn cycles_fail_loudly() {
        let g = graph(&["A", "B", "C"], &[("A", "B"), ("B", "C"), ("C", "A")]);

        match execution_order(&g) {
            Err(EngineError::CircularDependency { cycles }) => {
                assert_eq!(cycles, vec!["A -> B -> C -> A"]);
            }
            other => panic!("expected circular dependency, got {other:?}"),
        }

        match topological_order(&g) {
            Err(EngineError::IncompleteOrder { missing }) => assert_eq!(missing.len(), 3),
            other => panic!("expected incomplete order, got {other:?}"),
        }
    }

    #[test]
    fn waves_group_independent_nodes() {
        let g = graph(&["A", "B", "C", "D"], &[("A", "C"), ("B", "C"), ("C", "D")]);
        let waves = dependency_waves(&g).unwrap();
        assert_eq!(waves, vec![vec!["A", "B"], vec!["C"], vec!["D"]]);
    }

    #[test]
    fn waves_are_closed_under_dependencies() {
        let g = graph(
            &["a", "b", "c", "d", "e", "f"],
            &[("a", "c"), ("b", "d"), ("c", "e"), ("d", "e"), ("a", "e"), ("e", "f")],
        );
        let waves = dependency_waves(&g).unwrap();
        let wave_of: HashMap<&str, usize> = waves
            .iter()
            .enumerate()
            .flat_map(|(i, wave)| wave.iter().map(move |id| (id.as_str(), i)))
            .collect();

        for (i, wave) in waves.iter().enumerate() {
            for x in wave {
                for y in wave {
                    assert!(x == y || !g.reachable_from([x.as_str()]).contains(y), "{x} and {y} share wave {i}");
                }
                for pred in g.predecessors(x) {
                    assert!(wave_of[pred] < i);
                }
            }
        }
    }

    #[test]
    fn chain_has_no_independent_nodes() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        assert!(dependency_waves(&g).unwrap().iter().all(|wave| wave.len() == 1));
    }
}

//! Three-colour depth-first cycle detection

use crate::graph::dependency::DependencyGraph;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not visited yet
    White,
    /// On the current DFS stack
    Gray,
    /// Fully explored
    Black,
}

/// Find every cycle reachable by a DFS back-edge
///
/// Each cycle is returned as its node path, closed on the starting node:
/// `["A", "B", "C", "A"]`. Roots are visited in node insertion order.
pub fn find_cycles(graph: &DependencyGraph) -> Vec<Vec<String>> {
    let mut colors: HashMap<&str, Color> = graph
        .node_ids()
        .iter()
        .map(|id| (id.as_str(), Color::White))
        .collect();
    let mut stack: Vec<&str> = Vec::new();
    let mut cycles = Vec::new();

    for root in graph.node_ids() {
        if colors[root.as_str()] == Color::White {
            visit(graph, root, &mut colors, &mut stack, &mut cycles);
        }
    }

    cycles
}

/// Cycles formatted for error messages: `"A -> B -> C -> A"`
pub fn describe_cycles(graph: &DependencyGraph) -> Vec<String> {
    find_cycles(graph)
        .into_iter()
        .map(|cycle| cycle.join(" -> "))
        .collect()
}

fn visit<'g>(
    graph: &'g DependencyGraph,
    node: &'g str,
    colors: &mut HashMap<&'g str, Color>,
    stack: &mut Vec<&'g str>,
    cycles: &mut Vec<Vec<String>>,
) {
    colors.insert(node, Color::Gray);
    stack.push(node);

    for next in graph.successors(node) {
        match colors.get(next).copied().unwrap_or(Color::White) {
            Color::White => visit(graph, next, colors, stack, cycles),
            Color::Gray => {
                // Back-edge: the cycle is the stack suffix starting at `next`
                if let Some(start) = stack.iter().position(|id| *id == next) {
                    let mut cycle: Vec<String> = stack[start..].iter().map(|id| id.to_string()).collect();
                    cycle.push(next.to_string());
                    tracing::debug!("🔁 Cycle found: {}", cycle.join(" -> "));
                    cycles.push(cycle);
                }
            }
            Color::Black => {}
        }
    }

    stack.pop();
    colors.insert(node, Color::Black);
}

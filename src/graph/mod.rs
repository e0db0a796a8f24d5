//! Graph algorithms shared by validation and execution
//!
//! - `dependency`: petgraph-backed reverse adjacency, in-degrees and reachability
//! - `cycle`: three-colour DFS cycle detection
//! - `schedule`: Kahn ordering and dependency waves

pub mod cycle;
pub mod dependency;
pub mod schedule;

pub use dependency::DependencyGraph;
pub use schedule::{dependency_waves, execution_order, topological_order};

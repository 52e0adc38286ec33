//! Dependency Graph
//!
//! This module tracks the shape of the reactive graph: which nodes read
//! which, and how fresh each node is. It holds no values.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are sources, state cells, or derived computations
//! - An edge from A to B means B read A the last time it computed
//!
//! Only live nodes carry edges. Disposing a node detaches it from its
//! upstreams, which lets subscriber counts cascade.
//!
//! Both forward (dependencies) and reverse (dependents) edges are kept so
//! invalidation can walk downstream and disposal can walk upstream.

mod node;
mod scheduler;

pub use node::{DirtyState, DisposalPolicy, GraphNode, NodeId, NodeKind};
pub use scheduler::DependencyGraph;

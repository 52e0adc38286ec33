//! Graph Nodes
//!
//! This module defines the untyped bookkeeping for one node in the
//! dependency graph. Values live in the store; the graph only knows shape
//! and freshness.

use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Unique identifier for a node within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Wraps an external asynchronous stream. Roots of the graph.
    Source,

    /// A mutable cell set by commands (session state). Also a root.
    State,

    /// Computed from other nodes. Caches its value.
    Derived,
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The node's value is up-to-date.
    Clean,

    /// Something upstream changed, but not necessarily anything this node
    /// reads directly.
    MaybeDirty,

    /// A direct upstream changed. Needs recomputation.
    Dirty,
}

/// What happens to a node when its last subscriber leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisposalPolicy {
    /// Drop the cached value and close upstream subscriptions.
    #[default]
    AutoDispose,

    /// Stay live with zero subscribers.
    KeepAlive,
}

/// A node in the dependency graph.
///
/// Edges are kept in insertion order so upstreams are visited in the order a
/// computation first read them.
#[derive(Debug)]
pub struct GraphNode {
    id: NodeId,
    kind: NodeKind,
    dirty: DirtyState,

    /// Nodes this node reads from.
    dependencies: IndexSet<NodeId>,

    /// Nodes that read from this node.
    dependents: IndexSet<NodeId>,
}

impl GraphNode {
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            // Derived nodes have never run, so they start dirty.
            dirty: match kind {
                NodeKind::Source | NodeKind::State => DirtyState::Clean,
                NodeKind::Derived => DirtyState::Dirty,
            },
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn dirty_state(&self) -> DirtyState {
        self.dirty
    }

    pub fn is_clean(&self) -> bool {
        self.dirty == DirtyState::Clean
    }

    pub fn mark_clean(&mut self) {
        self.dirty = DirtyState::Clean;
    }

    /// Downgrade a clean node to maybe-dirty. Never overrides `Dirty`.
    pub fn mark_maybe_dirty(&mut self) {
        if self.dirty == DirtyState::Clean {
            self.dirty = DirtyState::MaybeDirty;
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = DirtyState::Dirty;
    }

    pub fn add_dependency(&mut self, node_id: NodeId) {
        self.dependencies.insert(node_id);
    }

    pub fn remove_dependency(&mut self, node_id: NodeId) {
        self.dependencies.shift_remove(&node_id);
    }

    pub fn dependencies(&self) -> &IndexSet<NodeId> {
        &self.dependencies
    }

    pub fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    pub fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.shift_remove(&node_id);
    }

    pub fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_start_clean() {
        assert!(GraphNode::new(NodeId::from(0), NodeKind::Source).is_clean());
        assert!(GraphNode::new(NodeId::from(1), NodeKind::State).is_clean());
    }

    #[test]
    fn derived_node_starts_dirty() {
        let node = GraphNode::new(NodeId::from(2), NodeKind::Derived);
        assert_eq!(node.kind(), NodeKind::Derived);
        assert_eq!(node.dirty_state(), DirtyState::Dirty);
    }

    #[test]
    fn dependencies_keep_read_order() {
        let mut node = GraphNode::new(NodeId::from(10), NodeKind::Derived);
        node.add_dependency(NodeId::from(3));
        node.add_dependency(NodeId::from(1));
        node.add_dependency(NodeId::from(2));
        node.add_dependency(NodeId::from(1));

        let order: Vec<u64> = node.dependencies().iter().map(NodeId::raw).collect();
        assert_eq!(order, vec![3, 1, 2]);

        node.remove_dependency(NodeId::from(1));
        let order: Vec<u64> = node.dependencies().iter().map(NodeId::raw).collect();
        assert_eq!(order, vec![3, 2]);
    }

    #[test]
    fn maybe_dirty_does_not_override_dirty() {
        let mut node = GraphNode::new(NodeId::from(4), NodeKind::Derived);
        node.mark_maybe_dirty();
        assert_eq!(node.dirty_state(), DirtyState::Dirty);

        node.mark_clean();
        node.mark_maybe_dirty();
        assert_eq!(node.dirty_state(), DirtyState::MaybeDirty);
    }

    #[test]
    fn policy_deserializes_from_kebab_case() {
        let policy: DisposalPolicy = serde_json::from_str("\"keep-alive\"").unwrap();
        assert_eq!(policy, DisposalPolicy::KeepAlive);
        assert_eq!(DisposalPolicy::default(), DisposalPolicy::AutoDispose);
    }
}

//! Dependency Graph and Update Ordering
//!
//! The graph determines the order in which dirty nodes are brought up to
//! date. Upstream nodes are always settled before the nodes that read them.
//!
//! # Algorithm
//!
//! 1. When a root changes, its direct dependents become `Dirty`.
//! 2. Everything further downstream becomes `MaybeDirty`.
//! 3. The affected nodes are sorted topologically (Kahn).
//! 4. The store walks that order:
//!    - `Dirty` nodes recompute; if their value changed, their direct
//!      dependents become `Dirty` in turn
//!    - `MaybeDirty` nodes had no upstream actually change and go back to
//!      `Clean` without recomputing
//!
//! The store owns step 4; this module owns the shape of the graph and
//! steps 1-3.

use std::collections::{HashMap, HashSet, VecDeque};

use super::node::{DirtyState, GraphNode, NodeId};
use crate::error::GraphError;

/// All nodes of one store, indexed by ID, with edges in both directions.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<NodeId, GraphNode>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: GraphNode) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node from the graph along with every edge touching it.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<GraphNode> {
        let node = self.nodes.remove(&node_id)?;

        for dep_id in node.dependencies() {
            if let Some(dep) = self.nodes.get_mut(dep_id) {
                dep.remove_dependent(node_id);
            }
        }
        for dependent_id in node.dependents() {
            if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                dependent.remove_dependency(node_id);
            }
        }

        Some(node)
    }

    pub fn get_node(&self, node_id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(&node_id)
    }

    pub fn get_node_mut(&mut self, node_id: NodeId) -> Option<&mut GraphNode> {
        self.nodes.get_mut(&node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn dirty_state(&self, node_id: NodeId) -> Option<DirtyState> {
        self.nodes.get(&node_id).map(GraphNode::dirty_state)
    }

    /// Add a dependency edge: `dependent` reads `dependency`.
    pub fn add_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.add_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.add_dependency(dependency);
        }
    }

    pub fn remove_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.remove_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.remove_dependency(dependency);
        }
    }

    pub fn has_edge(&self, dependency: NodeId, dependent: NodeId) -> bool {
        self.nodes
            .get(&dependent)
            .is_some_and(|node| node.dependencies().contains(&dependency))
    }

    /// Whether `to` is `from` or lies somewhere downstream of it.
    ///
    /// Adding the edge `to -> from` would close a cycle exactly when this
    /// returns true.
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];

        while let Some(node_id) = stack.pop() {
            if node_id == to {
                return true;
            }
            if !visited.insert(node_id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&node_id) {
                stack.extend(node.dependents().iter().copied());
            }
        }

        false
    }

    /// Mark every direct dependent of `node_id` as dirty.
    pub fn mark_dependents_dirty(&mut self, node_id: NodeId) {
        let dependents: Vec<NodeId> = match self.nodes.get(&node_id) {
            Some(node) => node.dependents().iter().copied().collect(),
            None => return,
        };
        for dependent_id in dependents {
            if let Some(dependent) = self.nodes.get_mut(&dependent_id) {
                dependent.mark_dirty();
            }
        }
    }

    /// Mark a root as changed and propagate dirty flags downstream.
    ///
    /// Returns the affected nodes in dependency order.
    pub fn mark_changed(&mut self, root: NodeId) -> Result<Vec<NodeId>, GraphError> {
        let mut to_process = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        self.mark_dependents_dirty(root);
        if let Some(node) = self.nodes.get(&root) {
            queue.extend(node.dependents().iter().copied());
        }

        while let Some(node_id) = queue.pop_front() {
            if node_id == root {
                return Err(GraphError::Cycle {
                    node: root,
                    upstream: root,
                });
            }
            if !visited.insert(node_id) {
                continue;
            }

            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.mark_maybe_dirty();
                to_process.push(node_id);
                queue.extend(node.dependents().iter().copied());
            }
        }

        self.topological_sort(&to_process)
    }

    /// Order `nodes` so that dependencies come before dependents.
    fn topological_sort(&self, nodes: &[NodeId]) -> Result<Vec<NodeId>, GraphError> {
        let node_set: HashSet<_> = nodes.iter().copied().collect();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut result = Vec::with_capacity(nodes.len());
        let mut queue = VecDeque::new();

        // In-degrees only count edges inside the affected set.
        for &node_id in nodes {
            if let Some(node) = self.nodes.get(&node_id) {
                let degree = node
                    .dependencies()
                    .iter()
                    .filter(|d| node_set.contains(d))
                    .count();
                in_degree.insert(node_id, degree);
                if degree == 0 {
                    queue.push_back(node_id);
                }
            }
        }

        while let Some(node_id) = queue.pop_front() {
            result.push(node_id);

            if let Some(node) = self.nodes.get(&node_id) {
                for &dependent_id in node.dependents() {
                    if let Some(degree) = in_degree.get_mut(&dependent_id) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(dependent_id);
                        }
                    }
                }
            }
        }

        if result.len() < in_degree.len() {
            let stuck = in_degree
                .iter()
                .find(|(_, degree)| **degree > 0)
                .map(|(id, _)| *id);
            if let Some(node) = stuck {
                let upstream = self.nodes[&node]
                    .dependencies()
                    .iter()
                    .copied()
                    .find(|d| in_degree.get(d).is_some_and(|deg| *deg > 0))
                    .unwrap_or(node);
                return Err(GraphError::Cycle { node, upstream });
            }
        }

        Ok(result)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

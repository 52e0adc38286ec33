//! Read scope for derived computations.
//!
//! A `Scope` is handed to a derived node's computation. Every `get` records
//! the read as a dependency, so the node recomputes exactly when something it
//! actually read changes. The set of dependencies is rebuilt on every run:
//! whatever the computation did not read this time is released.

use smallvec::SmallVec;

use super::node::Node;
use super::store::Store;
use crate::error::ReadError;
use crate::graph::NodeId;

pub struct Scope<'a> {
    store: &'a Store,
    node: NodeId,
    reads: SmallVec<[NodeId; 4]>,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(store: &'a Store, node: NodeId) -> Self {
        Self {
            store,
            node,
            reads: SmallVec::new(),
        }
    }

    /// The derived node being computed.
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Read an upstream node and depend on it.
    ///
    /// Returns [`ReadError::Pending`] while the upstream has not produced a
    /// value, and the upstream's own error if it failed. Both are meant to be
    /// propagated with `?`.
    ///
    /// # Panics
    ///
    /// Panics if reading `node` would create a dependency cycle.
    pub fn get<T>(&mut self, node: &Node<T>) -> Result<T, ReadError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let upstream = node.id();
        self.store.track(self.node, upstream)?;
        if !self.reads.contains(&upstream) {
            self.reads.push(upstream);
        }
        self.store.read_tracked(upstream)
    }

    pub(crate) fn into_reads(self) -> SmallVec<[NodeId; 4]> {
        self.reads
    }
}

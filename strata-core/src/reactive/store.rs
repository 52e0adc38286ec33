//! Dependency Graph Store
//!
//! The store is the single owner of every node: its cached value, its
//! subscriber count, its upstream subscription and its place in the
//! [`DependencyGraph`].
//!
//! # How It Works
//!
//! 1. Watching a node increments its subscriber count. The first subscriber
//!    makes it live: sources open their stream, derived nodes compute.
//!
//! 2. A derived computation reads upstream nodes through a [`Scope`]. Each
//!    read upstream gains an edge and a subscriber, so live derived nodes
//!    keep their inputs live.
//!
//! 3. When a root changes (stream value, `set`, `invalidate`), the store
//!    marks everything downstream, then settles it in topological order.
//!    Live derived nodes recompute before anyone can observe them, so no
//!    reader ever sees a mix of old and new upstream values.
//!
//! 4. When the last subscriber leaves, an auto-dispose node drops its value,
//!    closes its stream and releases its own upstreams.
//!
//! # Events
//!
//! All mutation runs inside one event at a time, serialized by a reentrant
//! lock, so stream deliveries driven from tokio worker threads never overlap
//! with each other or with commands. The registry lock is only held for
//! bookkeeping and is always released before user computations run.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures_util::future::{AbortHandle, Abortable};
use futures_util::StreamExt;
use parking_lot::{Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard};
use smallvec::SmallVec;
use tokio::sync::watch;
use tracing::{debug, error, trace};

use super::node::{downcast, Node, NodeSpec, Outcome, Producer, Slot, StreamFactory, Value};
use super::scope::Scope;
use super::subscription::Subscription;
use crate::config::GraphConfig;
use crate::error::{GraphError, ReadError, UpstreamError};
use crate::graph::{DependencyGraph, DirtyState, DisposalPolicy, GraphNode, NodeId, NodeKind};

/// Registry of reactive nodes. Cloning shares the same registry.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

struct Shared {
    event: ReentrantMutex<()>,
    inner: Mutex<Inner>,
    config: GraphConfig,
}

struct Inner {
    next_id: u64,
    graph: DependencyGraph,
    entries: HashMap<NodeId, Entry>,

    /// Derived nodes whose computation is currently on the stack.
    computing: Vec<NodeId>,
}

struct Entry {
    producer: Producer,
    label: Option<Arc<str>>,
    slot: Option<Slot>,
    policy: DisposalPolicy,

    /// Removed from the registry on disposal instead of lying dormant.
    transient: bool,

    /// External watchers plus downstream nodes reading this one.
    subscribers: usize,
    active: bool,

    /// The upstream stream has finished; the last value stays cached.
    terminal: bool,

    /// Bumped whenever the upstream stream is replaced or closed.
    epoch: u64,
    upstream: Option<AbortHandle>,

    /// Bumped whenever `slot` or `terminal` changes.
    version: watch::Sender<u64>,
}

impl Entry {
    fn publish(&mut self, slot: Option<Slot>) {
        self.slot = slot;
        self.bump();
    }

    fn bump(&self) {
        self.version.send_modify(|version| *version += 1);
    }

    /// Close the upstream stream. Safe to call any number of times.
    fn close_upstream(&mut self) {
        if let Some(handle) = self.upstream.take() {
            handle.abort();
        }
        self.epoch += 1;
    }

    fn name(&self) -> &str {
        self.label.as_deref().unwrap_or("")
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.close_upstream();
    }
}

impl Inner {
    /// Drop one subscriber; disposes the node if that was the last one and
    /// its policy allows it.
    fn release(&mut self, id: NodeId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        debug_assert!(entry.subscribers > 0, "subscriber count underflow on {id}");
        entry.subscribers = entry.subscribers.saturating_sub(1);

        if entry.subscribers == 0 && entry.policy == DisposalPolicy::AutoDispose && entry.active {
            self.dispose(id);
        }
    }

    fn dispose(&mut self, id: NodeId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.producer.kind() == NodeKind::State {
            return;
        }

        debug!(node = %id, label = entry.name(), "disposing node");
        entry.close_upstream();
        entry.active = false;
        entry.terminal = false;
        if entry.slot.take().is_some() {
            entry.bump();
        }
        let transient = entry.transient;

        let upstreams: Vec<NodeId> = self
            .graph
            .get_node(id)
            .map(|node| node.dependencies().iter().copied().collect())
            .unwrap_or_default();
        for upstream in upstreams {
            self.graph.remove_edge(upstream, id);
            self.release(upstream);
        }

        if transient {
            self.graph.remove_node(id);
            self.entries.remove(&id);
        } else if let Some(node) = self.graph.get_node_mut(id) {
            if node.kind() == NodeKind::Derived {
                node.mark_dirty();
            }
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self::with_config(GraphConfig::default())
    }

    pub fn with_config(config: GraphConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                event: ReentrantMutex::new(()),
                inner: Mutex::new(Inner {
                    next_id: 0,
                    graph: DependencyGraph::new(),
                    entries: HashMap::new(),
                    computing: Vec::new(),
                }),
                config,
            }),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.shared.config
    }

    /// Hold off every other event until the guard is dropped.
    ///
    /// Anything that takes its own lock and then calls back into the store
    /// must take this first, since computations run with it held.
    pub(crate) fn event_guard(&self) -> ReentrantMutexGuard<'_, ()> {
        self.shared.event.lock()
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock()
    }

    fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    fn upgrade(shared: &Weak<Shared>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    /// Report a broken caller contract and stop.
    fn violated(&self, err: GraphError) -> ! {
        error!(%err, "graph invariant violated");
        panic!("{err}");
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a node. It stays dormant until someone watches or reads it.
    pub fn register<T>(&self, spec: NodeSpec<T>) -> Node<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.register_entry(spec, false)
    }

    /// Register a node that is forgotten entirely once disposed.
    pub(crate) fn register_transient<T>(&self, spec: NodeSpec<T>) -> Node<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.register_entry(spec, true)
    }

    fn register_entry<T>(&self, spec: NodeSpec<T>, transient: bool) -> Node<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let _event = self.shared.event.lock();
        let mut inner = self.lock_inner();

        let id = NodeId::from(inner.next_id);
        inner.next_id += 1;

        let kind = spec.producer.kind();
        let active = kind == NodeKind::State;
        let (slot, version) = match spec.initial {
            Some(value) => (Some(Slot::Ready(value)), 1),
            None => (None, 0),
        };

        debug!(node = %id, ?kind, label = spec.label.as_deref().unwrap_or(""), "registering node");

        inner.graph.add_node(GraphNode::new(id, kind));
        inner.entries.insert(
            id,
            Entry {
                producer: spec.producer,
                label: spec.label,
                slot,
                policy: spec.policy.unwrap_or_default(),
                transient,
                subscribers: 0,
                active,
                terminal: false,
                epoch: 0,
                upstream: None,
                version: watch::Sender::new(version),
            },
        );

        Node::new(id)
    }

    /// Register a stream-fed node.
    pub fn source<T, F, S>(&self, factory: F) -> Node<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> S + Send + Sync + 'static,
        S: futures_util::Stream<Item = Outcome<T>> + Send + 'static,
    {
        self.register(NodeSpec::source(factory))
    }

    /// Register a mutable state cell.
    pub fn state<T>(&self, initial: T) -> Node<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.register(NodeSpec::state(initial))
    }

    /// Register a derived node.
    pub fn derived<T, F>(&self, compute: F) -> Node<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&mut Scope<'_>) -> Result<T, ReadError> + Send + Sync + 'static,
    {
        self.register(NodeSpec::derived(compute))
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Subscribe to a node, bringing it to life if it was dormant.
    ///
    /// Dropping the returned subscription unsubscribes.
    ///
    /// # Panics
    ///
    /// Activating a source node spawns its stream on the current tokio
    /// runtime, so that must happen inside one.
    pub fn watch<T>(&self, node: &Node<T>) -> Result<Subscription<T>, GraphError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = node.id();
        let _event = self.shared.event.lock();

        let (needs_activation, version) = {
            let mut inner = self.lock_inner();
            let entry = inner
                .entries
                .get_mut(&id)
                .ok_or(GraphError::UnknownNode(id))?;
            entry.subscribers += 1;
            (!entry.active, entry.version.subscribe())
        };

        if needs_activation {
            self.activate(id);
        }

        Ok(Subscription::new(self.clone(), *node, version))
    }

    pub(crate) fn unwatch(&self, id: NodeId) {
        let _event = self.shared.event.lock();
        self.lock_inner().release(id);
    }

    /// Wait for the node's current value, or its first one.
    ///
    /// This watches the node only for the duration of the call, so an
    /// auto-dispose node nobody else is watching is disposed again afterwards.
    pub async fn read<T>(&self, node: &Node<T>) -> Result<T, GraphError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut subscription = self.watch(node)?;
        match subscription.next().await {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(err.into()),
            None => Err(GraphError::Closed(node.id())),
        }
    }

    /// The cached value without waiting and without subscribing.
    pub fn peek<T>(&self, node: &Node<T>) -> Option<Outcome<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let _event = self.shared.event.lock();
        match self.read_slot::<T>(node.id()) {
            Ok(value) => Some(Ok(value)),
            Err(ReadError::Upstream(err)) => Some(Err(err)),
            Err(ReadError::Pending | ReadError::Missing(_)) => None,
        }
    }

    fn read_slot<T>(&self, id: NodeId) -> Result<T, ReadError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let inner = self.lock_inner();
        let entry = inner.entries.get(&id).ok_or(ReadError::Missing(id))?;
        match &entry.slot {
            None => Err(ReadError::Pending),
            Some(Slot::Failed(err)) => Err(ReadError::Upstream(err.clone())),
            Some(Slot::Ready(value)) => Ok(downcast::<T>(value)),
        }
    }

    pub(crate) fn is_terminal(&self, id: NodeId) -> bool {
        let _event = self.shared.event.lock();
        self.lock_inner()
            .entries
            .get(&id)
            .is_some_and(|entry| entry.terminal)
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Replace the value of a state node and settle everything downstream.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a derived computation.
    pub fn set<T>(&self, node: &Node<T>, value: T) -> Result<(), GraphError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = node.id();
        let _event = self.shared.event.lock();
        {
            let mut inner = self.lock_inner();
            if let Some(current) = inner.computing.last().copied() {
                drop(inner);
                self.violated(GraphError::Reentrant(current));
            }
            let entry = inner
                .entries
                .get_mut(&id)
                .ok_or(GraphError::UnknownNode(id))?;
            if !matches!(entry.producer, Producer::State) {
                return Err(GraphError::NotState(id));
            }
            trace!(node = %id, label = entry.name(), "state set");
            entry.publish(Some(Slot::Ready(Arc::new(value) as Value)));
        }
        self.settle(id);
        Ok(())
    }

    /// Replace the value of a state node with a function of its current one.
    pub fn update<T, F>(&self, node: &Node<T>, f: F) -> Result<(), GraphError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> T,
    {
        let _event = self.shared.event.lock();
        let current = self.read_slot::<T>(node.id()).map_err(|err| match err {
            ReadError::Upstream(err) => GraphError::Upstream(err),
            _ => GraphError::UnknownNode(node.id()),
        })?;
        self.set(node, f(&current))
    }

    /// Force a node to produce afresh.
    ///
    /// - sources close their stream and open a new one; the last value
    ///   stays cached until the new stream produces
    /// - derived nodes recompute
    /// - state nodes re-notify their dependents
    ///
    /// Dormant nodes have nothing cached, so this is a no-op for them.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a derived computation.
    pub fn invalidate(&self, id: NodeId) -> Result<(), GraphError> {
        let _event = self.shared.event.lock();
        let producer = {
            let mut inner = self.lock_inner();
            if let Some(current) = inner.computing.last().copied() {
                drop(inner);
                self.violated(GraphError::Reentrant(current));
            }
            let entry = inner.entries.get(&id).ok_or(GraphError::UnknownNode(id))?;
            if !entry.active {
                return Ok(());
            }
            debug!(node = %id, label = entry.name(), "invalidating node");
            let producer = entry.producer.clone();
            if let Some(node) = inner.graph.get_node_mut(id) {
                if node.kind() == NodeKind::Derived {
                    node.mark_dirty();
                }
            }
            producer
        };

        match producer {
            Producer::Stream(factory) => self.spawn_stream(id, factory),
            Producer::State => self.settle(id),
            Producer::Derived { .. } => {
                if self.refresh(id) {
                    self.settle(id);
                }
            }
        }
        Ok(())
    }

    /// Change a node's disposal policy. Unpinning a node nobody watches
    /// disposes it right away.
    pub fn set_policy(&self, id: NodeId, policy: DisposalPolicy) -> Result<(), GraphError> {
        let _event = self.shared.event.lock();
        let mut inner = self.lock_inner();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(GraphError::UnknownNode(id))?;
        if entry.producer.kind() == NodeKind::State {
            return Ok(());
        }
        entry.policy = policy;
        if policy == DisposalPolicy::AutoDispose && entry.subscribers == 0 && entry.active {
            inner.dispose(id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn contains(&self, id: NodeId) -> bool {
        self.lock_inner().entries.contains_key(&id)
    }

    pub fn is_active(&self, id: NodeId) -> bool {
        self.lock_inner()
            .entries
            .get(&id)
            .is_some_and(|entry| entry.active)
    }

    pub fn subscriber_count(&self, id: NodeId) -> usize {
        self.lock_inner()
            .entries
            .get(&id)
            .map_or(0, |entry| entry.subscribers)
    }

    pub fn policy(&self, id: NodeId) -> Option<DisposalPolicy> {
        self.lock_inner().entries.get(&id).map(|entry| entry.policy)
    }

    /// Upstream nodes in the order they were first read.
    pub fn dependencies(&self, id: NodeId) -> Vec<NodeId> {
        self.lock_inner()
            .graph
            .get_node(id)
            .map(|node| node.dependencies().iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.lock_inner().entries.len()
    }

    // ------------------------------------------------------------------
    // Propagation
    // ------------------------------------------------------------------

    fn activate(&self, id: NodeId) {
        let producer = {
            let mut inner = self.lock_inner();
            let Some(entry) = inner.entries.get_mut(&id) else {
                return;
            };
            if entry.active {
                return;
            }
            entry.active = true;
            debug!(node = %id, label = entry.name(), "activating node");
            entry.producer.clone()
        };

        match producer {
            Producer::State => {}
            Producer::Stream(factory) => self.spawn_stream(id, factory),
            Producer::Derived { .. } => {
                self.refresh(id);
            }
        }
    }

    /// Open the node's upstream stream, closing any previous one first.
    fn spawn_stream(&self, id: NodeId, factory: StreamFactory) {
        let mut stream = factory();
        let (handle, registration) = AbortHandle::new_pair();

        let epoch = {
            let mut inner = self.lock_inner();
            let Some(entry) = inner.entries.get_mut(&id) else {
                return;
            };
            entry.close_upstream();
            entry.upstream = Some(handle);
            entry.terminal = false;
            debug!(node = %id, label = entry.name(), epoch = entry.epoch, "opening upstream stream");
            entry.epoch
        };

        let weak = self.downgrade();
        let pump = async move {
            while let Some(item) = stream.next().await {
                let Some(store) = Store::upgrade(&weak) else {
                    return;
                };
                store.deliver(id, epoch, item);
            }
            if let Some(store) = Store::upgrade(&weak) {
                store.finish(id, epoch);
            }
        };
        tokio::spawn(Abortable::new(pump, registration));
    }

    /// One value (or failure) from an upstream stream.
    fn deliver(&self, id: NodeId, epoch: u64, item: Result<Value, UpstreamError>) {
        let _event = self.shared.event.lock();
        {
            let mut inner = self.lock_inner();
            let Some(entry) = inner.entries.get_mut(&id) else {
                return;
            };
            if !entry.active || entry.epoch != epoch {
                trace!(node = %id, epoch, "discarding value from a closed stream");
                return;
            }
            let slot = match item {
                Ok(value) => Slot::Ready(value),
                Err(err) => {
                    debug!(node = %id, label = entry.name(), %err, "upstream stream failed");
                    Slot::Failed(err)
                }
            };
            trace!(node = %id, label = entry.name(), "stream value");
            entry.publish(Some(slot));
        }
        self.settle(id);
    }

    fn finish(&self, id: NodeId, epoch: u64) {
        let _event = self.shared.event.lock();
        let mut inner = self.lock_inner();
        let Some(entry) = inner.entries.get_mut(&id) else {
            return;
        };
        if !entry.active || entry.epoch != epoch {
            return;
        }
        debug!(node = %id, label = entry.name(), "upstream stream finished");
        entry.upstream = None;
        entry.terminal = true;
        entry.bump();
    }

    /// Bring everything downstream of a changed root up to date.
    fn settle(&self, root: NodeId) {
        let order = {
            let mut inner = self.lock_inner();
            match inner.graph.mark_changed(root) {
                Ok(order) => order,
                Err(err) => {
                    drop(inner);
                    self.violated(err);
                }
            }
        };

        for id in order {
            let state = self.lock_inner().graph.dirty_state(id);
            match state {
                Some(DirtyState::Dirty) => {
                    self.refresh(id);
                }
                Some(DirtyState::MaybeDirty) => {
                    // Nothing this node reads actually changed.
                    if let Some(node) = self.lock_inner().graph.get_node_mut(id) {
                        node.mark_clean();
                    }
                }
                Some(DirtyState::Clean) | None => {}
            }
        }
    }

    /// Recompute a live derived node. Returns whether its value changed.
    ///
    /// The new value replaces the cached one only after the computation
    /// has finished; readers never see a half-computed node.
    fn refresh(&self, id: NodeId) -> bool {
        let (compute, eq) = {
            let mut inner = self.lock_inner();
            let Some(entry) = inner.entries.get(&id) else {
                return false;
            };
            if !entry.active {
                return false;
            }
            let Producer::Derived { compute, eq } = &entry.producer else {
                return false;
            };
            let (compute, eq) = (Arc::clone(compute), *eq);
            if inner.computing.contains(&id) {
                drop(inner);
                self.violated(GraphError::Cycle {
                    node: id,
                    upstream: id,
                });
            }
            inner.computing.push(id);
            (compute, eq)
        };

        let mut scope = Scope::new(self, id);
        let result = compute(&mut scope);
        let reads = scope.into_reads();

        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        inner.computing.pop();

        // Upstreams this run did not read are no longer dependencies.
        let stale: SmallVec<[NodeId; 4]> = inner
            .graph
            .get_node(id)
            .map(|node| {
                node.dependencies()
                    .iter()
                    .copied()
                    .filter(|dep| !reads.contains(dep))
                    .collect()
            })
            .unwrap_or_default();
        for upstream in stale {
            inner.graph.remove_edge(upstream, id);
            inner.release(upstream);
        }

        if let Some(node) = inner.graph.get_node_mut(id) {
            node.mark_clean();
        }

        let Some(entry) = inner.entries.get_mut(&id) else {
            return false;
        };
        let next = match result {
            Ok(value) => Some(Slot::Ready(value)),
            Err(ReadError::Pending) => None,
            Err(ReadError::Upstream(err)) => Some(Slot::Failed(err)),
            Err(ReadError::Missing(missing)) => Some(Slot::Failed(UpstreamError::new(
                format!("node {missing} is not registered"),
            ))),
        };
        let changed = match (&entry.slot, &next) {
            (Some(Slot::Ready(old)), Some(Slot::Ready(new))) => !eq(old, new),
            (Some(Slot::Failed(old)), Some(Slot::Failed(new))) => old != new,
            (None, None) => false,
            _ => true,
        };

        trace!(node = %id, label = entry.name(), changed, "recomputed");
        if changed {
            entry.publish(next);
            inner.graph.mark_dependents_dirty(id);
        }
        changed
    }

    /// Record that `current` reads `upstream`, making sure `upstream` is
    /// live and up to date before its value is handed out.
    ///
    /// # Panics
    ///
    /// Panics if the read would close a dependency cycle.
    pub(crate) fn track(&self, current: NodeId, upstream: NodeId) -> Result<(), ReadError> {
        let (activate, refresh) = {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            if !inner.entries.contains_key(&upstream) {
                return Err(ReadError::Missing(upstream));
            }
            if inner.computing.contains(&upstream) {
                self.violated(GraphError::Cycle {
                    node: current,
                    upstream,
                });
            }

            let mut activate = false;
            if !inner.graph.has_edge(upstream, current) {
                if inner.graph.reaches(current, upstream) {
                    self.violated(GraphError::Cycle {
                        node: current,
                        upstream,
                    });
                }
                inner.graph.add_edge(upstream, current);
                if let Some(entry) = inner.entries.get_mut(&upstream) {
                    entry.subscribers += 1;
                    activate = !entry.active;
                }
            }

            let refresh = !activate
                && inner
                    .graph
                    .dirty_state(upstream)
                    .is_some_and(|state| state != DirtyState::Clean);
            (activate, refresh)
        };

        if activate {
            self.activate(upstream);
        } else if refresh {
            self.refresh(upstream);
        }
        Ok(())
    }

    pub(crate) fn read_tracked<T>(&self, upstream: NodeId) -> Result<T, ReadError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.read_slot::<T>(upstream)
    }
}

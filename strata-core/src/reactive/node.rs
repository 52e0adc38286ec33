//! Node handles and registration specs.
//!
//! A [`Node<T>`] is a typed, copyable handle. The value itself is owned by
//! the [`Store`](super::Store); handles only say where to find it and what
//! type it has.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::stream::{BoxStream, Stream, StreamExt};

use super::scope::Scope;
use crate::error::{ReadError, UpstreamError};
use crate::graph::{DisposalPolicy, NodeId, NodeKind};

/// The result a reader gets from a produced node: a value, or the upstream
/// failure the node is holding.
pub type Outcome<T> = Result<T, UpstreamError>;

pub(crate) type Value = Arc<dyn Any + Send + Sync>;
pub(crate) type StreamFactory =
    Arc<dyn Fn() -> BoxStream<'static, Result<Value, UpstreamError>> + Send + Sync>;
pub(crate) type Compute = Arc<dyn Fn(&mut Scope<'_>) -> Result<Value, ReadError> + Send + Sync>;
pub(crate) type ValueEq = fn(&Value, &Value) -> bool;

/// What a node currently holds once it has produced something.
#[derive(Clone)]
pub(crate) enum Slot {
    Ready(Value),
    Failed(UpstreamError),
}

/// How a node produces values.
#[derive(Clone)]
pub(crate) enum Producer {
    Stream(StreamFactory),
    State,
    Derived { compute: Compute, eq: ValueEq },
}

impl Producer {
    pub(crate) fn kind(&self) -> NodeKind {
        match self {
            Producer::Stream(_) => NodeKind::Source,
            Producer::State => NodeKind::State,
            Producer::Derived { .. } => NodeKind::Derived,
        }
    }
}

fn value_eq<T: PartialEq + 'static>(a: &Value, b: &Value) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

pub(crate) fn downcast<T: Clone + 'static>(value: &Value) -> T {
    value
        .downcast_ref::<T>()
        .cloned()
        .expect("node handle type matches its registration")
}

/// Typed handle to a node registered in a [`Store`](super::Store).
///
/// Two handles are equal exactly when they point at the same node.
pub struct Node<T> {
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Node<T> {
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl<T> Clone for Node<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Node<T> {}

impl<T> PartialEq for Node<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Node<T> {}

impl<T> Hash for Node<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Node").field(&self.id).finish()
    }
}

/// Everything the store needs to register a node.
///
/// # Example
///
/// ```rust,ignore
/// let doubled = store.register(
///     NodeSpec::derived(move |scope| Ok(scope.get(&count)? * 2)).label("doubled"),
/// );
/// ```
pub struct NodeSpec<T> {
    pub(crate) producer: Producer,
    pub(crate) initial: Option<Value>,
    pub(crate) policy: Option<DisposalPolicy>,
    pub(crate) label: Option<Arc<str>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> NodeSpec<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn with_producer(producer: Producer, initial: Option<Value>) -> Self {
        Self {
            producer,
            initial,
            policy: None,
            label: None,
            _marker: PhantomData,
        }
    }

    /// A node fed by an external stream.
    ///
    /// `factory` runs each time the node goes live, so a node that was
    /// disposed and watched again opens a fresh upstream subscription.
    pub fn source<F, S>(factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Outcome<T>> + Send + 'static,
    {
        let factory: StreamFactory = Arc::new(move || {
            factory()
                .map(|item| item.map(|value| Arc::new(value) as Value))
                .boxed()
        });
        Self::with_producer(Producer::Stream(factory), None)
    }

    /// A mutable cell holding `initial` until it is set. Never disposed.
    pub fn state(initial: T) -> Self {
        let mut spec = Self::with_producer(Producer::State, Some(Arc::new(initial)));
        spec.policy = Some(DisposalPolicy::KeepAlive);
        spec
    }

    pub fn policy(mut self, policy: DisposalPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn keep_alive(self) -> Self {
        self.policy(DisposalPolicy::KeepAlive)
    }

    /// Name used in log output.
    pub fn label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl<T> NodeSpec<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// A node computed from other nodes.
    ///
    /// Every node the computation reads through the [`Scope`] becomes an
    /// upstream. If a recomputation produces a value equal to the cached one,
    /// downstream nodes are left alone.
    pub fn derived<F>(compute: F) -> Self
    where
        F: Fn(&mut Scope<'_>) -> Result<T, ReadError> + Send + Sync + 'static,
    {
        let compute: Compute = Arc::new(move |scope: &mut Scope<'_>| {
            compute(scope).map(|value| Arc::new(value) as Value)
        });
        Self::with_producer(
            Producer::Derived {
                compute,
                eq: value_eq::<T>,
            },
            None,
        )
    }
}

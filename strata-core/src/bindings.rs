//! Identity-scoped remote collections.
//!
//! The application's data arrives through two collaborators it does not
//! implement itself: an [`IdentitySource`] reporting who is signed in, and a
//! [`RemoteWatchFactory`] opening a live watch on one remote collection for
//! one identity. This module wires them into the graph:
//!
//! ```text
//!   identity (source, pinned)
//!        │
//!        ▼
//!   collection[key] (derived) ──reads──> remote[(identity, key)] (source)
//! ```
//!
//! The derived node checks the identity before touching the remote family.
//! When the identity goes away every collection reports an empty list in the
//! same pass, and the remote watches it was reading are released.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures_util::stream::BoxStream;

use crate::ids::IdentityToken;
use crate::reactive::{Family, Node, NodeSpec, Outcome, Store};

/// Where the current identity comes from.
///
/// `Ok(None)` means nobody is signed in. That is an ordinary value, not an
/// error.
pub trait IdentitySource: Send + Sync + 'static {
    fn identities(&self) -> BoxStream<'static, Outcome<Option<IdentityToken>>>;
}

impl<F> IdentitySource for F
where
    F: Fn() -> BoxStream<'static, Outcome<Option<IdentityToken>>> + Send + Sync + 'static,
{
    fn identities(&self) -> BoxStream<'static, Outcome<Option<IdentityToken>>> {
        self()
    }
}

/// Opens a live watch on the collection selected by `key`, as seen by
/// `identity`. Each returned stream is an independent subscription and is
/// closed by dropping it.
pub trait RemoteWatchFactory<K, D>: Send + Sync + 'static {
    fn watch(&self, identity: &IdentityToken, key: &K) -> BoxStream<'static, Outcome<Vec<D>>>;
}

impl<K, D, F> RemoteWatchFactory<K, D> for F
where
    F: Fn(&IdentityToken, &K) -> BoxStream<'static, Outcome<Vec<D>>> + Send + Sync + 'static,
{
    fn watch(&self, identity: &IdentityToken, key: &K) -> BoxStream<'static, Outcome<Vec<D>>> {
        self(identity, key)
    }
}

/// Register the identity node. It is pinned, since nearly everything reads it.
pub fn identity_node<S>(store: &Store, source: S) -> Node<Option<IdentityToken>>
where
    S: IdentitySource,
{
    let source = Arc::new(source);
    store.register(
        NodeSpec::source(move || source.identities())
            .keep_alive()
            .label("identity"),
    )
}

/// Keyed remote collections guarded by the current identity.
pub struct Collections<K, D> {
    identity: Node<Option<IdentityToken>>,
    remote: Arc<Family<(IdentityToken, K), Vec<D>>>,
    scoped: Family<K, Vec<D>>,
}

impl<K, D> Collections<K, D>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    D: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new<W>(store: &Store, identity: Node<Option<IdentityToken>>, watches: W) -> Self
    where
        W: RemoteWatchFactory<K, D>,
    {
        let watches = Arc::new(watches);
        let remote = Family::new(store, move |(token, key): &(IdentityToken, K)| {
            let watches = watches.clone();
            let (token, key) = (token.clone(), key.clone());
            NodeSpec::source(move || watches.watch(&token, &key)).label("remote")
        });
        let remote = Arc::new(remote);

        let scoped_remote = remote.clone();
        let scoped = Family::new(store, move |key: &K| {
            let remote = scoped_remote.clone();
            let key = key.clone();
            NodeSpec::derived(move |scope| {
                let Some(token) = scope.get(&identity)? else {
                    return Ok(Vec::new());
                };
                let node = remote.get(&(token, key.clone()));
                scope.get(&node)
            })
            .label("collection")
        });

        Self {
            identity,
            remote,
            scoped,
        }
    }

    pub fn identity(&self) -> Node<Option<IdentityToken>> {
        self.identity
    }

    /// The identity-guarded collection for `key`.
    pub fn get(&self, key: &K) -> Node<Vec<D>> {
        self.scoped.get(key)
    }

    /// Pin `key` so its collection and the remote watch behind it stay open
    /// while nothing is watching.
    pub fn keep_alive(&self, key: &K) -> Node<Vec<D>> {
        self.scoped.keep_alive(key)
    }

    pub fn release(&self, key: &K) {
        self.scoped.release(key);
    }

    /// The unguarded per-identity family, for callers that already hold a
    /// token.
    pub fn remote(&self) -> &Family<(IdentityToken, K), Vec<D>> {
        &self.remote
    }
}

//! Keyed Cache
//!
//! A [`Family`] maps a key to exactly one node, built on first request by a
//! factory bound to that key. Requesting the same key again hands back the
//! same node, so every consumer of a key shares one upstream subscription.
//!
//! Family nodes follow the store's disposal rules. An auto-dispose entry that
//! loses its last subscriber is removed from the store, and the next request
//! for its key builds a fresh node. Pinning a key with
//! [`keep_alive`](Family::keep_alive) keeps its node, cached value and
//! upstream subscription across gaps with no subscribers.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::node::{Node, NodeSpec};
use super::store::Store;
use crate::graph::DisposalPolicy;

type Build<K, T> = Arc<dyn Fn(&K) -> NodeSpec<T> + Send + Sync>;

pub struct Family<K, T> {
    store: Store,
    build: Build<K, T>,
    entries: DashMap<K, Node<T>>,
    policy: DisposalPolicy,
}

impl<K, T> Family<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Create a family whose nodes use the store's configured default policy.
    ///
    /// `build` must not call back into this family.
    pub fn new<F>(store: &Store, build: F) -> Self
    where
        F: Fn(&K) -> NodeSpec<T> + Send + Sync + 'static,
    {
        Self {
            store: store.clone(),
            build: Arc::new(build),
            entries: DashMap::new(),
            policy: store.config().family_policy,
        }
    }

    /// Override the policy for nodes this family builds from now on.
    pub fn with_policy(mut self, policy: DisposalPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The node for `key`, building and registering it if needed.
    ///
    /// Building a node also forgets every entry whose node has since been
    /// disposed.
    pub fn get(&self, key: &K) -> Node<T> {
        // Lock order is event, then shard: computations call in here with
        // the event lock already held.
        let _event = self.store.event_guard();
        let (node, built) = match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) if self.store.contains(entry.get().id()) => {
                (*entry.get(), false)
            }
            Entry::Occupied(mut entry) => {
                let node = self.build_node(key);
                entry.insert(node);
                (node, true)
            }
            Entry::Vacant(entry) => {
                let node = self.build_node(key);
                entry.insert(node);
                (node, true)
            }
        };
        if built {
            self.prune();
        }
        node
    }

    fn prune(&self) {
        self.entries.retain(|_, node| self.store.contains(node.id()));
    }

    fn build_node(&self, key: &K) -> Node<T> {
        let mut spec = (self.build)(key);
        if spec.policy.is_none() {
            spec.policy = Some(self.policy);
        }
        let label = match spec.label.take() {
            Some(label) => format!("{label}[{key:?}]"),
            None => format!("{key:?}"),
        };
        let node = self.store.register_transient(spec.label(label));
        debug!(node = %node.id(), ?key, "built keyed node");
        node
    }

    /// Pin the node for `key` so it survives having no subscribers.
    pub fn keep_alive(&self, key: &K) -> Node<T> {
        let node = self.get(key);
        // The node was just fetched from this store, so it is registered.
        let _ = self.store.set_policy(node.id(), DisposalPolicy::KeepAlive);
        node
    }

    /// Unpin `key`. Its node is disposed at once if nobody is watching it.
    pub fn release(&self, key: &K) {
        let node = self.entries.get(key).map(|entry| *entry.value());
        if let Some(node) = node {
            let _ = self
                .store
                .set_policy(node.id(), DisposalPolicy::AutoDispose);
        }
    }

    /// The node for `key` if one is currently registered, without building.
    pub fn peek_node(&self, key: &K) -> Option<Node<T>> {
        self.entries
            .get(key)
            .map(|entry| *entry.value())
            .filter(|node| self.store.contains(node.id()))
    }

    /// Number of keys with a live node. Forgets disposed entries.
    pub fn len(&self) -> usize {
        let _event = self.store.event_guard();
        self.prune();
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn squares(store: &Store, built: Arc<AtomicI32>) -> Family<u32, u32> {
        Family::new(store, move |key: &u32| {
            built.fetch_add(1, Ordering::SeqCst);
            let key = *key;
            NodeSpec::derived(move |_scope| Ok(key * key)).label("square")
        })
    }

    #[test]
    fn same_key_returns_same_node() {
        let store = Store::new();
        let built = Arc::new(AtomicI32::new(0));
        let family = squares(&store, built.clone());

        let a = family.get(&3);
        let b = family.get(&3);
        let c = family.get(&4);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(family.len(), 2);
    }

    #[test]
    fn disposed_entry_is_rebuilt_on_next_request() {
        let store = Store::new();
        let built = Arc::new(AtomicI32::new(0));
        let family = squares(&store, built.clone());

        let first = family.get(&3);
        let sub = store.watch(&first).unwrap();
        assert_eq!(store.peek(&first), Some(Ok(9)));
        drop(sub);

        assert!(!store.contains(first.id()));
        assert_eq!(family.peek_node(&3), None);
        assert!(family.is_empty());

        let second = family.get(&3);
        assert_ne!(first, second);
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pinned_entry_survives_zero_subscribers() {
        let store = Store::new();
        let built = Arc::new(AtomicI32::new(0));
        let family = squares(&store, built.clone());

        let node = family.keep_alive(&5);
        drop(store.watch(&node).unwrap());

        assert!(store.is_active(node.id()));
        assert_eq!(store.peek(&node), Some(Ok(25)));
        assert_eq!(family.get(&5), node);

        family.release(&5);
        assert!(!store.contains(node.id()));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn family_policy_comes_from_store_config() {
        let store = Store::with_config(crate::config::GraphConfig {
            family_policy: DisposalPolicy::KeepAlive,
        });
        let family = squares(&store, Arc::new(AtomicI32::new(0)));

        let node = family.get(&2);
        assert_eq!(store.policy(node.id()), Some(DisposalPolicy::KeepAlive));
    }

    #[test]
    fn disposed_entries_are_forgotten_on_next_build() {
        let store = Store::new();
        let family = squares(&store, Arc::new(AtomicI32::new(0)));

        let nodes = [family.get(&1), family.get(&2)];
        for node in &nodes {
            drop(store.watch(node).unwrap());
        }
        assert_eq!(family.entries.len(), 2);

        family.get(&3);
        assert_eq!(family.entries.len(), 1);
        assert!(family.peek_node(&3).is_some());
    }

    #[test]
    fn concurrent_get_and_propagation_do_not_deadlock() {
        let store = Store::new();
        let family = Arc::new(Family::new(&store, |key: &u32| {
            thread::sleep(Duration::from_millis(300));
            let key = *key;
            NodeSpec::derived(move |_scope| Ok(key))
        }));

        let trigger = store.state(0_u32);
        let lookups = family.clone();
        let reader = store.derived(move |scope| {
            let n = scope.get(&trigger)?;
            if n == 0 {
                return Ok(0);
            }
            scope.get(&lookups.get(&1))
        });
        let _sub = store.watch(&reader).unwrap();

        let (done_tx, done_rx) = mpsc::channel();

        let building = family.clone();
        let tx = done_tx.clone();
        let builder = thread::spawn(move || {
            building.get(&1);
            tx.send("get").unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        let setting = store.clone();
        let setter = thread::spawn(move || {
            setting.set(&trigger, 1).unwrap();
            done_tx.send("set").unwrap();
        });

        let mut finished = Vec::new();
        for _ in 0..2 {
            match done_rx.recv_timeout(Duration::from_secs(5)) {
                Ok(name) => finished.push(name),
                Err(_) => break,
            }
        }
        assert_eq!(finished.len(), 2, "only {finished:?} finished");

        builder.join().unwrap();
        setter.join().unwrap();
        assert_eq!(store.peek(&reader), Some(Ok(1)));
    }
}

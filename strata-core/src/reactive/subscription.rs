//! Subscriptions
//!
//! A [`Subscription`] keeps its node live and yields the node's value each
//! time it changes. Deliveries are coalesced: a slow consumer skips straight
//! to the latest value instead of queueing every intermediate one.

use futures_util::stream::{self, Stream};
use tokio::sync::watch;

use super::node::{Node, Outcome};
use super::store::Store;

pub struct Subscription<T> {
    store: Store,
    node: Node<T>,
    version: watch::Receiver<u64>,

    /// Last version handed to the consumer; 0 means nothing yet.
    seen: u64,
}

impl<T> Subscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(store: Store, node: Node<T>, version: watch::Receiver<u64>) -> Self {
        Self {
            store,
            node,
            version,
            seen: 0,
        }
    }

    pub fn node(&self) -> Node<T> {
        self.node
    }

    /// The value cached right now, if the node has produced one.
    pub fn current(&self) -> Option<Outcome<T>> {
        self.store.peek(&self.node)
    }

    /// Wait for a value this subscription has not yielded yet.
    ///
    /// The first call yields the cached value straight away if there is one.
    /// Returns `None` once the node's upstream stream has finished and its
    /// last value was already yielded.
    pub async fn next(&mut self) -> Option<Outcome<T>> {
        loop {
            let version = *self.version.borrow_and_update();
            if version != self.seen {
                self.seen = version;
                if let Some(outcome) = self.store.peek(&self.node) {
                    return Some(outcome);
                }
            }
            if self.store.is_terminal(self.node.id()) {
                return None;
            }
            if self.version.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Turn the subscription into a stream of values.
    pub fn into_stream(self) -> impl Stream<Item = Outcome<T>> + Send {
        stream::unfold(self, |mut subscription| async move {
            let item = subscription.next().await?;
            Some((item, subscription))
        })
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.store.unwatch(self.node.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn first_next_yields_cached_value() {
        let store = Store::new();
        let count = store.state(5);
        let mut sub = store.watch(&count).unwrap();

        assert_eq!(sub.next().await, Some(Ok(5)));
        assert_eq!(sub.current(), Some(Ok(5)));
    }

    #[tokio::test]
    async fn stream_yields_latest_values() {
        let store = Store::new();
        let count = store.state(0);
        let doubled = store.derived(move |scope| Ok(scope.get(&count)? * 2));
        let mut values = Box::pin(store.watch(&doubled).unwrap().into_stream());

        assert_eq!(values.next().await, Some(Ok(0)));
        store.set(&count, 4).unwrap();
        assert_eq!(values.next().await, Some(Ok(8)));
    }

    #[tokio::test]
    async fn coalesces_changes_made_between_polls() {
        let store = Store::new();
        let count = store.state(0);
        let mut sub = store.watch(&count).unwrap();
        assert_eq!(sub.next().await, Some(Ok(0)));

        store.set(&count, 1).unwrap();
        store.set(&count, 2).unwrap();
        store.set(&count, 3).unwrap();

        assert_eq!(sub.next().await, Some(Ok(3)));
    }

    #[test]
    fn dropping_unsubscribes() {
        let store = Store::new();
        let count = store.state(0);

        let sub = store.watch(&count).unwrap();
        assert_eq!(store.subscriber_count(count.id()), 1);
        assert_eq!(sub.node(), count);

        drop(sub);
        assert_eq!(store.subscriber_count(count.id()), 0);
    }
}

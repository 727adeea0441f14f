//! Process-local typed topics (SPEC_FULL §3 SUPPLEMENT), used by the
//! dispatcher to publish lifecycle phases so external observers (metrics,
//! UIs, logs) can subscribe without the dispatcher knowing about them.
//!
//! A thin wrapper over `tokio::sync::broadcast`, matching the crate's
//! general preference for `tokio`'s own primitives over a hand-rolled
//! pub/sub bus.

use tokio::sync::broadcast;

/// A named broadcast channel of `T`. Cloning a `Topic` shares the
/// underlying channel; `subscribe` is cheap and can be called any number
/// of times.
#[derive(Clone)]
pub struct Topic<T: Clone + Send + 'static> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Topic<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Publish a value. No subscribers is not an error - pub/sub is
    /// fire-and-forget.
    pub fn publish(&self, value: T) {
        let _ = self.tx.send(value);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for Topic<T> {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_values() {
        let topic: Topic<i32> = Topic::new(8);
        let mut rx1 = topic.subscribe();
        let mut rx2 = topic.subscribe();
        topic.publish(42);
        assert_eq!(rx1.recv().await.unwrap(), 42);
        assert_eq!(rx2.recv().await.unwrap(), 42);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let topic: Topic<&'static str> = Topic::default();
        topic.publish("hello");
    }
}

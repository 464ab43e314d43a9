//! Channel subscription tracking and message dispatch.
//!
//! The registry is the source of truth for which logical channels the
//! application wants to observe. The transport does not persist
//! subscriptions across reconnects; after every successful handshake the
//! session replays [`SubscriptionRegistry::channels`] against the wire.
//!
//! Delivery is by message passing: each subscription binds a channel to an
//! `mpsc::Sender<MetricEvent>`, so decoded events flow into queues instead
//! of running handler closures in the transport's callback context.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::DecodeError;
use crate::events::MetricEvent;

/// Opaque handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Debug)]
struct Subscription {
    handle: SubscriptionHandle,
    sender: mpsc::Sender<MetricEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    by_channel: HashMap<String, Subscription>,
    next_handle: u64,
}

/// Tracks the set of observed channels and routes inbound messages.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a channel to an event queue.
    ///
    /// Channels have set semantics: subscribing to a channel that is
    /// already tracked is a no-op that returns the existing handle, so a
    /// message can never be dispatched twice.
    pub fn subscribe(&self, channel: &str, sender: mpsc::Sender<MetricEvent>) -> SubscriptionHandle {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_channel.get(channel) {
            warn!(channel, "duplicate subscribe, returning existing handle");
            return existing.handle;
        }
        inner.next_handle += 1;
        let handle = SubscriptionHandle(inner.next_handle);
        inner
            .by_channel
            .insert(channel.to_string(), Subscription { handle, sender });
        debug!(channel, ?handle, "subscribed");
        handle
    }

    /// Remove a subscription, returning the channel it was bound to.
    ///
    /// Unsubscribing a handle that is already gone is a safe no-op.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Option<String> {
        let mut inner = self.inner.write();
        let channel = inner
            .by_channel
            .iter()
            .find(|(_, sub)| sub.handle == handle)
            .map(|(channel, _)| channel.clone());
        match channel {
            Some(channel) => {
                inner.by_channel.remove(&channel);
                debug!(channel, ?handle, "unsubscribed");
                Some(channel)
            }
            None => {
                debug!(?handle, "unsubscribe for unknown handle ignored");
                None
            }
        }
    }

    /// The tracked channel set, sorted, for replay after reconnect.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.inner.read().by_channel.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.inner.read().by_channel.contains_key(channel)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_channel.is_empty()
    }

    /// Drop every subscription and its sender. Called on teardown so no
    /// event queue outlives the session.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        let count = inner.by_channel.len();
        inner.by_channel.clear();
        if count > 0 {
            debug!(count, "cleared all subscriptions");
        }
    }

    /// Decode an inbound message body and deliver it to the channel's
    /// queue. A decode failure drops that single message; a message for an
    /// untracked channel is dropped quietly.
    pub async fn dispatch(&self, channel: &str, body: Value) {
        let sender = {
            let inner = self.inner.read();
            match inner.by_channel.get(channel) {
                Some(sub) => sub.sender.clone(),
                None => {
                    debug!(channel, "message for untracked channel dropped");
                    return;
                }
            }
        };

        match serde_json::from_value::<MetricEvent>(body) {
            Ok(event) => {
                if sender.send(event).await.is_err() {
                    warn!(channel, "event queue closed, dropping message");
                }
            }
            Err(source) => {
                let err = DecodeError {
                    channel: channel.to_string(),
                    source,
                };
                warn!(error = %err, "dropping undecodable message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> (mpsc::Sender<MetricEvent>, mpsc::Receiver<MetricEvent>) {
        mpsc::channel(8)
    }

    #[test]
    fn duplicate_subscribe_returns_existing_handle() {
        let registry = SubscriptionRegistry::new();
        let (tx1, _rx1) = queue();
        let (tx2, _rx2) = queue();

        let first = registry.subscribe("topics.metrics", tx1);
        let second = registry.subscribe("topics.metrics", tx2);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_subscribe_keeps_original_binding() {
        let registry = SubscriptionRegistry::new();
        let (tx1, mut rx1) = queue();
        let (tx2, mut rx2) = queue();
        registry.subscribe("topics.metrics", tx1);
        registry.subscribe("topics.metrics", tx2);

        registry
            .dispatch(
                "topics.metrics",
                json!({"type": "TOPIC_METRICS", "payload": {"topicId": 1}}),
            )
            .await;

        // Exactly one delivery, to the original sender.
        assert!(rx1.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_unknown_handle_is_noop() {
        let registry = SubscriptionRegistry::new();
        let (tx, _rx) = queue();
        let handle = registry.subscribe("topics.update", tx);

        assert_eq!(registry.unsubscribe(handle), Some("topics.update".to_string()));
        // Second unsubscribe of the same handle: safe no-op.
        assert_eq!(registry.unsubscribe(handle), None);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn undecodable_payload_drops_only_that_message() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = queue();
        registry.subscribe("topics.update", tx);

        registry
            .dispatch("topics.update", json!({"type": "BOGUS", "payload": 5}))
            .await;
        registry
            .dispatch(
                "topics.update",
                json!({"type": "TOPIC_UPDATE", "payload": {"topicName": "orders"}}),
            )
            .await;

        // The bad message vanished, the good one arrived.
        let event = rx.try_recv().unwrap();
        assert_eq!(event.topic_name(), Some("orders"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn untracked_channel_message_is_dropped() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = queue();
        registry.subscribe("topics.update", tx);

        registry
            .dispatch(
                "topics.metrics",
                json!({"type": "TOPIC_METRICS", "payload": {}}),
            )
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn channels_are_sorted_for_replay() {
        let registry = SubscriptionRegistry::new();
        let (tx, _rx) = queue();
        registry.subscribe("b.feed", tx.clone());
        registry.subscribe("a.feed", tx.clone());
        registry.subscribe("c.feed", tx);
        assert_eq!(registry.channels(), ["a.feed", "b.feed", "c.feed"]);
    }
}

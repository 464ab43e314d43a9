//! The reconciliation engine: sole writer of the canonical graph.
//!
//! Events reach the reconciler through a single-consumer queue, so every
//! merge is applied strictly in delivery order no matter how many
//! transport callbacks produced them. After each merge the affected node's
//! status is re-derived, its dependent edges are restyled, and a fresh
//! immutable snapshot is published with node and edges as one atomic unit.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::events::{MessageArrival, MetricEvent, TopicMetrics, TopicUpdate};

use super::status::{derive_status, edge_style};
use super::{GraphSnapshot, GraphStore, LiveMode};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Folds metric events into the graph and publishes snapshots.
pub struct Reconciler {
    store: GraphStore,
    live: LiveMode,
    snapshots: watch::Sender<Arc<GraphSnapshot>>,
}

impl Reconciler {
    /// Attach to a constructed graph. Returns the reconciler and the
    /// snapshot receiver handed to the rendering layer.
    ///
    /// Statuses are derived once for every node on attach, so a monitored
    /// but quiet topic starts out CONNECTED rather than at the default.
    pub fn new(mut store: GraphStore, live: LiveMode) -> (Self, watch::Receiver<Arc<GraphSnapshot>>) {
        for node_id in store.node_ids() {
            restyle(&mut store, &live, &node_id);
        }
        let (snapshots, receiver) = watch::channel(Arc::new(store.snapshot()));
        (
            Self {
                store,
                live,
                snapshots,
            },
            receiver,
        )
    }

    /// Consume the event queue until every sender is dropped.
    pub async fn run(mut self, mut events: mpsc::Receiver<MetricEvent>) {
        while let Some(event) = events.recv().await {
            self.apply(event);
        }
        debug!("event queue closed, reconciler stopping");
    }

    /// Apply a single event. Public for direct (non-queued) use in tests
    /// and embedders that drive their own loop.
    pub fn apply(&mut self, event: MetricEvent) {
        match event {
            MetricEvent::TopicUpdate(update) => self.apply_topic_update(update),
            MetricEvent::TopicMetrics(metrics) => self.apply_topic_metrics(metrics),
            MetricEvent::MessageArrival(arrival) => self.apply_message_arrival(arrival),
        }
    }

    /// Current state, for synchronous inspection.
    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn apply_topic_update(&mut self, update: TopicUpdate) {
        let Some(node_id) =
            self.resolve("TOPIC_UPDATE", update.topic_id.as_ref(), update.topic_name.as_deref())
        else {
            return;
        };
        if let Some(backend_id) = update.topic_id {
            self.store.bind_backend_id(&node_id, backend_id);
        }
        if let Some(node) = self.store.node_mut(&node_id) {
            if let Some(count) = update.message_count {
                node.signals.message_count = count;
            }
            if let Some(monitored) = update.monitored {
                node.signals.monitored = monitored;
            }
        }
        self.finish(&node_id);
    }

    pub fn apply_topic_metrics(&mut self, metrics: TopicMetrics) {
        let Some(node_id) =
            self.resolve("TOPIC_METRICS", metrics.topic_id.as_ref(), metrics.topic_name.as_deref())
        else {
            return;
        };
        if let Some(backend_id) = metrics.topic_id {
            self.store.bind_backend_id(&node_id, backend_id);
        }
        if let Some(node) = self.store.node_mut(&node_id) {
            if let Some(throughput) = metrics.throughput_per_second {
                node.signals.throughput = throughput;
            }
            if let Some(count) = metrics.message_count {
                node.signals.message_count = count;
            }
            if let Some(active) = metrics.consumer_active {
                node.signals.consumer_active = Some(active);
            }
            if let Some(monitored) = metrics.monitored {
                node.signals.monitored = monitored;
            }
        }
        self.finish(&node_id);
    }

    /// A message arrival is the one non-field-local merge: the count is
    /// incremented optimistically pending the next authoritative metrics
    /// sample, and the receipt time is stamped.
    pub fn apply_message_arrival(&mut self, arrival: MessageArrival) {
        let Some(node_id) =
            self.resolve("NEW_MESSAGE", arrival.topic_id.as_ref(), arrival.topic_name.as_deref())
        else {
            return;
        };
        if let Some(node) = self.store.node_mut(&node_id) {
            node.signals.message_count = node.signals.message_count.saturating_add(1);
            node.last_message_at = Some(now_ms());
        }
        self.finish(&node_id);
    }

    /// Match an event to a node by either domain key. A miss is not an
    /// error: graph construction and the event stream are only eventually
    /// consistent, so unknown references are dropped quietly.
    fn resolve(
        &self,
        kind: &'static str,
        id: Option<&crate::events::DomainId>,
        name: Option<&str>,
    ) -> Option<String> {
        match self.store.resolve(id, name) {
            Some(node_id) => Some(node_id.to_string()),
            None => {
                debug!(
                    event = kind,
                    topic_id = id.map(|i| i.0.as_str()),
                    topic_name = name,
                    "event does not match any node, ignoring"
                );
                None
            }
        }
    }

    /// Re-derive the node's status, restyle its dependent edges, and
    /// publish the combined result as one snapshot.
    fn finish(&mut self, node_id: &str) {
        restyle(&mut self.store, &self.live, node_id);
        // send only fails when every reader is gone, which is fine.
        let _ = self.snapshots.send(Arc::new(self.store.snapshot()));
    }
}

/// Derive a node's status and propagate it to the edges targeting it.
fn restyle(store: &mut GraphStore, live: &LiveMode, node_id: &str) {
    let signals = match store.node_mut(node_id) {
        Some(node) => {
            let next = derive_status(&node.signals);
            if next != node.status {
                info!(
                    node = %node.id,
                    from = node.status.label(),
                    to = next.label(),
                    "status changed"
                );
                node.status = next;
            }
            node.signals
        }
        None => return,
    };

    let style = edge_style(&signals, live.is_on());
    for edge_id in store.edges_targeting(node_id).to_vec() {
        if let Some(edge) = store.edge_mut(&edge_id) {
            edge.status = style.status;
            edge.animated = style.animated;
            edge.color = style.color.to_string();
        }
    }
}

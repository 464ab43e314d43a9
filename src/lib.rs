//! # topowatch
//!
//! Real-time graph synchronization core for message-broker monitoring
//! dashboards.
//!
//! The crate keeps an in-memory topology graph (nodes = applications,
//! topics, consumer groups; edges = their relationships) synchronized with
//! a backend event stream over a single long-lived, multiplexed pub/sub
//! session. Incoming metric events are partial and arrive out of order
//! across channels; the reconciler folds them into the graph field by
//! field, derives each entity's liveness status, and publishes immutable
//! snapshots to the rendering layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  ┌────────────┐   ┌──────────────┐   ┌────────────┐           │
//! │  │ connection │──▶│ subscription │──▶│ reconciler │──▶ watch  │
//! │  │ (session)  │   │ (dispatch)   │   │ (merge)    │  snapshots│
//! │  └─────┬──────┘   └──────────────┘   └─────┬──────┘           │
//! │        │                                   │                  │
//! │        ▼                                   ▼                  │
//! │   Connector/Transport                status derivation        │
//! │   (TCP line frames)                  (single rule set)        │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **[`connection`]**: the session state machine: handshake,
//!   heartbeats, fixed-delay reconnection with subscription replay
//! - **[`subscription`]**: channel registry with set semantics and
//!   message-passing dispatch into typed event queues
//! - **[`graph`]**: the canonical graph, the reconciliation engine, and
//!   the ordered-rule status derivation
//! - **[`protocol`]** / **[`events`]**: wire frames and the metric-event
//!   payloads they carry
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use topowatch::{
//!     ConnectionManager, GraphStore, LiveMode, Reconciler, SubscriptionRegistry,
//!     SyncConfig, TcpConnector,
//! };
//!
//! # tokio_test::block_on(async {
//! let store = GraphStore::from_json(r#"{"nodes": [], "edges": []}"#).unwrap();
//! let (reconciler, snapshots) = Reconciler::new(store, LiveMode::new(true));
//! let (events, queue) = tokio::sync::mpsc::channel(256);
//! tokio::spawn(reconciler.run(queue));
//!
//! let config = SyncConfig::default();
//! let channels = config.channels.clone();
//! let manager = ConnectionManager::new(
//!     Arc::new(TcpConnector::new("localhost:9090")),
//!     Arc::new(SubscriptionRegistry::new()),
//!     config,
//! );
//! for channel in channels.all() {
//!     manager.subscribe(channel, events.clone()).await;
//! }
//! manager.connect().await.unwrap();
//! # });
//! ```
//!
//! The graph itself comes from an external collaborator (typically the
//! REST backend's topology snapshot); this core never creates or deletes
//! nodes and edges, it only mutates their fields.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod graph;
pub mod protocol;
pub mod subscription;

pub use config::{FeedChannels, SyncConfig};
pub use connection::transport::{Connector, LineTransport, TcpConnector, Transport};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{ConnectionError, DecodeError, TransportError};
pub use events::{DomainId, MessageArrival, MetricEvent, TopicMetrics, TopicUpdate};
pub use graph::reconcile::Reconciler;
pub use graph::status::{derive_status, edge_style, EdgeStyle, Signals, Status};
pub use graph::{Edge, GraphDocument, GraphSnapshot, GraphStore, LiveMode, Node, NodeKind};
pub use protocol::{ClientFrame, ServerFrame};
pub use subscription::{SubscriptionHandle, SubscriptionRegistry};

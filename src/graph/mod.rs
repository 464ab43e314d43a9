//! The in-memory topology graph.
//!
//! Nodes and edges are created by the graph-construction collaborator
//! (loaded here from its JSON document format) before the sync core
//! attaches. The core never adds or removes entities; it only mutates
//! fields on the ones it is given, and exposes the result to readers as
//! immutable [`GraphSnapshot`] values.

pub mod reconcile;
pub mod status;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::events::DomainId;
use status::{Signals, Status};

/// What a node represents in the broker topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Application,
    Topic,
    ConsumerGroup,
}

/// A topology node: an application, topic, or consumer group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Stable graph id, assigned by the graph constructor.
    pub id: String,
    pub kind: NodeKind,
    /// Domain name; streaming events may match on this key.
    pub name: String,
    /// Backend-assigned id, if the backend ever supplied one. Some topics
    /// never get one and stay reachable by name only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<DomainId>,
    #[serde(default)]
    pub signals: Signals,
    #[serde(default)]
    pub status: Status,
    /// Receipt time of the last message-arrival event, unix millis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<u64>,
}

impl Node {
    /// Create a node with default signals and status.
    pub fn new(id: impl Into<String>, kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            backend_id: None,
            signals: Signals::default(),
            status: Status::default(),
            last_message_at: None,
        }
    }

    /// Attach a backend id.
    pub fn with_backend_id(mut self, id: impl Into<String>) -> Self {
        self.backend_id = Some(DomainId(id.into()));
        self
    }

    /// Mark the node as monitored.
    pub fn monitored(mut self) -> Self {
        self.signals.monitored = true;
        self
    }
}

fn default_edge_color() -> String {
    Status::Inactive.color().to_string()
}

/// A relationship between two nodes. Only the derived presentation fields
/// (`status`, `animated`, `color`) are ever mutated by this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub animated: bool,
    #[serde(default = "default_edge_color")]
    pub color: String,
}

impl Edge {
    /// Create an edge in the default (inactive) presentation state.
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            status: Status::default(),
            animated: false,
            color: default_edge_color(),
        }
    }
}

/// The JSON document format the graph-construction collaborator hands over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// The canonical mutable graph, owned by the reconciler.
///
/// Besides the primary id maps it keeps secondary indexes so an event can
/// be matched by either of its domain keys in O(1), and so a node's
/// dependent edges are found without scanning.
#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
    by_backend_id: HashMap<DomainId, String>,
    by_name: HashMap<String, String>,
    edges_by_target: HashMap<String, Vec<String>>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a collaborator document.
    pub fn from_document(doc: GraphDocument) -> Self {
        let mut store = Self::new();
        for node in doc.nodes {
            store.insert_node(node);
        }
        for edge in doc.edges {
            store.insert_edge(edge);
        }
        store
    }

    /// Parse a collaborator JSON document.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::from_document(serde_json::from_str(raw)?))
    }

    /// Insert a node, maintaining the domain-key indexes. Part of graph
    /// construction, not of event processing.
    pub fn insert_node(&mut self, node: Node) {
        if let Some(backend_id) = &node.backend_id {
            self.by_backend_id.insert(backend_id.clone(), node.id.clone());
        }
        self.by_name.insert(node.name.clone(), node.id.clone());
        self.nodes.insert(node.id.clone(), node);
    }

    /// Insert an edge, maintaining the target index.
    pub fn insert_edge(&mut self, edge: Edge) {
        self.edges_by_target
            .entry(edge.target.clone())
            .or_default()
            .push(edge.id.clone());
        self.edges.insert(edge.id.clone(), edge);
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub(crate) fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub(crate) fn edge_mut(&mut self, id: &str) -> Option<&mut Edge> {
        self.edges.get_mut(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Ids of all nodes, for whole-graph passes.
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Resolve a node by either domain key. The backend id is checked
    /// first; if the event supplies only a name, the name index decides.
    pub fn resolve(&self, id: Option<&DomainId>, name: Option<&str>) -> Option<&str> {
        if let Some(id) = id {
            if let Some(node_id) = self.by_backend_id.get(id) {
                return Some(node_id);
            }
        }
        if let Some(name) = name {
            if let Some(node_id) = self.by_name.get(name) {
                return Some(node_id);
            }
        }
        None
    }

    /// Back-fill a node's backend id once an event reveals it. Name
    /// lookups keep working afterwards.
    pub(crate) fn bind_backend_id(&mut self, node_id: &str, backend_id: DomainId) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            if node.backend_id.is_none() {
                node.backend_id = Some(backend_id.clone());
                self.by_backend_id.insert(backend_id, node_id.to_string());
            }
        }
    }

    /// Ids of edges whose target is the given node.
    pub fn edges_targeting(&self, node_id: &str) -> &[String] {
        self.edges_by_target
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Clone the current state into an immutable snapshot.
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }
}

/// An immutable, self-consistent view of the graph.
///
/// Snapshots are published after each applied event, with the updated node
/// and its dependent edges changed as one unit. Readers never observe a
/// node restyled but its edges stale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: HashMap<String, Node>,
    pub edges: HashMap<String, Edge>,
}

impl GraphSnapshot {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id)
    }

    /// Convert back to the collaborator document format, sorted by id for
    /// stable output.
    pub fn to_document(&self) -> GraphDocument {
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut edges: Vec<Edge> = self.edges.values().cloned().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        GraphDocument { nodes, edges }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_document())
    }
}

/// The externally toggled live-update flag consulted by edge animation.
///
/// Not owned by this core: the embedding application flips it, the
/// reconciler only reads it.
#[derive(Debug, Clone, Default)]
pub struct LiveMode(Arc<AtomicBool>);

impl LiveMode {
    pub fn new(on: bool) -> Self {
        Self(Arc::new(AtomicBool::new(on)))
    }

    pub fn set(&self, on: bool) {
        self.0.store(on, Ordering::Relaxed);
    }

    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

//! Metric events delivered over the feed channels.
//!
//! Events are partial by design: the backend sends whichever fields it has,
//! and the reconciler merges them field-by-field into the graph. Every
//! payload field is therefore optional, including the identifying keys.
//! An event may carry a backend topic id, a topic name, or both.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// A backend-assigned identifier.
///
/// The backend is inconsistent about whether ids arrive as JSON strings or
/// numbers, so this newtype accepts both and normalizes to a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DomainId(pub String);

impl<'de> Deserialize<'de> for DomainId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => DomainId(s),
            Raw::Number(n) => DomainId(n.to_string()),
        })
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DomainId {
    fn from(s: &str) -> Self {
        DomainId(s.to_string())
    }
}

/// Topic create/update notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicUpdate {
    pub topic_id: Option<DomainId>,
    pub topic_name: Option<String>,
    pub message_count: Option<u64>,
    pub monitored: Option<bool>,
}

/// Periodic topic metrics sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicMetrics {
    pub topic_id: Option<DomainId>,
    pub topic_name: Option<String>,
    pub throughput_per_second: Option<f64>,
    pub message_count: Option<u64>,
    pub consumer_active: Option<bool>,
    pub monitored: Option<bool>,
}

/// A single message arrived on a topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageArrival {
    pub topic_id: Option<DomainId>,
    pub topic_name: Option<String>,
}

/// The tagged union of feed payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MetricEvent {
    #[serde(rename = "TOPIC_UPDATE")]
    TopicUpdate(TopicUpdate),
    #[serde(rename = "TOPIC_METRICS")]
    TopicMetrics(TopicMetrics),
    #[serde(rename = "NEW_MESSAGE")]
    MessageArrival(MessageArrival),
}

impl MetricEvent {
    /// The wire discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            MetricEvent::TopicUpdate(_) => "TOPIC_UPDATE",
            MetricEvent::TopicMetrics(_) => "TOPIC_METRICS",
            MetricEvent::MessageArrival(_) => "NEW_MESSAGE",
        }
    }

    /// The backend id key, if the event carries one.
    pub fn topic_id(&self) -> Option<&DomainId> {
        match self {
            MetricEvent::TopicUpdate(e) => e.topic_id.as_ref(),
            MetricEvent::TopicMetrics(e) => e.topic_id.as_ref(),
            MetricEvent::MessageArrival(e) => e.topic_id.as_ref(),
        }
    }

    /// The name key, if the event carries one.
    pub fn topic_name(&self) -> Option<&str> {
        match self {
            MetricEvent::TopicUpdate(e) => e.topic_name.as_deref(),
            MetricEvent::TopicMetrics(e) => e.topic_name.as_deref(),
            MetricEvent::MessageArrival(e) => e.topic_name.as_deref(),
        }
    }
}

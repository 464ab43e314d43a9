//! Wire frames for the event-stream session.
//!
//! The protocol is deliberately small: text frames, one JSON object per
//! line, with a broker-style handshake. The client opens with `CONNECT`
//! and the server answers `CONNECTED`; after that the client manages
//! channel subscriptions and heartbeats while the server delivers
//! `MESSAGE` frames tagged with their channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    /// Opens the session. Must be the first frame on a new transport.
    Connect,
    /// Start receiving messages for a channel.
    Subscribe { channel: String },
    /// Stop receiving messages for a channel.
    Unsubscribe { channel: String },
    /// Heartbeat; the server answers with `PONG`.
    Ping,
    /// Clean session teardown.
    Disconnect,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    /// Handshake accepted.
    Connected,
    /// A message on a subscribed channel. The body is the metric-event
    /// envelope decoded by the subscription registry.
    Message { channel: String, body: Value },
    /// Heartbeat acknowledgement.
    Pong,
    /// Non-fatal server-side error report.
    Error { message: String },
}

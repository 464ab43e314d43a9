//! Error types for the synchronization core.

use thiserror::Error;

/// Errors raised by the transport layer.
///
/// All of these are recoverable: the session loop reacts by tearing the
/// transport down and entering the reconnect path. Nothing here is allowed
/// to terminate the hosting process.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not reach the endpoint.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The endpoint was reached but rejected the handshake.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// The peer sent something that is not a valid frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// Timed out waiting for a reply.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// `connect()` was called while a session is already running.
    #[error("a session is already running")]
    AlreadyConnected,
}

/// A single inbound message payload could not be decoded.
///
/// Decode failures are per-message: the message is dropped and the session
/// continues. This type exists so the failure is logged with its channel.
#[derive(Debug, Error)]
#[error("failed to decode payload on channel '{channel}': {source}")]
pub struct DecodeError {
    pub channel: String,
    #[source]
    pub source: serde_json::Error,
}

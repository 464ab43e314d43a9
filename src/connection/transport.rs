//! Transport seam for the event-stream session.
//!
//! The session logic only sees the [`Connector`]/[`Transport`] trait pair,
//! so the same loop runs over a TCP socket in production and an in-memory
//! duplex stream in tests.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::warn;

use crate::error::TransportError;
use crate::protocol::{ClientFrame, ServerFrame};

/// Establishes fresh transports. Called once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}

/// One live, framed connection.
#[async_trait]
pub trait Transport: Send {
    /// Send a single frame.
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), TransportError>;

    /// Receive the next frame. `Ok(None)` means the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError>;
}

/// Connects to a `host:port` endpoint speaking newline-delimited JSON.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", self.addr, e)))?;
        Ok(Box::new(LineTransport::new(stream)))
    }
}

/// Frames any async byte stream as one JSON object per line.
///
/// A line that fails to parse is logged and skipped. A garbled frame is
/// per-message damage, not a reason to tear the session down.
pub struct LineTransport<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    line: String,
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (read, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer,
            line: String::new(),
        }
    }
}

#[async_trait]
impl<S> Transport for LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(frame)
            .map_err(|e| TransportError::Protocol(format!("unencodable frame: {e}")))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<ServerFrame>(trimmed) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => {
                    warn!(error = %e, "skipping unparseable frame");
                }
            }
        }
    }
}

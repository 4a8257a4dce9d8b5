//! Transport capability injected into the connection.
//!
//! The connection never talks to a socket or pipe directly; it holds a
//! [`Transport`] that yields its byte streams once ready. Stdio is the only
//! concrete backend in this version, and it is ready immediately.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{ChildStdin, ChildStdout};

use crate::error::ClientError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The byte streams of a connected transport.
pub struct TransportStreams {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

/// A bidirectional byte channel to the server.
#[async_trait]
pub trait Transport: Send {
    /// Block until the transport is usable, yielding its streams.
    ///
    /// Stdio transports complete immediately. Future backends (e.g. TCP)
    /// would block here until their handshake finishes or `timeout` passes.
    async fn try_connect(&mut self, timeout: Duration) -> Result<TransportStreams, ClientError>;

    /// Whether the transport has handed out its streams and is live.
    fn connected(&self) -> bool;
}

/// Transport over a spawned server's stdin/stdout.
pub struct StdioTransport {
    streams: Option<TransportStreams>,
    connected: bool,
}

impl StdioTransport {
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self::from_streams(stdout, stdin)
    }

    /// Build a transport over arbitrary streams. Used by tests to run a
    /// connection against in-memory pipes.
    pub fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            streams: Some(TransportStreams {
                reader: Box::new(reader),
                writer: Box::new(writer),
            }),
            connected: false,
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn try_connect(&mut self, _timeout: Duration) -> Result<TransportStreams, ClientError> {
        match self.streams.take() {
            Some(streams) => {
                self.connected = true;
                Ok(streams)
            }
            None => Err(ClientError::ConnectionStopped),
        }
    }

    fn connected(&self) -> bool {
        self.connected
    }
}

//! Shared fixtures: an in-memory connection and a scripted fake server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

use clangd_client::codec::{FrameReader, FrameWriter};
use clangd_client::{Connection, ConnectionHandlers, StdioTransport};

/// The far end of a duplex-backed connection, playing the language server.
pub struct FakeServer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
}

impl FakeServer {
    /// Receive the next frame the client wrote.
    pub async fn recv(&mut self) -> Value {
        self.reader
            .read_frame()
            .await
            .expect("fake server read failed")
            .expect("client closed the stream")
    }

    /// Send a frame to the client.
    pub async fn send(&mut self, frame: &Value) {
        self.writer
            .write_frame(frame)
            .await
            .expect("fake server write failed");
    }

    /// Respond successfully to `request`, echoing its id.
    pub async fn respond(&mut self, request: &Value, result: Value) {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": result,
        });
        self.send(&frame).await;
    }
}

/// A started connection wired to a [`FakeServer`] over in-memory pipes.
pub async fn connect(handlers: ConnectionHandlers) -> (Arc<Connection>, FakeServer) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(near);
    let (server_read, server_write) = tokio::io::split(far);

    let connection = Connection::new(
        PathBuf::from("/project"),
        Box::new(StdioTransport::from_streams(client_read, client_write)),
        handlers,
    );
    connection.start();
    connection
        .await_server_connection(Duration::from_secs(1))
        .await
        .expect("connection never became ready");

    let server = FakeServer {
        reader: FrameReader::new(server_read),
        writer: FrameWriter::new(server_write),
    };
    (connection, server)
}

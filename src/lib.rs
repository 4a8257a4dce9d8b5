//! Client library for driving a child language server over stdio JSON-RPC.

pub mod codec;
pub mod connection;
pub mod error;
pub mod file_state;
pub mod process;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod transport;
pub mod uri;

pub(crate) mod event;

mod client;

pub use client::{
    ClientSettings, ConnectionType, InitializeHandler, LspClient, REQUEST_TIMEOUT_INITIALIZE,
    ServerInfo, StartRequest, TickHandler, TickRequest,
};
pub use connection::{
    CONNECTION_TIMEOUT, Connection, ConnectionHandlers, EditCollector, EditCollectorGuard,
    FileWatcher, ListenerFactory, RejectEdits,
};
pub use error::ClientError;
pub use file_state::{FileAction, FileState, ServerFileState, ServerFileStateStore};
pub use queue::{MAX_QUEUED_MESSAGES, NotificationQueue};
pub use registry::{PendingResponse, ResponseRegistry};
pub use transport::{StdioTransport, Transport, TransportStreams};

//! Connection engine: bidirectional JSON-RPC over an injected transport.
//!
//! One reader task parses frames and dispatches them; one writer task drains
//! a command channel so frames never interleave on the wire. Server-to-client
//! requests are handled inline on the reader task, strictly one at a time.
//!
//! Construction is two-phase: [`Connection::new`] prepares all state but
//! starts no work; [`Connection::start`] spawns the reader. The owner wires
//! up handlers between the two, then calls
//! [`Connection::await_server_connection`] before issuing requests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, encode_frame};
use crate::error::{ClientError, rpc};
use crate::event::Event;
use crate::protocol;
use crate::queue::NotificationQueue;
use crate::registry::{PendingResponse, ResponseCallback, ResponseRegistry};
use crate::transport::{BoxedWriter, Transport};

/// How long to wait for the transport to become usable.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for joining the reader task in [`Connection::close`].
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Strategy for answering `workspace/applyEdit` requests from the server.
///
/// Swapped in per command via [`Connection::collect_apply_edits`]; the swap
/// is only sound for the duration of a single command because the reader
/// serializes request handling, not commands.
pub trait EditCollector: Send + Sync {
    /// Handle one edit request. The return value becomes `applied` in the
    /// response.
    fn collect(&self, params: &Value) -> bool;
}

/// Default collector: refuses every server-initiated edit.
pub struct RejectEdits;

impl EditCollector for RejectEdits {
    fn collect(&self, _params: &Value) -> bool {
        false
    }
}

/// Watcher over one glob pattern, produced by a [`ListenerFactory`].
pub trait FileWatcher: Send {
    fn start(&mut self);
    fn stop(&mut self);
}

/// Capability that creates filesystem watchers for server-registered globs.
///
/// The concrete backend lives in the host; the connection only starts and
/// stops what the factory hands out.
pub trait ListenerFactory: Send + Sync {
    fn create_watcher(&self, glob: &str) -> Box<dyn FileWatcher>;
}

/// Handler for `workspace/configuration`: params in, configuration sections
/// out. `None` means unsupported.
pub type ConfigurationHandler = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Inline observer for server notifications, invoked on the reader task.
/// Errors are logged and swallowed; the reader never dies from handler bugs.
pub type NotificationHandler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Hooks injected at construction.
#[derive(Clone, Default)]
pub struct ConnectionHandlers {
    pub listener_factory: Option<Arc<dyn ListenerFactory>>,
    pub workspace_configuration: Option<ConfigurationHandler>,
    pub notification: Option<NotificationHandler>,
}

enum WriterCommand {
    Send(Vec<u8>),
    Shutdown,
}

/// One JSON-RPC connection to a server.
pub struct Connection {
    project_directory: PathBuf,
    registry: Arc<ResponseRegistry>,
    notifications: Arc<NotificationQueue>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    connection_event: Event,
    stop_event: Event,
    edit_collector: Mutex<Arc<dyn EditCollector>>,
    handlers: ConnectionHandlers,
    watchers: Mutex<HashMap<String, Vec<Box<dyn FileWatcher>>>>,
    // Consumed by `start`.
    transport: Mutex<Option<Box<dyn Transport>>>,
    writer_rx: Mutex<Option<mpsc::UnboundedReceiver<WriterCommand>>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Prepare a connection. No task runs until [`start`](Self::start).
    pub fn new(
        project_directory: PathBuf,
        transport: Box<dyn Transport>,
        handlers: ConnectionHandlers,
    ) -> Arc<Self> {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            project_directory,
            registry: Arc::new(ResponseRegistry::new()),
            notifications: Arc::new(NotificationQueue::new()),
            writer_tx,
            connection_event: Event::new(),
            stop_event: Event::new(),
            edit_collector: Mutex::new(Arc::new(RejectEdits)),
            handlers,
            watchers: Mutex::new(HashMap::new()),
            transport: Mutex::new(Some(transport)),
            writer_rx: Mutex::new(Some(writer_rx)),
            reader_handle: Mutex::new(None),
        })
    }

    /// Spawn the reader task. Idempotent; the second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let transport = self.transport.lock().expect("transport slot poisoned").take();
        let writer_rx = self.writer_rx.lock().expect("writer slot poisoned").take();
        let (Some(transport), Some(writer_rx)) = (transport, writer_rx) else {
            tracing::debug!("connection already started");
            return;
        };
        let handle = tokio::spawn(Arc::clone(self).run_reader(transport, writer_rx));
        *self.reader_handle.lock().expect("reader slot poisoned") = Some(handle);
    }

    pub fn project_directory(&self) -> &Path {
        &self.project_directory
    }

    /// Queue of server notifications, drained by the host. The drain task
    /// must not touch any of the client's locks; this handle is all it needs.
    pub fn notifications(&self) -> Arc<NotificationQueue> {
        Arc::clone(&self.notifications)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_event.is_set() && !self.stop_event.is_set()
    }

    /// Wait until the transport is ready for requests.
    pub async fn await_server_connection(&self, timeout: Duration) -> Result<(), ClientError> {
        if self.connection_event.wait_timeout(timeout).await {
            Ok(())
        } else {
            Err(ClientError::ConnectionTimeout)
        }
    }

    /// Send a request and return the pending slot to await.
    pub fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingResponse, ClientError> {
        self.send_request_with_callback(method, params, None)
    }

    /// Like [`send_request`](Self::send_request), with a callback that runs
    /// on the reader task when the slot settles.
    pub fn send_request_with_callback(
        &self,
        method: &str,
        params: Option<Value>,
        callback: Option<ResponseCallback>,
    ) -> Result<PendingResponse, ClientError> {
        let id = self.registry.alloc_id();
        let pending = self.registry.register(id, callback);
        let frame = serde_json::to_value(protocol::Request::new(id, method, params))
            .map_err(|err| {
                tracing::error!("failed to serialize request: {err}");
                ClientError::ConnectionStopped
            });
        let sent = frame.and_then(|frame| self.send_frame(&frame));
        if let Err(err) = sent {
            // Settle the slot so the id does not linger in the registry.
            self.registry.discard(id);
            return Err(err);
        }
        Ok(pending)
    }

    pub fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let frame = serde_json::to_value(protocol::Notification::new(method, params))
            .map_err(|err| {
                tracing::error!("failed to serialize notification: {err}");
                ClientError::ConnectionStopped
            })?;
        self.send_frame(&frame)
    }

    /// Respond to a server-to-client request.
    pub fn send_response(&self, id: &Value, result: Value) -> Result<(), ClientError> {
        self.send_frame(&protocol::response(id, result))
    }

    /// Respond to a server-to-client request with a known error code and its
    /// canonical reason.
    pub fn send_error_response(&self, id: &Value, code: i64) -> Result<(), ClientError> {
        let message = rpc::reason(code).unwrap_or("Unknown error code");
        self.send_frame(&protocol::error_response(id, code, message))
    }

    fn send_frame(&self, frame: &Value) -> Result<(), ClientError> {
        if self.stop_event.is_set() {
            return Err(ClientError::ConnectionStopped);
        }
        let bytes = encode_frame(frame).map_err(|err| {
            tracing::error!("failed to encode frame: {err:#}");
            ClientError::ConnectionStopped
        })?;
        self.writer_tx
            .send(WriterCommand::Send(bytes))
            .map_err(|_| ClientError::ConnectionStopped)
    }

    /// Swap the active edit collector for the duration of the returned
    /// guard. Dropping the guard restores the previous collector.
    pub fn collect_apply_edits(&self, collector: Arc<dyn EditCollector>) -> EditCollectorGuard<'_> {
        let previous = {
            let mut slot = self.edit_collector.lock().expect("collector poisoned");
            std::mem::replace(&mut *slot, collector)
        };
        EditCollectorGuard {
            connection: self,
            previous: Some(previous),
        }
    }

    /// Signal teardown and close the stream from the writer side. The server
    /// sees EOF on its stdin, exits, and the reader unblocks on EOF.
    pub fn stop(&self) {
        if self.stop_event.is_set() {
            return;
        }
        tracing::debug!("stopping connection");
        self.stop_event.set();
        let _ = self.writer_tx.send(WriterCommand::Shutdown);
    }

    /// [`stop`](Self::stop), then join the reader task with a short
    /// deadline. Idempotent.
    pub async fn close(&self) {
        self.stop();
        let handle = self.reader_handle.lock().expect("reader slot poisoned").take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("reader task did not stop in time, aborting it");
                handle.abort();
            }
        }
        // Covers the never-started case; a no-op after reader teardown.
        self.teardown();
    }

    async fn run_reader(
        self: Arc<Self>,
        mut transport: Box<dyn Transport>,
        writer_rx: mpsc::UnboundedReceiver<WriterCommand>,
    ) {
        let streams = match transport.try_connect(CONNECTION_TIMEOUT).await {
            Ok(streams) => streams,
            Err(err) => {
                tracing::warn!("could not connect to server: {err}");
                self.teardown();
                return;
            }
        };

        let writer_handle = tokio::spawn(run_writer(streams.writer, writer_rx));
        self.connection_event.set();

        let mut reader = FrameReader::new(streams.reader);
        loop {
            match reader.read_frame().await {
                Ok(Some(frame)) => self.dispatch(frame),
                Ok(None) => {
                    if self.stop_event.is_set() {
                        tracing::debug!("connection stopped");
                    } else {
                        tracing::info!("server closed the connection");
                    }
                    break;
                }
                Err(err) => {
                    if self.stop_event.is_set() {
                        tracing::debug!("read error during shutdown: {err:#}");
                    } else {
                        tracing::warn!("lost connection to server: {err:#}");
                    }
                    break;
                }
            }
        }

        self.stop_event.set();
        self.teardown();
        let _ = self.writer_tx.send(WriterCommand::Shutdown);
        let _ = writer_handle.await;
    }

    /// Abort all outstanding requests and stop every watcher.
    fn teardown(&self) {
        self.registry.abort_all();
        let drained: Vec<(String, Vec<Box<dyn FileWatcher>>)> = self
            .watchers
            .lock()
            .expect("watchers poisoned")
            .drain()
            .collect();
        for (id, mut group) in drained {
            tracing::debug!(registration = %id, "stopping file watchers");
            for watcher in &mut group {
                watcher.stop();
            }
        }
    }

    fn dispatch(&self, frame: Value) {
        let has_id = frame.get("id").is_some();
        let method = frame
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);
        match (has_id, method) {
            (true, Some(method)) => self.handle_server_request(&frame, &method),
            (true, None) => self.handle_response(frame),
            (false, Some(_)) => self.handle_notification(frame),
            (false, None) => tracing::trace!("ignoring frame with neither id nor method"),
        }
    }

    fn handle_response(&self, frame: Value) {
        let Some(id) = frame.get("id").and_then(Value::as_u64) else {
            tracing::warn!("dropping response with non-numeric id: {}", frame["id"]);
            return;
        };
        if let Err(err) = self.registry.deliver(id, frame) {
            // Not fatal: log and drop, the connection stays up.
            tracing::warn!("{err}");
        }
    }

    fn handle_notification(&self, frame: Value) {
        match &self.handlers.notification {
            Some(handler) => {
                self.notifications.try_push(frame.clone());
                if let Err(err) = handler(&frame) {
                    tracing::error!("notification handler failed: {err:#}");
                }
            }
            None => self.notifications.try_push(frame),
        }
    }

    fn handle_server_request(&self, frame: &Value, method: &str) {
        let id = frame.get("id").cloned().unwrap_or(Value::Null);
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        let sent = match method {
            "workspace/applyEdit" => {
                let collector = Arc::clone(&self.edit_collector.lock().expect("collector poisoned"));
                let applied = collector.collect(&params);
                self.send_response(&id, serde_json::json!({ "applied": applied }))
            }
            "workspace/configuration" => {
                let result = self
                    .handlers
                    .workspace_configuration
                    .as_ref()
                    .and_then(|handler| handler(&params));
                match result {
                    Some(result) => self.send_response(&id, result),
                    None => self.send_error_response(&id, rpc::METHOD_NOT_FOUND),
                }
            }
            "client/registerCapability" => {
                self.register_capabilities(&params);
                self.send_response(&id, Value::Null)
            }
            "client/unregisterCapability" => {
                self.unregister_capabilities(&params);
                self.send_response(&id, Value::Null)
            }
            other => {
                tracing::debug!("rejecting unsupported server request: {other}");
                self.send_error_response(&id, rpc::METHOD_NOT_FOUND)
            }
        };

        if sent.is_err() {
            tracing::warn!("could not respond to server request {method}: connection stopped");
        }
    }

    fn register_capabilities(&self, params: &Value) {
        let Some(registrations) = params.get("registrations").and_then(Value::as_array) else {
            return;
        };
        for registration in registrations {
            let method = registration.get("method").and_then(Value::as_str);
            if method != Some("workspace/didChangeWatchedFiles") {
                continue;
            }
            let Some(factory) = &self.handlers.listener_factory else {
                tracing::debug!("no listener factory, ignoring watched-files registration");
                continue;
            };
            let registration_id = registration
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let mut started = Vec::new();
            let specs = registration
                .pointer("/registerOptions/watchers")
                .and_then(Value::as_array);
            for spec in specs.into_iter().flatten() {
                let Some(glob) = spec.get("globPattern").and_then(Value::as_str) else {
                    continue;
                };
                let absolute = if Path::new(glob).is_absolute() {
                    glob.to_string()
                } else {
                    self.project_directory
                        .join(glob)
                        .to_string_lossy()
                        .into_owned()
                };
                let mut watcher = factory.create_watcher(&absolute);
                watcher.start();
                started.push(watcher);
            }

            if !started.is_empty() {
                tracing::debug!(
                    registration = %registration_id,
                    count = started.len(),
                    "started file watchers"
                );
                self.watchers
                    .lock()
                    .expect("watchers poisoned")
                    .entry(registration_id)
                    .or_default()
                    .extend(started);
            }
        }
    }

    fn unregister_capabilities(&self, params: &Value) {
        // "unregisterations" is the spelling the protocol mandates.
        let Some(unregistrations) = params.get("unregisterations").and_then(Value::as_array)
        else {
            return;
        };
        for unregistration in unregistrations {
            let Some(registration_id) = unregistration.get("id").and_then(Value::as_str) else {
                continue;
            };
            let group = self
                .watchers
                .lock()
                .expect("watchers poisoned")
                .remove(registration_id);
            if let Some(mut group) = group {
                tracing::debug!(registration = %registration_id, "cancelling file watchers");
                for watcher in &mut group {
                    watcher.stop();
                }
            }
        }
    }
}

/// Restores the previously active edit collector on drop.
pub struct EditCollectorGuard<'a> {
    connection: &'a Connection,
    previous: Option<Arc<dyn EditCollector>>,
}

impl Drop for EditCollectorGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self
                .connection
                .edit_collector
                .lock()
                .expect("collector poisoned") = previous;
        }
    }
}

async fn run_writer(mut writer: BoxedWriter, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send(bytes) => {
                if let Err(err) = writer.write_all(&bytes).await {
                    tracing::warn!("write error: {err}");
                    break;
                }
                if let Err(err) = writer.flush().await {
                    tracing::warn!("flush error: {err}");
                    break;
                }
            }
            WriterCommand::Shutdown => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
}

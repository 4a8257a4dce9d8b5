//! Lifecycle controller: spawn, initialize, drive, and shut down the server.
//!
//! All mutable server state lives behind one `server_info` mutex. Command
//! paths take it to update the file-state mirror and release it before
//! blocking on responses. The host's notification drain never takes it; the
//! queue handle and the initialize gate are reachable without it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::connection::{CONNECTION_TIMEOUT, Connection, ConnectionHandlers};
use crate::error::ClientError;
use crate::event::Event;
use crate::file_state::{FileAction, ServerFileStateStore};
use crate::process::{
    SUBPROCESS_JOIN_TIMEOUT, SUBPROCESS_KILL_GRACE, ServerProcess, StdStream, StdioWiring,
    create_stderr_logfile,
};
use crate::protocol;
use crate::queue::NotificationQueue;
use crate::transport::StdioTransport;
use crate::uri;

/// Deadline for the `initialize` exchange and the `shutdown` request.
pub const REQUEST_TIMEOUT_INITIALIZE: Duration = Duration::from_secs(30);

/// How the client reaches the server process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Stdio,
    /// Recognized in configuration but refused at start: this version speaks
    /// stdio only.
    Tcp,
}

/// Static configuration for one client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Display name; also seeds the stderr log file name.
    pub name: String,
    /// Server binary, resolved through `PATH` unless absolute.
    pub server_command: String,
    pub server_args: Vec<String>,
    /// `languageId` used in `textDocument/didOpen`.
    pub language_id: String,
    pub connection_type: ConnectionType,
    /// Keep stderr log files after shutdown.
    pub keep_logfiles: bool,
    /// Payload for `initializationOptions` in the `initialize` request.
    pub initialization_options: Value,
    /// Deep-merged over the default client capabilities.
    pub extra_capabilities: Value,
    /// Payload for `workspace/didChangeConfiguration` after initialize.
    pub settings: Value,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            name: "clangd".to_string(),
            server_command: "clangd".to_string(),
            server_args: Vec::new(),
            language_id: "cpp".to_string(),
            connection_type: ConnectionType::Stdio,
            keep_logfiles: false,
            initialization_options: Value::Null,
            extra_capabilities: Value::Null,
            settings: Value::Null,
        }
    }
}

/// Parameters for starting the server.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Workspace root; falls back to the current directory.
    pub project_directory: Option<PathBuf>,
}

/// One editor tick: the set of dirty buffers the editor currently holds.
#[derive(Debug, Clone, Default)]
pub struct TickRequest {
    /// Buffer contents keyed by absolute path.
    pub file_data: HashMap<PathBuf, String>,
    pub project_directory: Option<PathBuf>,
}

/// Runs on an editor tick, under the `server_info` mutex.
pub type TickHandler = Arc<dyn Fn(&mut ServerInfo, &TickRequest) + Send + Sync>;

/// Runs once the initialize exchange completes, under the `server_info`
/// mutex.
pub type InitializeHandler = Arc<dyn Fn(&mut ServerInfo) + Send + Sync>;

/// Server state guarded by the `server_info` mutex.
pub struct ServerInfo {
    process: Option<ServerProcess>,
    connection: Option<Arc<Connection>>,
    stderr_logfile: Option<PathBuf>,
    file_store: ServerFileStateStore,
    server_capabilities: Option<Value>,
    project_directory: PathBuf,
    started: bool,
}

impl ServerInfo {
    fn new() -> Self {
        Self {
            process: None,
            connection: None,
            stderr_logfile: None,
            file_store: ServerFileStateStore::new(),
            server_capabilities: None,
            project_directory: PathBuf::new(),
            started: false,
        }
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    pub fn file_store(&mut self) -> &mut ServerFileStateStore {
        &mut self.file_store
    }

    pub fn server_capabilities(&self) -> Option<&Value> {
        self.server_capabilities.as_ref()
    }

    pub fn project_directory(&self) -> &Path {
        &self.project_directory
    }

    fn healthy(&mut self) -> bool {
        match self.process.as_mut() {
            Some(process) => process.is_running(),
            None => self
                .connection
                .as_ref()
                .is_some_and(|connection| connection.is_connected()),
        }
    }
}

struct InitializeState {
    event: Event,
    response: Mutex<Option<Value>>,
}

impl InitializeState {
    fn new() -> Self {
        Self {
            event: Event::new(),
            response: Mutex::new(None),
        }
    }

    /// Store the outcome (idempotently) and open the gate.
    fn release(&self, response: Option<Value>) {
        {
            let mut slot = self.response.lock().expect("initialize state poisoned");
            if slot.is_none() {
                *slot = response;
            }
        }
        self.event.set();
    }

    fn completed_ok(&self) -> bool {
        self.event.is_set()
            && self
                .response
                .lock()
                .expect("initialize state poisoned")
                .is_some()
    }
}

/// Client for one language server.
pub struct LspClient {
    settings: ClientSettings,
    connection_handlers: Mutex<ConnectionHandlers>,
    server_info: Arc<tokio::sync::Mutex<ServerInfo>>,
    init_state: Mutex<Arc<InitializeState>>,
    notification_queue: Mutex<Arc<NotificationQueue>>,
    tick_handlers: Mutex<Vec<TickHandler>>,
    initialize_handlers: Mutex<Vec<InitializeHandler>>,
}

impl LspClient {
    pub fn new(settings: ClientSettings) -> Arc<Self> {
        Self::with_handlers(settings, ConnectionHandlers::default())
    }

    /// Build a client with injected connection hooks (listener factory,
    /// configuration handler, notification observer).
    pub fn with_handlers(settings: ClientSettings, handlers: ConnectionHandlers) -> Arc<Self> {
        let client = Arc::new(Self {
            settings,
            connection_handlers: Mutex::new(handlers),
            server_info: Arc::new(tokio::sync::Mutex::new(ServerInfo::new())),
            init_state: Mutex::new(Arc::new(InitializeState::new())),
            notification_queue: Mutex::new(Arc::new(NotificationQueue::new())),
            tick_handlers: Mutex::new(Vec::new()),
            initialize_handlers: Mutex::new(Vec::new()),
        });
        let language_id = client.settings.language_id.clone();
        client.register_tick_handler(Arc::new(move |info, request| {
            update_server_with_file_contents(info, request, &language_id);
        }));
        client
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Queue of raw server notifications. Safe to drain from any task; the
    /// drain path takes none of the client's locks.
    pub fn notifications(&self) -> Arc<NotificationQueue> {
        self.notification_queue
            .lock()
            .expect("queue slot poisoned")
            .clone()
    }

    /// Handlers run in reverse registration order on every tick.
    pub fn register_tick_handler(&self, handler: TickHandler) {
        self.tick_handlers
            .lock()
            .expect("handlers poisoned")
            .push(handler);
    }

    /// Handlers run in reverse registration order after initialize.
    pub fn register_on_initialize_complete(&self, handler: InitializeHandler) {
        self.initialize_handlers
            .lock()
            .expect("handlers poisoned")
            .push(handler);
    }

    fn current_init_state(&self) -> Arc<InitializeState> {
        self.init_state.lock().expect("init state poisoned").clone()
    }

    /// Spawn and connect the server. Returns false on any failure; the
    /// failure is logged, never raised.
    pub async fn start_server(self: &Arc<Self>, request: &StartRequest) -> bool {
        let mut info = self.server_info.lock().await;
        self.start_server_locked(&mut info, request).await
    }

    async fn start_server_locked(
        self: &Arc<Self>,
        info: &mut ServerInfo,
        request: &StartRequest,
    ) -> bool {
        if self.settings.connection_type == ConnectionType::Tcp {
            tracing::error!("TCP server connections are not supported");
            return false;
        }
        if info.healthy() {
            tracing::debug!("server already running");
            return true;
        }
        info.started = true;
        *self.init_state.lock().expect("init state poisoned") = Arc::new(InitializeState::new());

        let project_directory = request
            .project_directory
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"));

        let binary = match which::which(&self.settings.server_command) {
            Ok(binary) => binary,
            Err(err) => {
                tracing::error!(
                    "server binary '{}' not found: {err}",
                    self.settings.server_command
                );
                return false;
            }
        };

        let wiring = match create_stderr_logfile(&self.settings.name) {
            Ok(log_path) => {
                tracing::info!(log = %log_path.display(), "server stderr log");
                info.stderr_logfile = Some(log_path.clone());
                StdioWiring::piped_with_stderr_log(log_path)
            }
            Err(err) => {
                tracing::warn!("could not create stderr log file: {err:#}");
                StdioWiring {
                    stdin: StdStream::Piped,
                    stdout: StdStream::Piped,
                    stderr: StdStream::Null,
                }
            }
        };

        let mut process = match ServerProcess::spawn(&binary, &self.settings.server_args, &wiring) {
            Ok(process) => process,
            Err(err) => {
                tracing::error!("failed to spawn server: {err:#}");
                self.reset(info);
                return false;
            }
        };

        let (Some(stdin), Some(stdout)) = (process.take_stdin(), process.take_stdout()) else {
            tracing::error!("server process is missing its stdio pipes");
            self.reset(info);
            return false;
        };

        let connection = Connection::new(
            project_directory.clone(),
            Box::new(StdioTransport::new(stdin, stdout)),
            self.connection_handlers
                .lock()
                .expect("handlers poisoned")
                .clone(),
        );
        *self
            .notification_queue
            .lock()
            .expect("queue slot poisoned") = connection.notifications();

        info.process = Some(process);
        info.connection = Some(Arc::clone(&connection));
        info.project_directory = project_directory;

        connection.start();
        if let Err(err) = connection
            .await_server_connection(CONNECTION_TIMEOUT)
            .await
        {
            tracing::error!("server connection failed: {err}");
            self.shutdown_locked(info).await;
            return false;
        }

        self.send_initialize(info);
        true
    }

    /// Send `initialize` and finish the handshake from a background task
    /// when the response arrives.
    fn send_initialize(self: &Arc<Self>, info: &mut ServerInfo) {
        let Some(connection) = info.connection.clone() else {
            return;
        };
        let root_uri = match uri::file_path_to_uri(&info.project_directory) {
            Ok(root_uri) => root_uri,
            Err(err) => {
                tracing::error!("cannot derive root URI: {err}");
                self.current_init_state().release(None);
                return;
            }
        };

        let mut capabilities = protocol::default_capabilities();
        if !self.settings.extra_capabilities.is_null() {
            protocol::merge_capabilities(&mut capabilities, &self.settings.extra_capabilities);
        }
        let params = protocol::initialize_params(
            std::process::id(),
            &info.project_directory,
            &root_uri,
            &self.settings.initialization_options,
            capabilities,
        );

        let pending = match connection.send_request("initialize", Some(params)) {
            Ok(pending) => pending,
            Err(err) => {
                tracing::error!("failed to send initialize: {err}");
                self.current_init_state().release(None);
                return;
            }
        };

        let client = Arc::clone(self);
        let init_state = self.current_init_state();
        tokio::spawn(async move {
            match pending.wait(REQUEST_TIMEOUT_INITIALIZE).await {
                Ok(response) => client.complete_initialize(response).await,
                Err(err) => {
                    tracing::error!("initialize failed: {err}");
                    init_state.release(None);
                }
            }
        });
    }

    async fn complete_initialize(self: &Arc<Self>, response: Value) {
        let mut info = self.server_info.lock().await;
        info.server_capabilities = response.pointer("/result/capabilities").cloned();
        tracing::info!("language server initialized");
        self.current_init_state().release(Some(response));

        let handlers: Vec<InitializeHandler> = self
            .initialize_handlers
            .lock()
            .expect("handlers poisoned")
            .clone();
        for handler in handlers.iter().rev() {
            handler(&mut info);
        }

        if let Some(connection) = &info.connection {
            if let Err(err) = connection.send_notification("initialized", Some(json!({}))) {
                tracing::warn!("could not send initialized notification: {err}");
            }
            if !self.settings.settings.is_null()
                && let Err(err) = connection.send_notification(
                    "workspace/didChangeConfiguration",
                    Some(protocol::did_change_configuration_params(
                        &self.settings.settings,
                    )),
                )
            {
                tracing::warn!("could not send configuration: {err}");
            }
        }
    }

    /// True once the initialize response has arrived and the server is
    /// still up. False while the exchange is in flight.
    pub async fn server_initialized(&self) -> bool {
        self.current_init_state().completed_ok() && self.server_healthy().await
    }

    pub async fn server_healthy(&self) -> bool {
        self.server_info.lock().await.healthy()
    }

    /// Wait for the initialize exchange to settle; true if it succeeded.
    pub async fn wait_for_initialized(&self, timeout: Duration) -> bool {
        let state = self.current_init_state();
        state.event.wait_timeout(timeout).await && state.completed_ok()
    }

    pub async fn server_capabilities(&self) -> Option<Value> {
        self.server_info.lock().await.server_capabilities.clone()
    }

    pub async fn stderr_logfile(&self) -> Option<PathBuf> {
        self.server_info.lock().await.stderr_logfile.clone()
    }

    /// Issue a request and await its response. The `server_info` mutex is
    /// released before blocking on the wait.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let connection = self
            .server_info
            .lock()
            .await
            .connection
            .clone()
            .ok_or(ClientError::ConnectionStopped)?;
        let pending = connection.send_request(method, params)?;
        pending.wait(timeout).await
    }

    /// Editor tick. Starts the server on first use, parks behind the
    /// initialize gate while the handshake is in flight, and otherwise runs
    /// the tick handlers in reverse registration order.
    pub async fn on_file_ready_to_parse(self: &Arc<Self>, request: TickRequest) {
        {
            let mut info = self.server_info.lock().await;
            if !info.healthy() {
                if info.started {
                    tracing::debug!("server is down, awaiting an explicit restart");
                    return;
                }
                let start = StartRequest {
                    project_directory: request.project_directory.clone(),
                };
                if !self.start_server_locked(&mut info, &start).await {
                    return;
                }
            }
        }

        let init_state = self.current_init_state();
        if !init_state.event.is_set() {
            // Handshake in flight: run this tick as soon as it settles.
            let client = Arc::clone(self);
            tokio::spawn(async move {
                init_state.event.wait().await;
                if init_state.completed_ok() {
                    client.run_tick_handlers(&request).await;
                }
            });
            return;
        }
        if init_state.completed_ok() {
            self.run_tick_handlers(&request).await;
        }
    }

    async fn run_tick_handlers(&self, request: &TickRequest) {
        let handlers: Vec<TickHandler> = self
            .tick_handlers
            .lock()
            .expect("handlers poisoned")
            .clone();
        let mut info = self.server_info.lock().await;
        for handler in handlers.iter().rev() {
            handler(&mut info, request);
        }
    }

    /// The editor saved `path`; tell the server if the file is tracked.
    pub async fn on_file_save(&self, path: &Path) {
        let info = self.server_info.lock().await;
        let Some(connection) = &info.connection else {
            return;
        };
        if info.file_store.get(path).is_none() {
            return;
        }
        match uri::file_path_to_uri(path) {
            Ok(uri) => {
                if let Err(err) = connection
                    .send_notification("textDocument/didSave", Some(protocol::did_save_params(&uri)))
                {
                    tracing::warn!("could not send didSave: {err}");
                }
            }
            Err(err) => tracing::warn!("skipping didSave: {err}"),
        }
    }

    /// The editor unloaded `path`; close it on the server and forget it.
    pub async fn on_buffer_unload(&self, path: &Path) {
        let mut info = self.server_info.lock().await;
        let Some(connection) = info.connection.clone() else {
            return;
        };
        let action = info.file_store.get_or_insert(path).file_close();
        if action == FileAction::CloseFile {
            match uri::file_path_to_uri(path) {
                Ok(uri) => {
                    if let Err(err) = connection.send_notification(
                        "textDocument/didClose",
                        Some(protocol::did_close_params(&uri)),
                    ) {
                        tracing::warn!("could not send didClose: {err}");
                    }
                }
                Err(err) => tracing::warn!("skipping didClose: {err}"),
            }
        }
        info.file_store.remove(path);
    }

    /// Protocol-level goodbye: `shutdown` request, then `exit` notification.
    ///
    /// Best-effort: an aborted response means the server already left, which
    /// is the goal; everything else is logged and swallowed.
    pub async fn shutdown_server(&self) {
        let connection = self.server_info.lock().await.connection.clone();
        let Some(connection) = connection else {
            self.current_init_state().release(None);
            return;
        };

        if self.server_initialized().await {
            tracing::info!("sending shutdown request");
            match connection.send_request("shutdown", None) {
                Ok(pending) => match pending.wait(REQUEST_TIMEOUT_INITIALIZE).await {
                    Ok(_) | Err(ClientError::ResponseAborted) => {}
                    Err(err) => tracing::warn!("shutdown request failed: {err}"),
                },
                Err(err) => tracing::warn!("could not send shutdown request: {err}"),
            }
        }

        if self.server_healthy().await
            && let Err(err) = connection.send_notification("exit", None)
        {
            tracing::debug!("could not send exit notification: {err}");
        }

        // Anyone parked on the initialize gate is released empty-handed.
        self.current_init_state().release(None);
    }

    /// Tear down the transport and the process. Best-effort and idempotent;
    /// errors are logged, never raised.
    pub async fn shutdown(&self) {
        let mut info = self.server_info.lock().await;
        self.shutdown_locked(&mut info).await;
    }

    async fn shutdown_locked(&self, info: &mut ServerInfo) {
        tracing::info!("shutting down language server");
        if let Some(connection) = &info.connection {
            connection.stop();
        }
        if !info.healthy() {
            self.reset(info);
            return;
        }
        if let Some(connection) = &info.connection {
            connection.close().await;
        }
        if let Some(process) = info.process.as_mut() {
            let reaped = process
                .shutdown_with_deadline(SUBPROCESS_JOIN_TIMEOUT, SUBPROCESS_KILL_GRACE)
                .await;
            if !reaped {
                tracing::warn!("server process stuck during shutdown, abandoning it");
            }
        }
        self.reset(info);
    }

    /// `shutdown` then `start_server`.
    pub async fn restart(self: &Arc<Self>, request: &StartRequest) -> bool {
        let mut info = self.server_info.lock().await;
        self.shutdown_locked(&mut info).await;
        info.started = false;
        self.start_server_locked(&mut info, request).await
    }

    fn reset(&self, info: &mut ServerInfo) {
        info.process = None;
        info.connection = None;
        info.server_capabilities = None;
        info.file_store = ServerFileStateStore::new();
        self.current_init_state().release(None);

        if let Some(path) = info.stderr_logfile.take() {
            if self.settings.keep_logfiles {
                tracing::info!(log = %path.display(), "keeping server log file");
            } else if let Err(err) = std::fs::remove_file(&path) {
                tracing::debug!("could not remove log file {}: {err}", path.display());
            }
        }
    }
}

/// Canonical tick handler: mirror the editor's buffers into the server.
///
/// Three phases under the `server_info` mutex: push dirty buffers, re-read
/// tracked files the editor no longer holds (collecting the ones that
/// vanished), then purge the vanished ones.
fn update_server_with_file_contents(
    info: &mut ServerInfo,
    request: &TickRequest,
    language_id: &str,
) {
    let Some(connection) = info.connection.clone() else {
        return;
    };
    update_dirty_files(&connection, info.file_store(), &request.file_data, language_id);
    let purge = update_saved_files(&connection, info.file_store(), &request.file_data, language_id);
    purge_missing_files(&connection, info.file_store(), &purge);
}

fn update_dirty_files(
    connection: &Connection,
    store: &mut ServerFileStateStore,
    file_data: &HashMap<PathBuf, String>,
    language_id: &str,
) {
    for (path, contents) in file_data {
        let state = store.get_or_insert(path);
        let action = state.dirty_file(contents.as_bytes());
        let version = state.version();
        send_file_action(connection, path, action, version, contents, language_id);
    }
}

/// Files the server has open but the editor no longer holds follow the disk;
/// files gone from disk are returned for purging.
fn update_saved_files(
    connection: &Connection,
    store: &mut ServerFileStateStore,
    file_data: &HashMap<PathBuf, String>,
    language_id: &str,
) -> Vec<PathBuf> {
    let mut purge = Vec::new();
    for path in store.tracked_paths() {
        if file_data.contains_key(&path) {
            continue;
        }
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => {
                purge.push(path);
                continue;
            }
        };
        let state = store.get_or_insert(&path);
        let action = state.saved_file(contents.as_bytes());
        let version = state.version();
        send_file_action(connection, &path, action, version, &contents, language_id);
    }
    purge
}

fn purge_missing_files(
    connection: &Connection,
    store: &mut ServerFileStateStore,
    purge: &[PathBuf],
) {
    for path in purge {
        let action = store.get_or_insert(path).file_close();
        if action == FileAction::CloseFile {
            match uri::file_path_to_uri(path) {
                Ok(uri) => {
                    if let Err(err) = connection.send_notification(
                        "textDocument/didClose",
                        Some(protocol::did_close_params(&uri)),
                    ) {
                        tracing::warn!("could not send didClose: {err}");
                    }
                }
                Err(err) => tracing::warn!("skipping didClose: {err}"),
            }
        }
        store.remove(path);
    }
}

fn send_file_action(
    connection: &Connection,
    path: &Path,
    action: FileAction,
    version: i32,
    contents: &str,
    language_id: &str,
) {
    if action == FileAction::NoAction {
        return;
    }
    let uri = match uri::file_path_to_uri(path) {
        Ok(uri) => uri,
        Err(err) => {
            tracing::warn!("skipping sync for {}: {err}", path.display());
            return;
        }
    };
    let result = match action {
        FileAction::OpenFile => connection.send_notification(
            "textDocument/didOpen",
            Some(protocol::did_open_params(&uri, language_id, version, contents)),
        ),
        FileAction::ChangeFile => connection.send_notification(
            "textDocument/didChange",
            Some(protocol::did_change_params(&uri, version, contents)),
        ),
        FileAction::CloseFile => connection.send_notification(
            "textDocument/didClose",
            Some(protocol::did_close_params(&uri)),
        ),
        FileAction::NoAction => Ok(()),
    };
    if let Err(err) = result {
        tracing::warn!("could not sync {}: {err}", path.display());
    }
}

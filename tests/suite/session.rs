//! A scripted session: handshake, server requests, notification flow.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use clangd_client::{
    ConnectionHandlers, EditCollector, FileWatcher, ListenerFactory, MAX_QUEUED_MESSAGES,
};

use crate::common::connect;

#[tokio::test]
async fn initialize_handshake_round_trip() {
    let (connection, mut server) = connect(ConnectionHandlers::default()).await;

    let pending = connection
        .send_request(
            "initialize",
            Some(json!({
                "processId": 1,
                "rootUri": "file:///project",
                "capabilities": {},
            })),
        )
        .unwrap();

    let request = server.recv().await;
    assert_eq!(request["method"], "initialize");
    assert_eq!(request["jsonrpc"], "2.0");
    server
        .respond(
            &request,
            json!({"capabilities": {"textDocumentSync": 1}}),
        )
        .await;

    let response = pending.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(response["result"]["capabilities"]["textDocumentSync"], 1);

    connection
        .send_notification("initialized", Some(json!({})))
        .unwrap();
    let notification = server.recv().await;
    assert_eq!(notification["method"], "initialized");
    assert!(notification.get("id").is_none());
}

struct NoopWatcher;

impl FileWatcher for NoopWatcher {
    fn start(&mut self) {}
    fn stop(&mut self) {}
}

struct TrackingFactory {
    asked: std::sync::Mutex<Vec<String>>,
}

impl ListenerFactory for TrackingFactory {
    fn create_watcher(&self, glob: &str) -> Box<dyn FileWatcher> {
        self.asked.lock().unwrap().push(glob.to_string());
        Box::new(NoopWatcher)
    }
}

#[tokio::test]
async fn server_registers_watchers_and_requests_configuration() {
    let factory = Arc::new(TrackingFactory {
        asked: std::sync::Mutex::new(Vec::new()),
    });
    let handlers = ConnectionHandlers {
        listener_factory: Some(factory.clone()),
        workspace_configuration: Some(Arc::new(|_params: &Value| {
            Some(json!([{"compilationDatabasePath": "build"}]))
        })),
        ..Default::default()
    };
    let (_connection, mut server) = connect(handlers).await;

    server
        .send(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "client/registerCapability",
            "params": {
                "registrations": [{
                    "id": "workspace-watch",
                    "method": "workspace/didChangeWatchedFiles",
                    "registerOptions": {
                        "watchers": [{"globPattern": "**/*.clang-tidy"}]
                    }
                }]
            }
        }))
        .await;
    let response = server.recv().await;
    assert_eq!(response["id"], 1);
    assert!(response["result"].is_null());
    assert_eq!(
        *factory.asked.lock().unwrap(),
        vec!["/project/**/*.clang-tidy".to_string()]
    );

    server
        .send(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "workspace/configuration",
            "params": {"items": [{"section": "clangd"}]}
        }))
        .await;
    let response = server.recv().await;
    assert_eq!(
        response["result"][0]["compilationDatabasePath"],
        "build"
    );
}

struct AcceptAll {
    hit: AtomicBool,
}

impl EditCollector for AcceptAll {
    fn collect(&self, _params: &Value) -> bool {
        self.hit.store(true, Ordering::SeqCst);
        true
    }
}

#[tokio::test]
async fn apply_edit_collected_only_while_guard_lives() {
    let (connection, mut server) = connect(ConnectionHandlers::default()).await;
    let collector = Arc::new(AcceptAll {
        hit: AtomicBool::new(false),
    });

    {
        let _guard = connection.collect_apply_edits(collector.clone());
        server
            .send(&json!({
                "jsonrpc": "2.0", "id": 1,
                "method": "workspace/applyEdit",
                "params": {"edit": {"changes": {}}}
            }))
            .await;
        let response = server.recv().await;
        assert_eq!(response["result"]["applied"], true);
    }
    assert!(collector.hit.load(Ordering::SeqCst));

    server
        .send(&json!({
            "jsonrpc": "2.0", "id": 2,
            "method": "workspace/applyEdit",
            "params": {"edit": {"changes": {}}}
        }))
        .await;
    let response = server.recv().await;
    assert_eq!(response["result"]["applied"], false);
}

#[tokio::test]
async fn notification_flood_keeps_only_the_most_recent() {
    let (connection, mut server) = connect(ConnectionHandlers::default()).await;
    let overflow = 5;
    let total = MAX_QUEUED_MESSAGES + overflow;

    for i in 0..total {
        server
            .send(&json!({
                "jsonrpc": "2.0",
                "method": "$/progress",
                "params": {"seq": i}
            }))
            .await;
    }

    // A request/response pair after the flood proves the reader has
    // dispatched every preceding notification.
    let pending = connection.send_request("test/sync", None).unwrap();
    let request = server.recv().await;
    server.respond(&request, Value::Null).await;
    pending.wait(Duration::from_secs(1)).await.unwrap();

    let queue = connection.notifications();
    let mut drained = Vec::new();
    while let Some(frame) = queue.try_pop() {
        drained.push(frame["params"]["seq"].as_u64().unwrap() as usize);
    }
    assert_eq!(drained.len(), MAX_QUEUED_MESSAGES);
    assert_eq!(drained[0], overflow);
    assert_eq!(*drained.last().unwrap(), total - 1);
}

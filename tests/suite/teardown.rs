//! Teardown behavior: abort-all, idempotent shutdown, post-stop sends.

use std::time::Duration;

use serde_json::json;

use clangd_client::{ClientError, ConnectionHandlers};

use crate::common::connect;

#[tokio::test]
async fn server_crash_aborts_all_waiters() {
    let (connection, mut server) = connect(ConnectionHandlers::default()).await;

    let first = connection.send_request("textDocument/hover", None).unwrap();
    let second = connection
        .send_request("textDocument/completion", None)
        .unwrap();
    server.recv().await;
    server.recv().await;

    // The server dies without responding.
    drop(server);

    assert!(matches!(
        first.wait(Duration::from_secs(1)).await,
        Err(ClientError::ResponseAborted)
    ));
    assert!(matches!(
        second.wait(Duration::from_secs(1)).await,
        Err(ClientError::ResponseAborted)
    ));
}

#[tokio::test]
async fn close_is_idempotent_and_stops_sends() {
    let (connection, mut server) = connect(ConnectionHandlers::default()).await;

    connection
        .send_notification("initialized", Some(json!({})))
        .unwrap();
    server.recv().await;

    connection.close().await;
    connection.close().await;

    assert!(!connection.is_connected());
    assert!(matches!(
        connection.send_notification("exit", None),
        Err(ClientError::ConnectionStopped)
    ));
    assert!(matches!(
        connection.send_request("shutdown", None),
        Err(ClientError::ConnectionStopped)
    ));
}

#[tokio::test]
async fn graceful_shutdown_sequence() {
    let (connection, mut server) = connect(ConnectionHandlers::default()).await;

    let pending = connection.send_request("shutdown", None).unwrap();
    let request = server.recv().await;
    assert_eq!(request["method"], "shutdown");
    server.respond(&request, serde_json::Value::Null).await;
    pending.wait(Duration::from_secs(1)).await.unwrap();

    connection.send_notification("exit", None).unwrap();
    let exit = server.recv().await;
    assert_eq!(exit["method"], "exit");

    connection.close().await;
    assert!(!connection.is_connected());
}

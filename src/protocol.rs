//! JSON-RPC message types and LSP parameter builders.

use std::path::Path;

use serde::Serialize;
use serde_json::{Value, json};

/// An outgoing JSON-RPC request.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// An outgoing JSON-RPC notification.
#[derive(Debug, Serialize)]
pub struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Successful response to a server-to-client request. The id is echoed
/// verbatim, whatever JSON type the server chose for it.
pub fn response(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// Error response to a server-to-client request.
pub fn error_response(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
        },
    })
}

/// Default client capabilities advertised during `initialize`.
pub fn default_capabilities() -> Value {
    json!({
        "textDocument": {
            "synchronization": {
                "didSave": true,
            },
            "publishDiagnostics": {
                "relatedInformation": true,
            },
        },
        "workspace": {
            "applyEdit": true,
            "didChangeWatchedFiles": {
                "dynamicRegistration": true,
            },
            "workspaceEdit": {
                "documentChanges": true,
            },
        },
    })
}

/// Recursively merge `extra` into `base`: objects merge key-wise, anything
/// else in `extra` replaces the base value.
pub fn merge_capabilities(base: &mut Value, extra: &Value) {
    match (base, extra) {
        (Value::Object(base_map), Value::Object(extra_map)) => {
            for (key, extra_value) in extra_map {
                match base_map.get_mut(key) {
                    Some(base_value) => merge_capabilities(base_value, extra_value),
                    None => {
                        base_map.insert(key.clone(), extra_value.clone());
                    }
                }
            }
        }
        (base, extra) => *base = extra.clone(),
    }
}

pub fn initialize_params(
    process_id: u32,
    project_directory: &Path,
    root_uri: &str,
    initialization_options: &Value,
    capabilities: Value,
) -> Value {
    json!({
        "processId": process_id,
        "rootPath": project_directory.to_string_lossy(),
        "rootUri": root_uri,
        "initializationOptions": initialization_options,
        "capabilities": capabilities,
    })
}

pub fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text,
        },
    })
}

pub fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "version": version,
        },
        "contentChanges": [{
            "text": text,
        }],
    })
}

pub fn did_save_params(uri: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
        },
    })
}

pub fn did_close_params(uri: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
        },
    })
}

pub fn did_change_configuration_params(settings: &Value) -> Value {
    json!({
        "settings": settings,
    })
}

/// Change type for `workspace/didChangeWatchedFiles` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeType {
    Created = 1,
    Changed = 2,
    Deleted = 3,
}

/// Params for `workspace/didChangeWatchedFiles`, built from the events a
/// host-side watcher observed.
pub fn did_change_watched_files_params(events: &[(String, FileChangeType)]) -> Value {
    let changes: Vec<Value> = events
        .iter()
        .map(|(uri, change_type)| {
            json!({
                "uri": uri,
                "type": *change_type as i64,
            })
        })
        .collect();
    json!({
        "changes": changes,
    })
}

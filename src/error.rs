//! Error taxonomy for the client library.
//!
//! [`ClientError`] is the user-visible surface. Internal conditions (framing
//! faults, unexpected response ids, stuck subprocess termination) are logged
//! where they occur and never escape the library.

use thiserror::Error;

/// Errors surfaced to callers of the client library.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A URI could not be decoded, or does not use the `file` scheme.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// The server transport did not become ready within the deadline.
    #[error("timed out waiting for the server connection")]
    ConnectionTimeout,

    /// A response did not arrive within the caller's deadline.
    #[error("timed out waiting for a response from the server")]
    ResponseTimeout,

    /// The connection was torn down before the response arrived.
    #[error("the request was aborted")]
    ResponseAborted,

    /// The server answered with a JSON-RPC error object.
    #[error("server reported error {code}: {message}")]
    ResponseFailed { code: i64, message: String },

    /// A send was attempted on a stopped connection.
    #[error("the connection has been stopped")]
    ConnectionStopped,
}

/// JSON-RPC and LSP error codes, with canonical reason strings.
pub mod rpc {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
    pub const UNKNOWN_ERROR_CODE: i64 = -32001;
    pub const REQUEST_CANCELLED: i64 = -32800;
    pub const CONTENT_MODIFIED: i64 = -32801;

    /// Registry of `(symbolic name, code, canonical reason)` triples.
    ///
    /// The reason strings are wire-visible: error responses built by the
    /// connection carry them verbatim.
    const REGISTRY: &[(&str, i64, &str)] = &[
        ("ParseError", PARSE_ERROR, "Parse error"),
        ("InvalidRequest", INVALID_REQUEST, "Invalid request"),
        ("MethodNotFound", METHOD_NOT_FOUND, "Method not found"),
        ("InvalidParams", INVALID_PARAMS, "Invalid parameters"),
        ("InternalError", INTERNAL_ERROR, "Internal error"),
        (
            "ServerNotInitialized",
            SERVER_NOT_INITIALIZED,
            "Server not initialized",
        ),
        ("UnknownErrorCode", UNKNOWN_ERROR_CODE, "Unknown error code"),
        ("RequestCancelled", REQUEST_CANCELLED, "Request cancelled"),
        ("ContentModified", CONTENT_MODIFIED, "Content modified"),
    ];

    /// Canonical reason string for a code, if the code is known.
    #[must_use]
    pub fn reason(code: i64) -> Option<&'static str> {
        REGISTRY
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(_, _, reason)| *reason)
    }

    /// Reverse lookup by symbolic name (e.g. `"MethodNotFound"`).
    #[must_use]
    pub fn by_name(name: &str) -> Option<(i64, &'static str)> {
        REGISTRY
            .iter()
            .find(|(n, _, _)| *n == name)
            .map(|(_, code, reason)| (*code, *reason))
    }
}

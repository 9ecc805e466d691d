//! JSON-RPC 2.0 frames.
//!
//! Negotiated when the server-advertised protocol version is high
//! enough. A bare `"ping"`/`"pong"` pair is exchanged outside the
//! JSON-RPC envelope as a lightweight keepalive.

use pulse_core::PulseError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// The protocol version field every frame carries.
pub const JSONRPC_VERSION: &str = "2.0";

/// Bare keepalive sent by the server.
pub const PING: &str = "ping";
/// Bare keepalive reply.
pub const PONG: &str = "pong";

/// Standard parse-error code.
pub const CODE_PARSE_ERROR: i32 = -32700;
/// Standard method-not-found code.
pub const CODE_METHOD_NOT_FOUND: i32 = -32601;
/// Standard internal-error code.
pub const CODE_INTERNAL_ERROR: i32 = -32603;

/// An outgoing or server-initiated call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Call parameters.
    #[serde(default)]
    pub params: Value,
    /// Correlation id; absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl JsonRpcRequest {
    /// Build a correlated request.
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }
}

/// A reply to a correlated call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Result payload (success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload (failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Correlation id of the request being answered.
    pub id: u64,
}

impl JsonRpcResponse {
    /// Build a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Build an error response.
    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    /// Build the structured reply for an unregistered method.
    pub fn method_not_found(id: u64, method: &str) -> Self {
        Self::error(id, CODE_METHOD_NOT_FOUND, format!("method not found: {method}"))
    }
}

/// Structured error inside a [`JsonRpcResponse`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Standard JSON-RPC error code.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One classified inbound frame.
#[derive(Clone, Debug)]
pub enum RpcFrame {
    /// A server-initiated call (has `method`).
    Request(JsonRpcRequest),
    /// A reply to one of our calls (has `id`, no `method`).
    Response(JsonRpcResponse),
}

/// Parse a raw message into frames.
///
/// Accepts either a single request/response object or a batch array.
/// Items that are neither are logged and skipped; a body that is not
/// JSON at all is a protocol error.
pub fn parse_frames(raw: &str) -> Result<Vec<RpcFrame>, PulseError> {
    let value: Value = serde_json::from_str(raw).map_err(|err| PulseError::Protocol {
        context: format!("invalid json-rpc body: {err}"),
    })?;
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    let mut frames = Vec::with_capacity(items.len());
    for item in items {
        if item.get("method").is_some() {
            match serde_json::from_value::<JsonRpcRequest>(item) {
                Ok(req) => frames.push(RpcFrame::Request(req)),
                Err(err) => warn!(%err, "dropping malformed json-rpc request"),
            }
        } else if item.get("id").is_some() {
            match serde_json::from_value::<JsonRpcResponse>(item) {
                Ok(resp) => frames.push(RpcFrame::Response(resp)),
                Err(err) => warn!(%err, "dropping malformed json-rpc response"),
            }
        } else {
            warn!("dropping unrecognized json-rpc frame");
        }
    }
    Ok(frames)
}

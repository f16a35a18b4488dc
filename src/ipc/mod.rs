//! Local control protocol
//!
//! Newline-delimited JSON-RPC 2.0 over a unix socket. The method set is
//! closed; anything else is `method not found`. Serialization appends a
//! newline; deserialization consumes exactly one frame per line.

mod client;
mod server;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use client::IpcClient;
pub use server::IpcServer;

/// JSON-RPC version string
pub const JSONRPC_VERSION: &str = "2.0";

/// IPC protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Error codes used on the IPC surface
pub mod codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i64 = -32700;
    /// The request object is not a valid JSON-RPC request
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method is not in the closed method set
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Process identifier not resolvable
    pub const PROCESS_NOT_FOUND: i64 = -32001;
    /// Name-unique violation on create
    pub const PROCESS_ALREADY_EXISTS: i64 = -32002;
    /// Operation requires a live container
    pub const PROCESS_NOT_RUNNING: i64 = -32003;
    /// Generic daemon failure
    pub const DAEMON_ERROR: i64 = -32010;
}

/// The closed method set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "daemon.status")]
    DaemonStatus,
    #[serde(rename = "daemon.shutdown")]
    DaemonShutdown,
    #[serde(rename = "daemon.reload")]
    DaemonReload,
    #[serde(rename = "process.start")]
    ProcessStart,
    #[serde(rename = "process.stop")]
    ProcessStop,
    #[serde(rename = "process.restart")]
    ProcessRestart,
    #[serde(rename = "process.delete")]
    ProcessDelete,
    #[serde(rename = "process.list")]
    ProcessList,
    #[serde(rename = "process.info")]
    ProcessInfo,
    #[serde(rename = "logs.get")]
    LogsGet,
    #[serde(rename = "metrics.get")]
    MetricsGet,
    #[serde(rename = "config.reload")]
    ConfigReload,
}

/// One request frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Error member of a response frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One response frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Build a request with a fresh id.
pub fn create_request(method: Method, params: Option<Value>) -> RpcRequest {
    RpcRequest {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id: Value::String(Uuid::new_v4().to_string()),
        method,
        params,
    }
}

/// Build a success response.
pub fn create_response(id: Value, result: Value) -> RpcResponse {
    RpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        result: Some(result),
        error: None,
    }
}

/// Build an error response.
pub fn create_error_response(id: Value, code: i64, message: impl Into<String>) -> RpcResponse {
    RpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        result: None,
        error: Some(RpcError {
            code,
            message: message.into(),
            data: None,
        }),
    }
}

/// Serialize a frame; the wire form always ends with a newline.
pub fn serialize<T: Serialize>(frame: &T) -> String {
    let mut raw = serde_json::to_string(frame).unwrap_or_default();
    raw.push('\n');
    raw
}

/// Parse one request frame. The error side carries the JSON-RPC code the
/// response must use.
pub fn deserialize_request(line: &str) -> Result<RpcRequest, RpcError> {
    // Parse structure first so a known shape with an unknown method maps to
    // method-not-found rather than a parse error
    #[derive(Deserialize)]
    struct RawRequest {
        jsonrpc: Option<String>,
        #[serde(default)]
        id: Value,
        method: Option<Value>,
        #[serde(default)]
        params: Option<Value>,
    }

    let raw: RawRequest = serde_json::from_str(line.trim()).map_err(|e| RpcError {
        code: codes::PARSE_ERROR,
        message: format!("Parse error: {}", e),
        data: None,
    })?;

    if raw.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
        return Err(RpcError {
            code: codes::INVALID_REQUEST,
            message: "Invalid request: missing jsonrpc 2.0".to_string(),
            data: None,
        });
    }

    let Some(method_value) = raw.method else {
        return Err(RpcError {
            code: codes::INVALID_REQUEST,
            message: "Invalid request: missing method".to_string(),
            data: None,
        });
    };

    let method: Method = serde_json::from_value(method_value.clone()).map_err(|_| RpcError {
        code: codes::METHOD_NOT_FOUND,
        message: format!(
            "Method not found: {}",
            method_value.as_str().unwrap_or("<non-string>")
        ),
        data: None,
    })?;

    Ok(RpcRequest {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id: raw.id,
        method,
        params: raw.params,
    })
}

//! Agent <-> controller wire protocol
//!
//! One JSON envelope per websocket text frame:
//! `{"type", "agentId", "timestamp", "data"}`. Payload shapes are typed per
//! message kind and serialized into the envelope's `data` field.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metrics::ProcessMetrics;

/// Close code sent when registration authentication fails
pub const AUTH_CLOSE_CODE: u16 = 4001;

/// Close reason paired with [`AUTH_CLOSE_CODE`]
pub const AUTH_CLOSE_REASON: &str = "Authentication failed";

/// Default controller dashboard port
pub const DEFAULT_CONTROLLER_PORT: u16 = 9615;

/// Default port agents dial
pub const DEFAULT_AGENT_PORT: u16 = 9616;

/// Message kinds carried on the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Register,
    Heartbeat,
    Metrics,
    Command,
    CommandResult,
    Disconnect,
}

/// One framed message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(rename = "agentId")]
    pub agent_id: String,

    /// ISO-8601 emission time
    pub timestamp: String,

    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: MessageType, agent_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            agent_id: agent_id.into(),
            timestamp: Utc::now().to_rfc3339(),
            data,
        }
    }

    /// Serialize into a text frame body.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a text frame body. Malformed frames yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Host facts reported on register and every heartbeat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub hostname: String,
    pub version: String,
    pub uptime_secs: u64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub process_count: usize,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// `register` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterData {
    pub server_info: ServerInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// `heartbeat` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    pub server_info: ServerInfo,
    #[serde(default)]
    pub processes: Vec<Value>,
}

/// `metrics` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsData {
    pub samples: Vec<ProcessMetrics>,
}

/// `command` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandData {
    pub command: String,
    #[serde(default)]
    pub params: Value,
    pub request_id: String,
}

/// `command-result` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultData {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Compare two tokens without early exit.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

//! Event bus for pub/sub messaging
//!
//! Typed topics with synchronous, subscription-ordered dispatch, plus a
//! wildcard tap that sees every emission as an envelope. An async bridge
//! re-broadcasts envelopes over a tokio channel for consumers that need to
//! `select!` on events (fleet agent, plugin host).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::logs::LogEntry;
use crate::metrics::{ProcessMetrics, SystemMetrics};

/// Topics carried by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ProcessStart,
    ProcessStop,
    ProcessRestart,
    ProcessExit,
    ProcessCrash,
    ProcessError,
    LogEntry,
    MetricProcess,
    SystemMetrics,
    HealthFail,
    HealthRestore,
    SystemShutdown,
    ConfigReload,
}

impl Topic {
    /// Wire name of the topic
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ProcessStart => "process:start",
            Topic::ProcessStop => "process:stop",
            Topic::ProcessRestart => "process:restart",
            Topic::ProcessExit => "process:exit",
            Topic::ProcessCrash => "process:crash",
            Topic::ProcessError => "process:error",
            Topic::LogEntry => "log:entry",
            Topic::MetricProcess => "metric:process",
            Topic::SystemMetrics => "system:metrics",
            Topic::HealthFail => "health:fail",
            Topic::HealthRestore => "health:restore",
            Topic::SystemShutdown => "system:shutdown",
            Topic::ConfigReload => "system:config-reload",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events published through the bus
#[derive(Debug, Clone)]
pub enum Event {
    /// A child process was spawned
    ProcessStart { id: i64, name: String, pid: u32 },

    /// A child process was stopped on request
    ProcessStop { id: i64, name: String, forced: bool },

    /// A child process was restarted
    ProcessRestart { id: i64, name: String, restarts: u32 },

    /// A child process exited cleanly
    ProcessExit { id: i64, name: String, code: i32 },

    /// A child process exited abnormally
    ProcessCrash {
        id: i64,
        name: String,
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// A supervisor operation failed for a process
    ProcessError { id: i64, name: String, message: String },

    /// A log line was captured from a child stream
    LogEntry(LogEntry),

    /// A per-process metrics sample
    MetricProcess(ProcessMetrics),

    /// A host-wide metrics snapshot
    SystemMetrics(SystemMetrics),

    /// Health probes crossed the failure threshold
    HealthFail { id: i64, name: String, failures: u32 },

    /// Health probes recovered after a failure
    HealthRestore { id: i64, name: String },

    /// The daemon is shutting down
    SystemShutdown,

    /// Runtime configuration was reloaded
    ConfigReload,
}

impl Event {
    /// The topic this event is delivered on
    pub fn topic(&self) -> Topic {
        match self {
            Event::ProcessStart { .. } => Topic::ProcessStart,
            Event::ProcessStop { .. } => Topic::ProcessStop,
            Event::ProcessRestart { .. } => Topic::ProcessRestart,
            Event::ProcessExit { .. } => Topic::ProcessExit,
            Event::ProcessCrash { .. } => Topic::ProcessCrash,
            Event::ProcessError { .. } => Topic::ProcessError,
            Event::LogEntry(_) => Topic::LogEntry,
            Event::MetricProcess(_) => Topic::MetricProcess,
            Event::SystemMetrics(_) => Topic::SystemMetrics,
            Event::HealthFail { .. } => Topic::HealthFail,
            Event::HealthRestore { .. } => Topic::HealthRestore,
            Event::SystemShutdown => Topic::SystemShutdown,
            Event::ConfigReload => Topic::ConfigReload,
        }
    }

    /// JSON payload carried in wildcard envelopes
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Event::ProcessStart { id, name, pid } => {
                json!({ "processId": id, "processName": name, "pid": pid })
            }
            Event::ProcessStop { id, name, forced } => {
                json!({ "processId": id, "processName": name, "force": forced })
            }
            Event::ProcessRestart { id, name, restarts } => {
                json!({ "processId": id, "processName": name, "restarts": restarts })
            }
            Event::ProcessExit { id, name, code } => {
                json!({ "processId": id, "processName": name, "exitCode": code })
            }
            Event::ProcessCrash {
                id,
                name,
                code,
                signal,
            } => json!({
                "processId": id,
                "processName": name,
                "exitCode": code,
                "signal": signal,
            }),
            Event::ProcessError { id, name, message } => {
                json!({ "processId": id, "processName": name, "message": message })
            }
            Event::LogEntry(entry) => serde_json::to_value(entry).unwrap_or_default(),
            Event::MetricProcess(sample) => serde_json::to_value(sample).unwrap_or_default(),
            Event::SystemMetrics(snapshot) => serde_json::to_value(snapshot).unwrap_or_default(),
            Event::HealthFail { id, name, failures } => {
                json!({ "processId": id, "processName": name, "failures": failures })
            }
            Event::HealthRestore { id, name } => {
                json!({ "processId": id, "processName": name })
            }
            Event::SystemShutdown | Event::ConfigReload => json!({}),
        }
    }
}

/// Envelope delivered to wildcard taps
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique emission id
    pub id: Uuid,

    /// Topic wire name
    #[serde(rename = "type")]
    pub event_type: String,

    /// Emitting component
    pub source: String,

    /// Emission time
    pub timestamp: DateTime<Utc>,

    /// Event payload
    pub data: serde_json::Value,
}

type Handler = Box<dyn Fn(&Event) + Send + Sync>;
type TapHandler = Box<dyn Fn(&EventEnvelope) + Send + Sync>;

struct BusInner {
    subscribers: RwLock<HashMap<Topic, Vec<Handler>>>,
    taps: RwLock<Vec<TapHandler>>,
    // One emission is fully delivered before the next begins
    emit_lock: Mutex<()>,
    bridge: broadcast::Sender<EventEnvelope>,
}

/// Event bus with typed topics and a wildcard tap
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a new event bus with default bridge capacity (4096 envelopes)
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    /// Create a new event bus with custom async-bridge capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (bridge, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                taps: RwLock::new(Vec::new()),
                emit_lock: Mutex::new(()),
                bridge,
            }),
        }
    }

    /// Subscribe a handler to a topic. Handlers run synchronously in
    /// subscription order.
    pub fn on<F>(&self, topic: Topic, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner
            .subscribers
            .write()
            .entry(topic)
            .or_default()
            .push(Box::new(handler));
    }

    /// Register a wildcard tap receiving every emission as an envelope.
    pub fn tap<F>(&self, handler: F)
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        self.inner.taps.write().push(Box::new(handler));
    }

    /// Async view of the wildcard tap. Receivers that fall behind lose
    /// envelopes (lagged).
    pub fn watch_all(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.bridge.subscribe()
    }

    /// Publish an event. Topic subscribers are invoked first, then wildcard
    /// taps, then the async bridge.
    pub fn emit(&self, source: &str, event: Event) {
        let _guard = self.inner.emit_lock.lock();

        let envelope = EventEnvelope {
            id: Uuid::new_v4(),
            event_type: event.topic().as_str().to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
            data: event.payload(),
        };

        {
            let subscribers = self.inner.subscribers.read();
            if let Some(handlers) = subscribers.get(&event.topic()) {
                for handler in handlers {
                    handler(&event);
                }
            }
        }

        {
            let taps = self.inner.taps.read();
            for tap in taps.iter() {
                tap(&envelope);
            }
        }

        // Ignore send errors (no receivers)
        let _ = self.inner.bridge.send(envelope);
    }

    /// Number of handlers registered for a topic
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .subscribers
            .read()
            .get(&topic)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

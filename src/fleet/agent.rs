//! Fleet agent
//!
//! Dials the controller, registers, heartbeats on a fixed cadence, answers
//! commands through registered handlers, and buffers metric samples for
//! batched pushes. Unexpected closes trigger a bounded reconnect loop;
//! explicit `stop()` never reconnects.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::ProcessMetrics;

use super::discovery::Endpoint;
use super::protocol::{
    CommandData, CommandResultData, Envelope, HeartbeatData, MessageType, MetricsData,
    RegisterData, ServerInfo,
};

/// Buffered samples that force a flush
const METRICS_FLUSH_THRESHOLD: usize = 100;

/// Events observed on the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    Connected,
    Disconnected,
    ReconnectFailed,
    Stopped,
}

/// Handler invoked for an incoming command
pub type CommandHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Source of the facts reported on register and heartbeat
pub type InfoSource = Arc<dyn Fn() -> (ServerInfo, Vec<Value>) + Send + Sync>;

/// Agent connection settings
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub endpoint: Endpoint,
    pub token: Option<String>,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

/// Fleet agent
pub struct Agent {
    config: AgentConfig,
    info: InfoSource,
    handlers: DashMap<String, CommandHandler>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    stopping: AtomicBool,
    reconnects: AtomicU64,
    metrics_buffer: Mutex<Vec<ProcessMetrics>>,
    events: broadcast::Sender<AgentEvent>,
    shutdown: CancellationToken,
    weak: std::sync::Weak<Agent>,
}

impl Agent {
    pub fn new(config: AgentConfig, info: InfoSource, shutdown: CancellationToken) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|weak| Self {
            config,
            info,
            handlers: DashMap::new(),
            outbound: Mutex::new(None),
            connected: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            metrics_buffer: Mutex::new(Vec::new()),
            events,
            shutdown,
            weak: weak.clone(),
        })
    }

    /// Subscribe to agent lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Register a command handler by name. Replaces any prior handler.
    pub fn on_command<F>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    /// Start the connection manager.
    pub fn start(&self) {
        let Some(agent) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            agent.connection_loop().await;
        });
    }

    /// Send the disconnect frame, close the socket, and emit `Stopped`.
    /// A no-op when not connected (any in-flight reconnect loop still
    /// stops).
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.is_connected() {
            return;
        }

        self.send_envelope(MessageType::Disconnect, Value::Null);
        // Give the frame a moment to drain
        tokio::time::sleep(Duration::from_millis(100)).await;

        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send(Message::Close(None));
        }

        let _ = self.events.send(AgentEvent::Stopped);
    }

    /// Buffer a metric sample; auto-flushes at the threshold.
    pub fn push_metric(&self, sample: ProcessMetrics) {
        let should_flush = {
            let mut buffer = self.metrics_buffer.lock();
            buffer.push(sample);
            buffer.len() >= METRICS_FLUSH_THRESHOLD
        };
        if should_flush {
            self.flush_metrics();
        }
    }

    /// Send the buffered batch. Flushing while disconnected drops silently.
    pub fn flush_metrics(&self) {
        let batch: Vec<ProcessMetrics> = std::mem::take(&mut *self.metrics_buffer.lock());
        if batch.is_empty() {
            return;
        }
        if !self.is_connected() {
            return;
        }

        let data = serde_json::to_value(MetricsData { samples: batch }).unwrap_or_default();
        self.send_envelope(MessageType::Metrics, data);
    }

    /// Buffered sample count (test hook)
    pub fn buffered_metrics(&self) -> usize {
        self.metrics_buffer.lock().len()
    }

    // ========================================================================
    // Connection management
    // ========================================================================

    async fn connection_loop(self: Arc<Self>) {
        let url = self.config.endpoint.websocket_url();

        loop {
            if self.stopping.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
                return;
            }

            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    self.run_connection(ws).await;
                    if self.stopping.load(Ordering::SeqCst) {
                        return;
                    }
                    let _ = self.events.send(AgentEvent::Disconnected);
                }
                Err(e) => {
                    debug!("Dial of {} failed: {}", url, e);
                }
            }

            // Bounded reconnect, never after explicit stop
            let attempts = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
            if attempts > self.config.max_reconnect_attempts as u64 {
                warn!(
                    "Giving up on {} after {} reconnect attempts",
                    url,
                    attempts - 1
                );
                let _ = self.events.send(AgentEvent::ReconnectFailed);
                return;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
    }

    async fn run_connection(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        *self.outbound.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);

        // Writer task
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() {
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Register immediately on open
        let (server_info, _) = (self.info)();
        let register = RegisterData {
            server_info,
            token: self.config.token.clone(),
        };
        self.send_envelope(
            MessageType::Register,
            serde_json::to_value(register).unwrap_or_default(),
        );

        info!("Connected to controller at {}", self.config.endpoint.websocket_url());
        let _ = self.events.send(AgentEvent::Connected);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await; // first heartbeat after one interval

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = heartbeat.tick() => {
                    self.send_heartbeat();
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(envelope) = Envelope::parse(&text) {
                                self.handle_envelope(envelope);
                            }
                            // Malformed inbound frames are ignored
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Some(tx) = self.outbound.lock().as_ref() {
                                let _ = tx.send(Message::Pong(data));
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("Read error: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        *self.outbound.lock() = None;
        writer.abort();
    }

    fn handle_envelope(&self, envelope: Envelope) {
        if envelope.kind != MessageType::Command {
            return;
        }

        let Ok(command) = serde_json::from_value::<CommandData>(envelope.data) else {
            return;
        };

        let handler = self.handlers.get(&command.command).map(|h| h.value().clone());
        let Some(agent) = self.weak.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            let outcome = match handler {
                Some(handler) => handler(command.params).await,
                None => Err(format!("Unknown command {}", command.command)),
            };

            let result = match outcome {
                Ok(value) => CommandResultData {
                    request_id: command.request_id,
                    success: true,
                    result: Some(value),
                    error: None,
                },
                Err(message) => CommandResultData {
                    request_id: command.request_id,
                    success: false,
                    result: None,
                    error: Some(message),
                },
            };

            agent.send_envelope(
                MessageType::CommandResult,
                serde_json::to_value(result).unwrap_or_default(),
            );
        });
    }

    fn send_heartbeat(&self) {
        if !self.is_connected() {
            return;
        }
        let (server_info, processes) = (self.info)();
        let data = HeartbeatData {
            server_info,
            processes,
        };
        self.send_envelope(
            MessageType::Heartbeat,
            serde_json::to_value(data).unwrap_or_default(),
        );
    }

    /// Queue an envelope for the writer. Sends while the socket is not open
    /// are dropped.
    fn send_envelope(&self, kind: MessageType, data: Value) {
        let envelope = Envelope::new(kind, self.config.agent_id.clone(), data);
        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send(Message::Text(envelope.to_json()));
        }
    }
}

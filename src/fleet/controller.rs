//! Fleet controller
//!
//! Accepts one persistent websocket connection per agent, maintains the
//! connected-agent table, and correlates request/response commands by
//! requestId through a map of pending resolvers. Pending commands are
//! rejected on timeout and drained with an explicit reason on shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ControllerConfiguration;
use crate::error::{DaemonError, DaemonResult};
use crate::metrics::ProcessMetrics;

use super::protocol::{
    constant_time_eq, CommandData, CommandResultData, Envelope, HeartbeatData, MessageType,
    RegisterData, AUTH_CLOSE_CODE, AUTH_CLOSE_REASON,
};

/// Default deadline for a remote command round-trip
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Reason used when shutdown drains the pending-command map
const SHUTDOWN_REASON: &str = "Controller shutting down";

/// Agent liveness from the controller's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

/// Controller-side record of one connected agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedAgent {
    pub agent_id: String,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub process_count: usize,
    pub uptime_secs: u64,
    pub version: String,
    pub metadata: HashMap<String, String>,
    /// Latest snapshot of the agent's processes
    pub processes: Vec<Value>,
}

/// Events observed on the controller
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    AgentJoin { agent_id: String },
    AgentLeave { agent_id: String },
    AgentHeartbeat { agent_id: String },
    AgentMetrics {
        agent_id: String,
        samples: Vec<ProcessMetrics>,
    },
}

struct AgentHandle {
    info: RwLock<ConnectedAgent>,
    tx: mpsc::UnboundedSender<Message>,
}

/// Transport surface the deployment orchestrator drives
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn send_command(
        &self,
        agent_id: &str,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> DaemonResult<Value>;
}

/// Fleet controller
pub struct Controller {
    config: ControllerConfiguration,
    agents: DashMap<String, Arc<AgentHandle>>,
    pending: DashMap<String, oneshot::Sender<Result<Value, String>>>,
    events: broadcast::Sender<ControllerEvent>,
    shutdown: CancellationToken,
    weak: std::sync::Weak<Controller>,
}

impl Controller {
    pub fn new(config: ControllerConfiguration, shutdown: CancellationToken) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new_cyclic(|weak| Self {
            config,
            agents: DashMap::new(),
            pending: DashMap::new(),
            events,
            shutdown,
            weak: weak.clone(),
        })
    }

    /// Bind the listener and start accepting agent connections. Returns the
    /// bound address (useful when the configured port is 0).
    pub async fn start(&self) -> DaemonResult<SocketAddr> {
        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        info!("Controller listening on {}", addr);

        let Some(controller) = self.weak.upgrade() else {
            return Err(DaemonError::Internal("controller dropped".into()));
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = controller.shutdown.cancelled() => {
                        debug!("Controller accept loop stopped");
                        return;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let controller = Arc::clone(&controller);
                                tokio::spawn(async move {
                                    controller.handle_connection(stream, peer).await;
                                });
                            }
                            Err(e) => {
                                warn!("Accept failed: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(addr)
    }

    /// Subscribe to controller events.
    pub fn events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Snapshot of every connected agent.
    pub fn agents(&self) -> Vec<ConnectedAgent> {
        self.agents
            .iter()
            .map(|entry| entry.value().info.read().clone())
            .collect()
    }

    /// Snapshot of one agent.
    pub fn agent(&self, agent_id: &str) -> Option<ConnectedAgent> {
        self.agents
            .get(agent_id)
            .map(|entry| entry.value().info.read().clone())
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Send a command to one agent and await its result.
    pub async fn send_command(
        &self,
        agent_id: &str,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> DaemonResult<Value> {
        let handle = self
            .agents
            .get(agent_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DaemonError::AgentNotFound(agent_id.to_string()))?;

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let data = serde_json::to_value(CommandData {
            command: command.to_string(),
            params,
            request_id: request_id.clone(),
        })
        .unwrap_or_default();

        let envelope = Envelope::new(MessageType::Command, agent_id, data);
        if handle
            .tx
            .send(Message::Text(envelope.to_json()))
            .is_err()
        {
            self.pending.remove(&request_id);
            return Err(DaemonError::Transport(format!(
                "Agent {} connection closed",
                agent_id
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(DaemonError::Internal(message)),
            Ok(Err(_)) => Err(DaemonError::Transport(format!(
                "Agent {} connection closed",
                agent_id
            ))),
            Err(_) => {
                // Remove the resolver before rejecting so a late result
                // cannot be delivered
                self.pending.remove(&request_id);
                Err(DaemonError::Timeout)
            }
        }
    }

    /// Fan a command out to every connected agent.
    pub async fn broadcast_command(
        &self,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> HashMap<String, DaemonResult<Value>> {
        let agent_ids: Vec<String> =
            self.agents.iter().map(|entry| entry.key().clone()).collect();

        let mut results = HashMap::with_capacity(agent_ids.len());
        let futures = agent_ids.iter().map(|agent_id| {
            let params = params.clone();
            async move {
                (
                    agent_id.clone(),
                    self.send_command(agent_id, command, params, timeout).await,
                )
            }
        });

        for (agent_id, result) in futures_util::future::join_all(futures).await {
            results.insert(agent_id, result);
        }
        results
    }

    /// Close every agent connection and drain pending commands.
    pub async fn stop(&self) {
        info!("Controller stopping; {} agents connected", self.agents.len());

        let pending: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for request_id in pending {
            if let Some((_, tx)) = self.pending.remove(&request_id) {
                let _ = tx.send(Err(SHUTDOWN_REASON.to_string()));
            }
        }

        for entry in self.agents.iter() {
            let _ = entry.value().tx.send(Message::Close(None));
        }
        self.agents.clear();
        self.shutdown.cancel();
    }

    // ========================================================================
    // Connection handling
    // ========================================================================

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("Handshake with {} failed: {}", peer, e);
                return;
            }
        };

        let (mut sink, mut stream) = ws.split();

        // The first frame must be a register envelope
        let register = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match Envelope::parse(&text) {
                    Some(envelope) if envelope.kind == MessageType::Register => break envelope,
                    Some(_) | None => {
                        debug!("Expected register from {}, dropping connection", peer);
                        return;
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return,
            }
        };

        if !self.authenticate(&register) {
            warn!("Authentication failed for {} ({})", register.agent_id, peer);
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::from(AUTH_CLOSE_CODE),
                    reason: AUTH_CLOSE_REASON.into(),
                })))
                .await;
            return;
        }

        let agent_id = register.agent_id.clone();
        let register_data: RegisterData = serde_json::from_value(register.data.clone())
            .unwrap_or(RegisterData {
                server_info: Default::default(),
                token: None,
            });

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let info = ConnectedAgent {
            agent_id: agent_id.clone(),
            hostname: register_data.server_info.hostname.clone(),
            address: peer.ip().to_string(),
            port: peer.port(),
            status: AgentStatus::Online,
            last_heartbeat: Utc::now(),
            cpu_usage: register_data.server_info.cpu_usage,
            memory_usage: register_data.server_info.memory_usage,
            process_count: register_data.server_info.process_count,
            uptime_secs: register_data.server_info.uptime_secs,
            version: register_data.server_info.version.clone(),
            metadata: register_data.server_info.metadata.clone(),
            processes: Vec::new(),
        };

        let handle = Arc::new(AgentHandle {
            info: RwLock::new(info),
            tx,
        });
        self.agents.insert(agent_id.clone(), handle.clone());

        info!("Agent {} joined from {}", agent_id, peer);
        let _ = self.events.send(ControllerEvent::AgentJoin {
            agent_id: agent_id.clone(),
        });

        // Writer: drain the outbound queue into the socket
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

        // Reader: process frames until the transport closes
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(envelope) = Envelope::parse(&text) {
                                if !self.handle_frame(&agent_id, &handle, envelope) {
                                    break;
                                }
                            }
                            // Malformed frames are ignored
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = handle.tx.send(Message::Pong(data));
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("Read error from {}: {}", agent_id, e);
                            break;
                        }
                    }
                }
            }
        }

        writer.abort();
        self.drop_agent(&agent_id, &handle);
    }

    fn authenticate(&self, register: &Envelope) -> bool {
        if self.config.auth_tokens.is_empty() {
            return true;
        }

        let Some(presented) = register.data.get("token").and_then(Value::as_str) else {
            return false;
        };

        self.config
            .auth_tokens
            .iter()
            .any(|allowed| constant_time_eq(allowed, presented))
    }

    /// Returns false when the connection should close.
    fn handle_frame(&self, agent_id: &str, handle: &Arc<AgentHandle>, envelope: Envelope) -> bool {
        match envelope.kind {
            MessageType::Heartbeat => {
                let Ok(data) = serde_json::from_value::<HeartbeatData>(envelope.data) else {
                    return true;
                };
                {
                    let mut info = handle.info.write();
                    info.last_heartbeat = Utc::now();
                    info.hostname = data.server_info.hostname;
                    info.cpu_usage = data.server_info.cpu_usage;
                    info.memory_usage = data.server_info.memory_usage;
                    info.process_count = data.server_info.process_count;
                    info.uptime_secs = data.server_info.uptime_secs;
                    info.version = data.server_info.version;
                    info.processes = data.processes;
                }
                let _ = self.events.send(ControllerEvent::AgentHeartbeat {
                    agent_id: agent_id.to_string(),
                });
                true
            }
            MessageType::Metrics => {
                let samples = serde_json::from_value::<super::protocol::MetricsData>(envelope.data)
                    .map(|d| d.samples)
                    .unwrap_or_default();
                let _ = self.events.send(ControllerEvent::AgentMetrics {
                    agent_id: agent_id.to_string(),
                    samples,
                });
                true
            }
            MessageType::CommandResult => {
                if let Ok(result) = serde_json::from_value::<CommandResultData>(envelope.data) {
                    self.resolve_command(result);
                }
                true
            }
            MessageType::Disconnect => {
                debug!("Agent {} sent disconnect", agent_id);
                false
            }
            MessageType::Register | MessageType::Command => true,
        }
    }

    fn resolve_command(&self, result: CommandResultData) {
        let Some((_, tx)) = self.pending.remove(&result.request_id) else {
            debug!("Late command result for {}", result.request_id);
            return;
        };

        let outcome = if result.success {
            Ok(result.result.unwrap_or(Value::Null))
        } else {
            Err(result
                .error
                .unwrap_or_else(|| "Command failed".to_string()))
        };
        let _ = tx.send(outcome);
    }

    fn drop_agent(&self, agent_id: &str, handle: &Arc<AgentHandle>) {
        // Only remove the entry if it still belongs to this connection
        let removed = match self.agents.get(agent_id) {
            Some(entry) if Arc::ptr_eq(entry.value(), handle) => {
                drop(entry);
                self.agents.remove(agent_id).is_some()
            }
            _ => false,
        };

        if removed {
            handle.info.write().status = AgentStatus::Offline;
            info!("Agent {} left", agent_id);
            let _ = self.events.send(ControllerEvent::AgentLeave {
                agent_id: agent_id.to_string(),
            });
        }
    }
}

#[async_trait]
impl CommandTransport for Controller {
    async fn send_command(
        &self,
        agent_id: &str,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> DaemonResult<Value> {
        Controller::send_command(self, agent_id, command, params, timeout).await
    }
}

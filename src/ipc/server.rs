//! IPC server
//!
//! Serves the JSON-RPC protocol on a unix socket. Each connection is framed
//! by lines; every request produces exactly one response. Supervisor errors
//! are mapped onto the domain error codes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::events::{Event, EventBus};
use crate::logs::{LogAggregator, DEFAULT_RECENT};
use crate::metrics::MetricsCollector;
use crate::process::ProcessConfig;
use crate::supervisor::{ProcessSelector, Supervisor};

use super::{
    codes, create_error_response, create_response, deserialize_request, Method, RpcRequest,
    RpcResponse, PROTOCOL_VERSION,
};

/// IPC server state
pub struct IpcServer {
    supervisor: Arc<Supervisor>,
    aggregator: Arc<LogAggregator>,
    collector: Arc<MetricsCollector>,
    bus: EventBus,
    socket_path: PathBuf,
    started_at: Instant,
    shutdown: CancellationToken,
    weak: std::sync::Weak<IpcServer>,
}

impl IpcServer {
    pub fn new(
        supervisor: Arc<Supervisor>,
        aggregator: Arc<LogAggregator>,
        collector: Arc<MetricsCollector>,
        bus: EventBus,
        socket_path: PathBuf,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            supervisor,
            aggregator,
            collector,
            bus,
            socket_path,
            started_at: Instant::now(),
            shutdown,
            weak: weak.clone(),
        })
    }

    /// Bind the socket and serve until shutdown.
    pub async fn start(&self) -> DaemonResult<()> {
        // A daemon that died uncleanly leaves the socket file behind
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("IPC listening on {}", self.socket_path.display());

        let Some(server) = self.weak.upgrade() else {
            return Ok(());
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server.shutdown.cancelled() => {
                        debug!("IPC server stopped");
                        let _ = std::fs::remove_file(&server.socket_path);
                        return;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let server = Arc::clone(&server);
                                tokio::spawn(async move {
                                    server.serve_connection(stream).await;
                                });
                            }
                            Err(e) => warn!("IPC accept failed: {}", e),
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn serve_connection(self: Arc<Self>, stream: UnixStream) {
        let mut framed = Framed::new(stream, LinesCodec::new());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                line = framed.next() => {
                    let Some(Ok(line)) = line else { return };
                    let response = self.handle_line(&line).await;
                    let raw = serde_json::to_string(&response).unwrap_or_default();
                    if framed.send(raw).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Process one frame into one response.
    pub async fn handle_line(&self, line: &str) -> RpcResponse {
        let request = match deserialize_request(line) {
            Ok(request) => request,
            Err(error) => {
                return RpcResponse {
                    jsonrpc: super::JSONRPC_VERSION.to_string(),
                    id: Value::Null,
                    result: None,
                    error: Some(error),
                }
            }
        };

        let id = request.id.clone();
        match self.dispatch(&request).await {
            Ok(result) => create_response(id, result),
            Err(e) => create_error_response(id, e.rpc_code(), e.to_string()),
        }
    }

    async fn dispatch(&self, request: &RpcRequest) -> DaemonResult<Value> {
        match request.method {
            Method::DaemonStatus => self.daemon_status().await,
            Method::DaemonShutdown => {
                self.bus.emit("ipc", Event::SystemShutdown);
                self.shutdown.cancel();
                Ok(json!({ "stopping": true }))
            }
            Method::DaemonReload | Method::ConfigReload => {
                self.bus.emit("ipc", Event::ConfigReload);
                Ok(json!({ "reloaded": true }))
            }
            Method::ProcessStart => self.process_start(request.params.as_ref()).await,
            Method::ProcessStop => self.process_stop(request.params.as_ref()).await,
            Method::ProcessRestart => {
                let selector = selector_param(request.params.as_ref())?;
                let info = self.supervisor.restart(&selector).await?;
                Ok(serde_json::to_value(info).unwrap_or_default())
            }
            Method::ProcessDelete => {
                let selector = selector_param(request.params.as_ref())?;
                let id = self.supervisor.resolve(&selector).await?.id;
                self.supervisor.delete(&selector).await?;
                self.collector.forget(id);
                Ok(json!({ "deleted": true }))
            }
            Method::ProcessList => {
                let list = self.supervisor.list().await?;
                Ok(serde_json::to_value(list).unwrap_or_default())
            }
            Method::ProcessInfo => {
                let selector = selector_param(request.params.as_ref())?;
                let info = self.supervisor.info(&selector).await?;
                Ok(serde_json::to_value(info).unwrap_or_default())
            }
            Method::LogsGet => self.logs_get(request.params.as_ref()).await,
            Method::MetricsGet => self.metrics_get(request.params.as_ref()).await,
        }
    }

    async fn daemon_status(&self) -> DaemonResult<Value> {
        let list = self.supervisor.list().await?;
        let online = list
            .iter()
            .filter(|p| p.status == crate::process::ProcessStatus::Online)
            .count();

        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "protocolVersion": PROTOCOL_VERSION,
            "uptimeSecs": self.started_at.elapsed().as_secs(),
            "processes": { "total": list.len(), "online": online },
        }))
    }

    async fn process_start(&self, params: Option<&Value>) -> DaemonResult<Value> {
        let params = params.ok_or_else(|| invalid_params("params required"))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_params("name required"))?;
        let config: ProcessConfig = serde_json::from_value(
            params.get("config").cloned().unwrap_or(json!({})),
        )
        .map_err(|e| invalid_params(format!("invalid config: {}", e)))?;

        let info = self.supervisor.start(name, config).await?;
        Ok(serde_json::to_value(info).unwrap_or_default())
    }

    async fn process_stop(&self, params: Option<&Value>) -> DaemonResult<Value> {
        let selector = selector_param(params)?;
        let force = params
            .and_then(|p| p.get("force"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.supervisor.stop(&selector, force).await?;
        Ok(json!({ "stopped": true }))
    }

    async fn logs_get(&self, params: Option<&Value>) -> DaemonResult<Value> {
        let lines = params
            .and_then(|p| p.get("lines"))
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_RECENT as u64) as usize;

        let entries = match params.and_then(|p| p.get("process")) {
            Some(value) => {
                let selector = selector_value(value)?;
                let row = self.supervisor.resolve(&selector).await?;
                self.aggregator.recent_logs(row.id, lines)
            }
            None => self.aggregator.all_recent_logs(lines),
        };

        Ok(serde_json::to_value(entries).unwrap_or_default())
    }

    async fn metrics_get(&self, params: Option<&Value>) -> DaemonResult<Value> {
        match params.and_then(|p| p.get("process")) {
            Some(value) => {
                let selector = selector_value(value)?;
                let row = self.supervisor.resolve(&selector).await?;
                Ok(serde_json::to_value(self.collector.latest(row.id)).unwrap_or_default())
            }
            None => Ok(serde_json::to_value(self.collector.all_latest()).unwrap_or_default()),
        }
    }
}

fn invalid_params(message: impl Into<String>) -> DaemonError {
    DaemonError::Protocol(message.into())
}

fn selector_param(params: Option<&Value>) -> DaemonResult<ProcessSelector> {
    let value = params
        .and_then(|p| p.get("process"))
        .ok_or_else(|| invalid_params("process required"))?;
    selector_value(value)
}

fn selector_value(value: &Value) -> DaemonResult<ProcessSelector> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(ProcessSelector::Id)
            .ok_or_else(|| invalid_params("process id must be an integer")),
        Value::String(s) => Ok(ProcessSelector::Name(s.clone())),
        _ => Err(invalid_params("process must be an id or a name")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfiguration;
    use crate::database::Database;
    use crate::metrics::DEFAULT_INTERVAL;

    fn server() -> (Arc<IpcServer>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = EventBus::new();
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor::new(db.clone(), bus.clone(), shutdown.child_token());
        let aggregator = Arc::new(LogAggregator::new(
            dir.path().join("logs"),
            LogConfiguration::default(),
            bus.clone(),
        ));
        supervisor.set_log_aggregator(aggregator.clone());
        let collector = MetricsCollector::new(
            supervisor.clone(),
            db,
            bus.clone(),
            DEFAULT_INTERVAL,
        );

        let server = IpcServer::new(
            supervisor,
            aggregator,
            collector,
            bus,
            dir.path().join("daemon.sock"),
            shutdown,
        );
        (server, dir)
    }

    fn request_line(method: &str, params: Value) -> String {
        json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params }).to_string()
    }

    #[tokio::test]
    async fn test_parse_error_response() {
        let (server, _dir) = server();
        let response = server.handle_line("{garbage").await;
        assert_eq!(response.error.unwrap().code, codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_method_not_found_response() {
        let (server, _dir) = server();
        let response = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"daemon.fly"}"#)
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, codes::METHOD_NOT_FOUND);
        assert!(error.message.contains("daemon.fly"));
    }

    #[tokio::test]
    async fn test_start_list_stop_cycle() {
        let (server, _dir) = server();

        let response = server
            .handle_line(&request_line(
                "process.start",
                json!({
                    "name": "app",
                    "config": {
                        "script": "sleep 30",
                        "interpreter": "sh",
                        "interpreter_args": ["-c"],
                        "autorestart": false
                    }
                }),
            ))
            .await;
        assert!(response.error.is_none(), "{:?}", response.error);
        let started = response.result.unwrap();
        assert_eq!(started["name"], "app");
        assert_eq!(started["status"], "online");

        let response = server
            .handle_line(&request_line("process.list", json!({})))
            .await;
        let list = response.result.unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);

        let response = server
            .handle_line(&request_line("process.stop", json!({ "process": "app" })))
            .await;
        assert!(response.error.is_none());

        let response = server
            .handle_line(&request_line("process.info", json!({ "process": "app" })))
            .await;
        assert_eq!(response.result.unwrap()["status"], "stopped");
    }

    #[tokio::test]
    async fn test_domain_error_codes() {
        let (server, _dir) = server();

        // Unknown process
        let response = server
            .handle_line(&request_line("process.info", json!({ "process": "ghost" })))
            .await;
        assert_eq!(response.error.unwrap().code, codes::PROCESS_NOT_FOUND);

        // Stop a stopped process
        server
            .handle_line(&request_line(
                "process.start",
                json!({
                    "name": "app",
                    "config": {
                        "script": "sleep 30",
                        "interpreter": "sh",
                        "interpreter_args": ["-c"],
                        "autorestart": false
                    }
                }),
            ))
            .await;
        server
            .handle_line(&request_line("process.stop", json!({ "process": "app" })))
            .await;
        let response = server
            .handle_line(&request_line("process.stop", json!({ "process": "app" })))
            .await;
        assert_eq!(response.error.unwrap().code, codes::PROCESS_NOT_RUNNING);

        // Double start
        server
            .handle_line(&request_line(
                "process.start",
                json!({
                    "name": "app",
                    "config": {
                        "script": "sleep 30",
                        "interpreter": "sh",
                        "interpreter_args": ["-c"],
                        "autorestart": false
                    }
                }),
            ))
            .await;
        let response = server
            .handle_line(&request_line(
                "process.start",
                json!({
                    "name": "app",
                    "config": {
                        "script": "sleep 30",
                        "interpreter": "sh",
                        "interpreter_args": ["-c"],
                        "autorestart": false
                    }
                }),
            ))
            .await;
        assert_eq!(response.error.unwrap().code, codes::PROCESS_ALREADY_EXISTS);
    }

    #[tokio::test]
    async fn test_invalid_params_code() {
        let (server, _dir) = server();
        let response = server
            .handle_line(&request_line("process.stop", json!({})))
            .await;
        assert_eq!(response.error.unwrap().code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_daemon_status() {
        let (server, _dir) = server();
        let response = server
            .handle_line(&request_line("daemon.status", json!({})))
            .await;
        let status = response.result.unwrap();
        assert_eq!(status["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(status["processes"]["total"], 0);
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let (server, dir) = server();
        server.start().await.unwrap();

        let stream = UnixStream::connect(dir.path().join("daemon.sock"))
            .await
            .unwrap();
        let mut framed = Framed::new(stream, LinesCodec::new());

        framed
            .send(request_line("daemon.status", json!({})))
            .await
            .unwrap();
        let line = framed.next().await.unwrap().unwrap();
        let response: RpcResponse = serde_json::from_str(&line).unwrap();
        assert!(response.result.is_some());
    }
}

//! IPC client
//!
//! The caller half of the local control protocol: one request frame out,
//! one response frame back. Domain error codes map back onto the daemon
//! error taxonomy so callers see the same errors the supervisor raised.

use std::path::Path;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::{DaemonError, DaemonResult};

use super::{codes, create_request, Method, RpcResponse};

/// Client for the daemon's unix control socket
#[derive(Debug)]
pub struct IpcClient {
    framed: Framed<UnixStream, LinesCodec>,
}

impl IpcClient {
    /// Connect to a running daemon's socket.
    pub async fn connect(path: impl AsRef<Path>) -> DaemonResult<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new()),
        })
    }

    /// Issue one request and await its response.
    pub async fn call(&mut self, method: Method, params: Option<Value>) -> DaemonResult<Value> {
        let request = create_request(method, params);
        let raw = serde_json::to_string(&request)
            .map_err(|e| DaemonError::Protocol(e.to_string()))?;

        self.framed
            .send(raw)
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;

        let line = match self.framed.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(DaemonError::Transport(e.to_string())),
            None => return Err(DaemonError::Transport("connection closed".into())),
        };

        let response: RpcResponse = serde_json::from_str(&line)
            .map_err(|e| DaemonError::Protocol(e.to_string()))?;

        match response.error {
            None => Ok(response.result.unwrap_or(Value::Null)),
            Some(error) => Err(domain_error(error.code, error.message)),
        }
    }

    /// `daemon.status`
    pub async fn daemon_status(&mut self) -> DaemonResult<Value> {
        self.call(Method::DaemonStatus, None).await
    }

    /// `process.list`
    pub async fn list_processes(&mut self) -> DaemonResult<Value> {
        self.call(Method::ProcessList, None).await
    }
}

/// Map a wire error code back onto the daemon taxonomy.
fn domain_error(code: i64, message: String) -> DaemonError {
    match code {
        codes::PROCESS_NOT_FOUND => DaemonError::ProcessNotFound(message),
        codes::PROCESS_ALREADY_EXISTS => DaemonError::ProcessAlreadyExists(message),
        codes::PROCESS_NOT_RUNNING => DaemonError::ProcessNotRunning(message),
        codes::PARSE_ERROR | codes::INVALID_REQUEST | codes::METHOD_NOT_FOUND
        | codes::INVALID_PARAMS => DaemonError::Protocol(message),
        _ => DaemonError::Internal(message),
    }
}

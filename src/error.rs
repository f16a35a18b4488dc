//! Daemon-wide error taxonomy
//!
//! Component modules define their own error enums where the failure domain
//! is local (database, fleet transport, plugin storage). Errors that cross
//! the public surface are folded into [`DaemonError`] so the IPC layer can
//! map them onto stable error codes.

use thiserror::Error;

use crate::ipc::codes;

/// Errors surfaced by supervisor and fleet operations.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Process already exists: {0}")]
    ProcessAlreadyExists(String),

    #[error("Process not running: {0}")]
    ProcessNotRunning(String),

    #[error("Deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Authentication failed")]
    Auth,

    #[error("Operation timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::database::DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Spawn failed: {0}")]
    Spawn(String),

    #[error("{0}")]
    Internal(String),
}

impl DaemonError {
    /// Map the error onto the JSON-RPC error code used by the IPC surface.
    pub fn rpc_code(&self) -> i64 {
        match self {
            DaemonError::ProcessNotFound(_) => codes::PROCESS_NOT_FOUND,
            DaemonError::ProcessAlreadyExists(_) => codes::PROCESS_ALREADY_EXISTS,
            DaemonError::ProcessNotRunning(_) => codes::PROCESS_NOT_RUNNING,
            DaemonError::Protocol(_) => codes::INVALID_PARAMS,
            _ => codes::DAEMON_ERROR,
        }
    }
}

pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_code_mapping() {
        assert_eq!(
            DaemonError::ProcessNotFound("web".into()).rpc_code(),
            codes::PROCESS_NOT_FOUND
        );
        assert_eq!(
            DaemonError::ProcessAlreadyExists("web".into()).rpc_code(),
            codes::PROCESS_ALREADY_EXISTS
        );
        assert_eq!(
            DaemonError::ProcessNotRunning("web".into()).rpc_code(),
            codes::PROCESS_NOT_RUNNING
        );
        assert_eq!(DaemonError::Timeout.rpc_code(), codes::DAEMON_ERROR);
    }

    #[test]
    fn test_display_carries_identifier() {
        let err = DaemonError::ProcessNotFound("worker-3".into());
        assert_eq!(err.to_string(), "Process not found: worker-3");
    }
}

//! Container lifecycle states

use serde::{Deserialize, Serialize};

/// Lifecycle state of a running container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessStatus {
    /// Child is being spawned
    Launching,
    /// Child is running
    Online,
    /// Graceful shutdown in progress
    Stopping,
    /// Child is not running
    Stopped,
    /// Child exited abnormally and will not be restarted
    Errored,
    /// A restart is scheduled after a crash
    WaitingRestart,
    /// Single-shot launch finished
    OneLaunchStatus,
}

impl ProcessStatus {
    /// True while a child process may hold a PID
    pub fn has_pid(&self) -> bool {
        matches!(self, ProcessStatus::Online | ProcessStatus::Stopping)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessStatus::Launching => "launching",
            ProcessStatus::Online => "online",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Errored => "errored",
            ProcessStatus::WaitingRestart => "waiting-restart",
            ProcessStatus::OneLaunchStatus => "one-launch-status",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "launching" => Ok(ProcessStatus::Launching),
            "online" => Ok(ProcessStatus::Online),
            "stopping" => Ok(ProcessStatus::Stopping),
            "stopped" => Ok(ProcessStatus::Stopped),
            "errored" => Ok(ProcessStatus::Errored),
            "waiting-restart" => Ok(ProcessStatus::WaitingRestart),
            "one-launch-status" => Ok(ProcessStatus::OneLaunchStatus),
            other => Err(format!("unknown process status: {}", other)),
        }
    }
}

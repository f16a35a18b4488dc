//! Process definitions
//!
//! A definition is the persisted configuration for a managed process. The
//! config body is stored as JSON in the process table and must round-trip
//! through serde unchanged.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::health::HealthCheckConfig;

/// Execution mode for the child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Single child process
    #[default]
    Fork,
    /// One container per worker, `instances` workers
    Cluster,
}

/// Requested instance count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Instances {
    /// Fixed count
    Count(u32),
    /// "max" / "auto" resolve to the host cpu count
    Named(InstanceHint),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceHint {
    Max,
    Auto,
}

impl Instances {
    /// Resolve to a concrete worker count, never zero.
    pub fn resolve(&self) -> usize {
        match self {
            Instances::Count(n) => (*n).max(1) as usize,
            Instances::Named(_) => num_cpus::get().max(1),
        }
    }
}

impl Default for Instances {
    fn default() -> Self {
        Instances::Count(1)
    }
}

/// Per-process log rotation override
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessLogConfig {
    /// Rotation threshold, human size string ("100M")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<String>,

    /// Number of rotated files to keep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep: Option<usize>,

    /// Gzip rotated files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
}

/// Persisted configuration for a managed process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Script or executable to run
    pub script: String,

    /// Arguments passed to the script
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Interpreter the script runs under ("node", "python3", ...)
    #[serde(default)]
    pub interpreter: Option<String>,

    /// Arguments passed to the interpreter before the script
    #[serde(default)]
    pub interpreter_args: Vec<String>,

    /// Environment variables for the child
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Worker count
    #[serde(default)]
    pub instances: Instances,

    /// Fork or cluster execution
    #[serde(default)]
    pub exec_mode: ExecMode,

    /// Memory cap, human size string ("512M")
    #[serde(default)]
    pub max_memory: Option<String>,

    /// Restart the child when it crashes
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,

    /// Crash-restart cap; zero disables restarts entirely
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Initial restart delay in milliseconds
    #[serde(default)]
    pub restart_delay: u64,

    /// Exponential backoff cap in milliseconds; absent disables backoff
    #[serde(default)]
    pub exp_backoff_restart_delay: Option<u64>,

    /// Paths watched for changes
    #[serde(default)]
    pub watch: Vec<PathBuf>,

    /// Globs excluded from watching
    #[serde(default)]
    pub ignore_watch: Vec<String>,

    /// Graceful shutdown escalation timeout in milliseconds
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout: u64,

    /// Listen-ready timeout in milliseconds
    #[serde(default = "default_listen_timeout")]
    pub listen_timeout: u64,

    /// Send a structured shutdown message to the child's stdin before INT
    #[serde(default)]
    pub shutdown_message: bool,

    /// Health probe configuration
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,

    /// Log rotation override
    #[serde(default)]
    pub log: Option<ProcessLogConfig>,

    /// Cron expression triggering periodic restarts
    #[serde(default)]
    pub cron_restart: Option<String>,
}

fn default_autorestart() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    16
}

fn default_kill_timeout() -> u64 {
    5000
}

fn default_listen_timeout() -> u64 {
    8000
}

impl ProcessConfig {
    /// Minimal config for a script with defaults everywhere else.
    pub fn for_script(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
            cwd: None,
            interpreter: None,
            interpreter_args: Vec::new(),
            env: HashMap::new(),
            instances: Instances::default(),
            exec_mode: ExecMode::default(),
            max_memory: None,
            autorestart: default_autorestart(),
            max_restarts: default_max_restarts(),
            restart_delay: 0,
            exp_backoff_restart_delay: None,
            watch: Vec::new(),
            ignore_watch: Vec::new(),
            kill_timeout: default_kill_timeout(),
            listen_timeout: default_listen_timeout(),
            shutdown_message: false,
            health_check: None,
            log: None,
            cron_restart: None,
        }
    }

    /// Graceful shutdown timeout.
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout.max(1))
    }

    /// Validate the invariants that cannot be expressed in types.
    pub fn validate(&self) -> Result<(), String> {
        if self.script.trim().is_empty() {
            return Err("script must not be empty".into());
        }
        if let Instances::Count(0) = self.instances {
            return Err("instances must be at least 1".into());
        }
        if self.kill_timeout == 0 {
            return Err("kill_timeout must be greater than zero".into());
        }
        if self.listen_timeout == 0 {
            return Err("listen_timeout must be greater than zero".into());
        }
        Ok(())
    }
}

/// A definition row joined with its parsed config
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    /// Stable identifier assigned by the repository
    pub id: i64,

    /// Unique, case-sensitive name
    pub name: String,

    /// Parsed configuration body
    pub config: ProcessConfig,
}

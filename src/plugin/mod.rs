//! Plugin module
//!
//! In-process plugins implement the [`Plugin`] trait and receive lifecycle
//! hooks routed from the event bus wildcard tap. Each plugin gets a scoped
//! context: its configuration, a read-mostly view of the supervisor, and a
//! private persistent key/value store.

mod audit;
mod host;
mod storage;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::supervisor::{ProcessInfo, Supervisor};

pub use audit::AuditPlugin;
pub use host::{PluginHost, PluginState, PluginStatus, DEFAULT_MAX_CONSECUTIVE_ERRORS};
pub use storage::PluginStorage;

/// Plugin errors
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin init failed: {0}")]
    InitFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Scoped environment handed to a plugin at init
pub struct PluginContext {
    /// User-provided plugin configuration (empty object by default)
    pub config: Value,

    /// Plugin name, also the tracing target for scoped logs
    pub name: String,

    /// Read-mostly surface over the supervisor
    pub api: PluginApi,

    /// Private persistent key/value storage
    pub storage: Arc<PluginStorage>,
}

/// Read-mostly view of the supervisor for plugins
#[derive(Clone)]
pub struct PluginApi {
    supervisor: Arc<Supervisor>,
}

impl PluginApi {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    /// Snapshot of every managed process.
    pub async fn processes(&self) -> Vec<ProcessInfo> {
        self.supervisor.list().await.unwrap_or_default()
    }

    /// Current (process id -> pid) mapping.
    pub fn running_pids(&self) -> std::collections::HashMap<i64, u32> {
        self.supervisor.running_pid_map()
    }
}

/// A loadable plugin. Hooks default to no-ops; implement the ones the
/// plugin cares about. Hook payloads are the event envelope data.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// Called once at registration; failure prevents registration.
    async fn on_init(&self, ctx: &PluginContext) -> Result<(), String>;

    /// Called at host shutdown; failures are tolerated.
    async fn on_destroy(&self) -> Result<(), String> {
        Ok(())
    }

    async fn on_process_start(&self, _data: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn on_process_stop(&self, _data: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn on_process_restart(&self, _data: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn on_process_crash(&self, _data: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn on_process_exit(&self, _data: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn on_metrics_collected(&self, _data: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn on_system_metrics(&self, _data: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn on_log_entry(&self, _data: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn on_health_check_fail(&self, _data: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn on_health_check_restore(&self, _data: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn on_config_change(&self, _data: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// Directory-safe form of a plugin name.
pub(crate) fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("metrics-export"), "metrics-export");
        assert_eq!(sanitize_name("weird/name here"), "weird-name-here");
        assert_eq!(sanitize_name("dots.and.more"), "dots-and-more");
    }
}

//! Built-in event audit plugin
//!
//! Keeps per-process counters of lifecycle events in plugin storage so
//! operators can see crash/restart history across daemon restarts without
//! querying the event table. Also serves as the in-tree reference for the
//! plugin SDK.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{Plugin, PluginContext, PluginStorage};

/// Storage key prefix for per-process counters
const COUNTER_PREFIX: &str = "counts:";

/// Counts lifecycle events per process name
pub struct AuditPlugin {
    storage: Mutex<Option<Arc<PluginStorage>>>,
}

impl AuditPlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            storage: Mutex::new(None),
        })
    }

    async fn bump(&self, data: &Value, kind: &str) -> Result<(), String> {
        let Some(name) = data.get("processName").and_then(Value::as_str) else {
            return Ok(());
        };
        let storage = self.storage.lock().clone();
        let Some(storage) = storage else {
            return Ok(());
        };

        let key = format!("{}{}", COUNTER_PREFIX, name);
        let mut counts = storage.get(&key).unwrap_or_else(|| json!({}));
        let next = counts.get(kind).and_then(Value::as_u64).unwrap_or(0) + 1;
        counts[kind] = json!(next);

        storage.set(&key, counts).await.map_err(|e| e.to_string())
    }

    /// Stored counters for a process name
    pub fn counts_for(&self, name: &str) -> Option<Value> {
        let storage = self.storage.lock().clone()?;
        storage.get(&format!("{}{}", COUNTER_PREFIX, name))
    }
}

#[async_trait]
impl Plugin for AuditPlugin {
    fn name(&self) -> &str {
        "event-audit"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn on_init(&self, ctx: &PluginContext) -> Result<(), String> {
        *self.storage.lock() = Some(ctx.storage.clone());
        Ok(())
    }

    async fn on_process_start(&self, data: &Value) -> Result<(), String> {
        self.bump(data, "start").await
    }

    async fn on_process_stop(&self, data: &Value) -> Result<(), String> {
        self.bump(data, "stop").await
    }

    async fn on_process_restart(&self, data: &Value) -> Result<(), String> {
        self.bump(data, "restart").await
    }

    async fn on_process_crash(&self, data: &Value) -> Result<(), String> {
        self.bump(data, "crash").await
    }

    async fn on_process_exit(&self, data: &Value) -> Result<(), String> {
        self.bump(data, "exit").await
    }

    async fn on_health_check_fail(&self, data: &Value) -> Result<(), String> {
        self.bump(data, "health-fail").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::events::{EventBus, EventEnvelope};
    use crate::plugin::{PluginApi, PluginHost};
    use crate::supervisor::Supervisor;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn envelope(event_type: &str, name: &str) -> EventEnvelope {
        EventEnvelope {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            source: "supervisor".to_string(),
            timestamp: Utc::now(),
            data: json!({ "processId": 1, "processName": name }),
        }
    }

    fn api() -> PluginApi {
        let db = Arc::new(Database::open_in_memory().unwrap());
        PluginApi::new(Supervisor::new(
            db,
            EventBus::new(),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_counts_lifecycle_events() {
        let dir = tempfile::tempdir().unwrap();
        let host = PluginHost::new(api(), dir.path().to_path_buf());

        let plugin = AuditPlugin::new();
        host.register(plugin.clone(), json!({})).await.unwrap();

        host.dispatch(&envelope("process:start", "web")).await;
        host.dispatch(&envelope("process:crash", "web")).await;
        host.dispatch(&envelope("process:crash", "web")).await;
        host.dispatch(&envelope("process:start", "worker")).await;

        let counts = plugin.counts_for("web").unwrap();
        assert_eq!(counts["start"], 1);
        assert_eq!(counts["crash"], 2);

        let counts = plugin.counts_for("worker").unwrap();
        assert_eq!(counts["start"], 1);
        assert!(counts.get("crash").is_none());
    }

    #[tokio::test]
    async fn test_counts_survive_reregistration() {
        let dir = tempfile::tempdir().unwrap();

        {
            let host = PluginHost::new(api(), dir.path().to_path_buf());
            let plugin = AuditPlugin::new();
            host.register(plugin, json!({})).await.unwrap();
            host.dispatch(&envelope("process:crash", "web")).await;
            host.shutdown().await;
        }

        // A fresh host and plugin instance load the persisted counters
        let host = PluginHost::new(api(), dir.path().to_path_buf());
        let plugin = AuditPlugin::new();
        host.register(plugin.clone(), json!({})).await.unwrap();
        host.dispatch(&envelope("process:crash", "web")).await;

        let counts = plugin.counts_for("web").unwrap();
        assert_eq!(counts["crash"], 2);
    }

    #[tokio::test]
    async fn test_payload_without_name_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let host = PluginHost::new(api(), dir.path().to_path_buf());
        let plugin = AuditPlugin::new();
        host.register(plugin.clone(), json!({})).await.unwrap();

        let mut bad = envelope("process:start", "x");
        bad.data = json!({ "processId": 1 });
        host.dispatch(&bad).await;

        assert!(plugin.counts_for("x").is_none());
    }
}

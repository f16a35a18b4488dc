//! Plugin host
//!
//! Registers plugins, routes bus envelopes to lifecycle hooks, and
//! enforces the per-plugin error budget: each hook invocation is its own
//! error boundary, a success resets the consecutive-error counter, and the
//! invocation that reaches the budget disables that plugin. Disabled
//! plugins receive no further hooks until explicitly re-enabled.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, EventEnvelope};

use super::storage::PluginStorage;
use super::{sanitize_name, Plugin, PluginApi, PluginContext, PluginError};

/// Consecutive hook failures before a plugin is disabled
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Reported plugin status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Active,
    Disabled,
}

/// Reported plugin state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginState {
    pub name: String,
    pub version: String,
    pub status: PluginStatus,
    pub error_count: u32,
}

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    version: String,
    disabled: AtomicBool,
    error_count: AtomicU32,
}

/// Hosts registered plugins and dispatches lifecycle hooks
pub struct PluginHost {
    entries: RwLock<Vec<(String, Arc<PluginEntry>)>>,
    api: PluginApi,
    root: PathBuf,
    max_consecutive_errors: u32,
    weak: std::sync::Weak<PluginHost>,
}

impl PluginHost {
    pub fn new(api: PluginApi, root: PathBuf) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            entries: RwLock::new(Vec::new()),
            api,
            root,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            weak: weak.clone(),
        })
    }

    /// Override the error budget (primarily for tests).
    pub fn with_error_budget(api: PluginApi, root: PathBuf, budget: u32) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            entries: RwLock::new(Vec::new()),
            api,
            root,
            max_consecutive_errors: budget.max(1),
            weak: weak.clone(),
        })
    }

    /// Register a plugin. Duplicate names are refused; a failing `on_init`
    /// leaves the plugin unregistered.
    pub async fn register(
        &self,
        plugin: Arc<dyn Plugin>,
        config: Value,
    ) -> Result<(), PluginError> {
        let name = plugin.name().to_string();

        if self.entries.read().iter().any(|(n, _)| *n == name) {
            return Err(PluginError::AlreadyRegistered(name));
        }

        let storage_path = self
            .root
            .join(sanitize_name(&name))
            .join("storage.json");
        let storage = PluginStorage::open(storage_path)?;

        let context = PluginContext {
            config,
            name: name.clone(),
            api: self.api.clone(),
            storage,
        };

        plugin
            .on_init(&context)
            .await
            .map_err(PluginError::InitFailed)?;

        let entry = Arc::new(PluginEntry {
            version: plugin.version().to_string(),
            plugin,
            disabled: AtomicBool::new(false),
            error_count: AtomicU32::new(0),
        });

        self.entries.write().push((name.clone(), entry));
        info!("Plugin {} registered", name);
        Ok(())
    }

    /// Reset a plugin's status and error count.
    pub fn enable_plugin(&self, name: &str) -> Result<(), PluginError> {
        let entries = self.entries.read();
        let entry = entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e.clone())
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        entry.disabled.store(false, Ordering::SeqCst);
        entry.error_count.store(0, Ordering::SeqCst);
        info!("Plugin {} re-enabled", name);
        Ok(())
    }

    /// Reported state of every registered plugin.
    pub fn plugins(&self) -> Vec<PluginState> {
        self.entries
            .read()
            .iter()
            .map(|(name, entry)| PluginState {
                name: name.clone(),
                version: entry.version.clone(),
                status: if entry.disabled.load(Ordering::SeqCst) {
                    PluginStatus::Disabled
                } else {
                    PluginStatus::Active
                },
                error_count: entry.error_count.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Subscribe to the bus and route envelopes until shutdown.
    pub fn start(&self, bus: &EventBus, shutdown: CancellationToken) {
        let mut rx = bus.watch_all();
        let Some(host) = self.weak.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Plugin dispatch stopped");
                        return;
                    }
                    received = rx.recv() => {
                        match received {
                            Ok(envelope) => host.dispatch(&envelope).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                warn!("Plugin dispatch lagged, {} envelopes dropped", missed);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });
    }

    /// Route one envelope to the matching hook on every active plugin.
    pub async fn dispatch(&self, envelope: &EventEnvelope) {
        let entries: Vec<(String, Arc<PluginEntry>)> = self.entries.read().clone();

        for (name, entry) in entries {
            if entry.disabled.load(Ordering::SeqCst) {
                continue;
            }

            let outcome = invoke_hook(&*entry.plugin, &envelope.event_type, &envelope.data).await;

            match outcome {
                None => {} // topic has no hook
                Some(Ok(())) => {
                    entry.error_count.store(0, Ordering::SeqCst);
                }
                Some(Err(message)) => {
                    let count = entry.error_count.fetch_add(1, Ordering::SeqCst) + 1;
                    error!(
                        "Plugin {} hook {} failed ({}/{}): {}",
                        name, envelope.event_type, count, self.max_consecutive_errors, message
                    );
                    if count >= self.max_consecutive_errors {
                        entry.disabled.store(true, Ordering::SeqCst);
                        warn!("Plugin {} disabled after {} consecutive errors", name, count);
                    }
                }
            }
        }
    }

    /// Call `on_destroy` on every plugin, tolerating failures, then clear
    /// the registry.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, Arc<PluginEntry>)> = self.entries.read().clone();
        for (name, entry) in entries {
            if let Err(e) = entry.plugin.on_destroy().await {
                warn!("Plugin {} destroy failed: {}", name, e);
            }
        }
        self.entries.write().clear();
    }
}

/// Map a topic to its hook. Returns `None` for topics without a hook.
async fn invoke_hook(
    plugin: &dyn Plugin,
    event_type: &str,
    data: &Value,
) -> Option<Result<(), String>> {
    let result = match event_type {
        "process:start" => plugin.on_process_start(data).await,
        "process:stop" => plugin.on_process_stop(data).await,
        "process:restart" => plugin.on_process_restart(data).await,
        "process:crash" => plugin.on_process_crash(data).await,
        "process:exit" => plugin.on_process_exit(data).await,
        "metric:process" => plugin.on_metrics_collected(data).await,
        "system:metrics" => plugin.on_system_metrics(data).await,
        "log:entry" => plugin.on_log_entry(data).await,
        "health:fail" => plugin.on_health_check_fail(data).await,
        "health:restore" => plugin.on_health_check_restore(data).await,
        "system:config-reload" => plugin.on_config_change(data).await,
        _ => return None,
    };
    Some(result)
}

//! Supervisor module
//!
//! Owns the registry of running containers, drives start/stop/restart/delete
//! through the persistence layer, and applies the auto-restart policy on
//! crashes. Cluster definitions fan out into one container per worker; every
//! public operation addresses the whole definition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::{Database, EventRepository, ProcessRepository, ProcessRow};
use crate::error::{DaemonError, DaemonResult};
use crate::events::{Event, EventBus};
use crate::health::Remediator;
use crate::logs::{LogAggregator, LogStream};
use crate::metrics::PidSource;
use crate::process::{Container, ExecMode, ExitOutcome, LogSink, ProcessConfig, ProcessStatus};

const SOURCE: &str = "supervisor";

/// How a caller addresses a process
#[derive(Debug, Clone)]
pub enum ProcessSelector {
    Id(i64),
    Name(String),
}

impl From<i64> for ProcessSelector {
    fn from(id: i64) -> Self {
        ProcessSelector::Id(id)
    }
}

impl From<&str> for ProcessSelector {
    fn from(value: &str) -> Self {
        ProcessSelector::Name(value.to_string())
    }
}

/// Snapshot of one definition for list/info queries
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub id: i64,
    pub name: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub uptime_secs: Option<u64>,
    pub instances: usize,
}

/// Registry of containers plus restart policy
pub struct Supervisor {
    db: Arc<Database>,
    bus: EventBus,
    groups: DashMap<String, Vec<Arc<Container>>>,
    pending_restarts: DashMap<String, CancellationToken>,
    op_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    aggregator: RwLock<Option<Arc<LogAggregator>>>,
    shutdown: CancellationToken,
    weak: std::sync::Weak<Supervisor>,
}

impl Supervisor {
    pub fn new(db: Arc<Database>, bus: EventBus, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            db,
            bus,
            groups: DashMap::new(),
            pending_restarts: DashMap::new(),
            op_locks: DashMap::new(),
            aggregator: RwLock::new(None),
            shutdown,
            weak: weak.clone(),
        })
    }

    /// Wire the log aggregator; child stream lines flow through it.
    pub fn set_log_aggregator(&self, aggregator: Arc<LogAggregator>) {
        *self.aggregator.write() = Some(aggregator);
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    // ========================================================================
    // Identifier resolution
    // ========================================================================

    /// Resolve a selector to its definition row. ID lookup wins; a numeric
    /// string falls back to a name lookup only when no such ID exists.
    pub async fn resolve(&self, selector: &ProcessSelector) -> DaemonResult<ProcessRow> {
        match selector {
            ProcessSelector::Id(id) => self
                .db
                .process_by_id(*id)
                .await?
                .ok_or_else(|| DaemonError::ProcessNotFound(id.to_string())),
            ProcessSelector::Name(name) => {
                if let Ok(id) = name.parse::<i64>() {
                    if let Some(row) = self.db.process_by_id(id).await? {
                        return Ok(row);
                    }
                }
                self.db
                    .process_by_name(name)
                    .await?
                    .ok_or_else(|| DaemonError::ProcessNotFound(name.clone()))
            }
        }
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Start a process. Creates the definition when the name is new,
    /// otherwise reuses it and updates its config.
    pub async fn start(&self, name: &str, config: ProcessConfig) -> DaemonResult<ProcessInfo> {
        config.validate().map_err(DaemonError::Protocol)?;

        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        if self.groups.contains_key(name) {
            return Err(DaemonError::ProcessAlreadyExists(name.to_string()));
        }

        let config_json = serde_json::to_string(&config)
            .map_err(|e| DaemonError::Internal(e.to_string()))?;

        let row = match self.db.process_by_name(name).await? {
            Some(row) => {
                self.db.update_config(row.id, &config_json).await?;
                row
            }
            None => self.db.create_process(name, &config_json).await?,
        };

        if let Some(log) = &config.log {
            if let Some(aggregator) = self.aggregator.read().clone() {
                aggregator.set_override(name, log.clone());
            }
        }

        let pid = self.spawn_group(row.id, name, &config, 0).await?;

        self.db.update_started(row.id, pid).await?;
        self.bus.emit(
            SOURCE,
            Event::ProcessStart {
                id: row.id,
                name: name.to_string(),
                pid,
            },
        );
        let _ = self
            .db
            .insert_event(row.id, name, "start", Some(serde_json::json!({ "pid": pid })))
            .await;

        self.info(&ProcessSelector::Id(row.id)).await
    }

    /// Stop a process. Sets the intentional flag before the shutdown so a
    /// crash mid-shutdown never re-enters the restart policy.
    pub async fn stop(&self, selector: &ProcessSelector, force: bool) -> DaemonResult<()> {
        let row = self.resolve(selector).await?;

        let lock = self.op_lock(&row.name);
        let _guard = lock.lock().await;

        self.cancel_pending_restart(&row.name);

        let group = self
            .groups
            .get(&row.name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DaemonError::ProcessNotRunning(row.name.clone()))?;

        for container in &group {
            container.mark_intentional_stop();
        }
        for container in &group {
            container.stop(force).await;
        }

        self.groups.remove(&row.name);
        self.db.update_status(row.id, "stopped", None).await?;

        self.bus.emit(
            SOURCE,
            Event::ProcessStop {
                id: row.id,
                name: row.name.clone(),
                forced: force,
            },
        );
        let _ = self
            .db
            .insert_event(
                row.id,
                &row.name,
                "stop",
                Some(serde_json::json!({ "force": force })),
            )
            .await;

        Ok(())
    }

    /// Stop (when running) and start again with the same definition id.
    /// Resets the restart counter.
    pub async fn restart(&self, selector: &ProcessSelector) -> DaemonResult<ProcessInfo> {
        let row = self.resolve(selector).await?;
        let config = row
            .parse_config()
            .map_err(|e| DaemonError::Internal(e.to_string()))?;

        {
            let lock = self.op_lock(&row.name);
            let _guard = lock.lock().await;

            self.cancel_pending_restart(&row.name);

            if let Some((_, group)) = self.groups.remove(&row.name) {
                for container in &group {
                    container.mark_intentional_stop();
                }
                for container in &group {
                    container.stop(false).await;
                }
            }

            self.db.reset_restarts(row.id).await?;
            let pid = self.spawn_group(row.id, &row.name, &config, 0).await?;
            self.db.update_started(row.id, pid).await?;
        }

        self.bus.emit(
            SOURCE,
            Event::ProcessRestart {
                id: row.id,
                name: row.name.clone(),
                restarts: 0,
            },
        );
        let _ = self
            .db
            .insert_event(row.id, &row.name, "restart", None)
            .await;

        self.info(&ProcessSelector::Id(row.id)).await
    }

    /// Force-stop, remove from the registry, and delete the definition.
    pub async fn delete(&self, selector: &ProcessSelector) -> DaemonResult<()> {
        let row = self.resolve(selector).await?;

        let lock = self.op_lock(&row.name);
        let _guard = lock.lock().await;

        self.cancel_pending_restart(&row.name);

        if let Some((_, group)) = self.groups.remove(&row.name) {
            for container in &group {
                container.mark_intentional_stop();
            }
            for container in &group {
                container.stop(true).await;
            }
        }

        self.db.delete_process(row.id).await?;

        if let Some(aggregator) = self.aggregator.read().clone() {
            aggregator.remove_process(row.id);
            aggregator.close_sinks(&row.name);
        }

        info!("Deleted process {} ({})", row.name, row.id);
        Ok(())
    }

    /// Snapshot every definition.
    pub async fn list(&self) -> DaemonResult<Vec<ProcessInfo>> {
        let rows = self.db.all_processes().await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            result.push(self.info_for_row(&row));
        }
        Ok(result)
    }

    /// Snapshot one definition.
    pub async fn info(&self, selector: &ProcessSelector) -> DaemonResult<ProcessInfo> {
        let row = self.resolve(selector).await?;
        Ok(self.info_for_row(&row))
    }

    /// Stop every running process.
    pub async fn stop_all(&self, force: bool) -> DaemonResult<()> {
        let names: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(e) = self.stop(&ProcessSelector::Name(name.clone()), force).await {
                warn!("Stop of {} failed: {}", name, e);
            }
        }
        Ok(())
    }

    /// Restart every definition.
    pub async fn restart_all(&self) -> DaemonResult<()> {
        let rows = self.db.all_processes().await?;
        for row in rows {
            if let Err(e) = self.restart(&ProcessSelector::Id(row.id)).await {
                warn!("Restart of {} failed: {}", row.name, e);
            }
        }
        Ok(())
    }

    /// Delete every definition.
    pub async fn delete_all(&self) -> DaemonResult<()> {
        let rows = self.db.all_processes().await?;
        for row in rows {
            if let Err(e) = self.delete(&ProcessSelector::Id(row.id)).await {
                warn!("Delete of {} failed: {}", row.name, e);
            }
        }
        Ok(())
    }

    /// Lock-free snapshot of live containers, for heartbeat payloads.
    pub fn live_snapshot(&self) -> Vec<serde_json::Value> {
        self.groups
            .iter()
            .filter_map(|entry| {
                let container = primary_container(entry.value())?;
                Some(serde_json::json!({
                    "id": container.id(),
                    "name": entry.key(),
                    "status": container.status().to_string(),
                    "pid": container.pid(),
                    "restarts": container.restarts(),
                    "uptimeSecs": container.uptime().map(|d| d.as_secs()),
                    "workers": entry.value().len(),
                }))
            })
            .collect()
    }

    /// Current (definition id -> primary pid) mapping.
    pub fn running_pid_map(&self) -> HashMap<i64, u32> {
        let mut map = HashMap::new();
        for entry in self.groups.iter() {
            if let Some(container) = primary_container(entry.value()) {
                if let Some(pid) = container.pid() {
                    map.insert(container.id(), pid);
                }
            }
        }
        map
    }

    /// Primary container for a definition, when registered.
    pub async fn container(&self, selector: &ProcessSelector) -> Option<Arc<Container>> {
        let row = self.resolve(selector).await.ok()?;
        self.groups
            .get(&row.name)
            .and_then(|entry| primary_container(entry.value()))
    }

    /// Re-register persisted definitions. Definitions that were online when
    /// the daemon went down are started again.
    pub async fn restore_from_db(&self) -> DaemonResult<usize> {
        let rows = self.db.all_processes().await?;
        let mut restored = 0;

        for row in rows {
            if row.status != "online" {
                continue;
            }
            let config = match row.parse_config() {
                Ok(config) => config,
                Err(e) => {
                    error!("Skipping restore of {}: {}", row.name, e);
                    continue;
                }
            };
            match self.start(&row.name, config).await {
                Ok(_) => restored += 1,
                Err(e) => error!("Restore of {} failed: {}", row.name, e),
            }
        }

        info!("Restored {} processes from the database", restored);
        Ok(restored)
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn op_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.op_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn log_sink(&self) -> Option<LogSink> {
        let aggregator = self.aggregator.read().clone()?;
        Some(Arc::new(
            move |id: i64, name: &str, stream: LogStream, line: &str| {
                aggregator.write(id, name, stream, line);
            },
        ))
    }

    /// Spawn all workers for a definition and register the group. Returns
    /// the primary worker's pid.
    async fn spawn_group(
        &self,
        id: i64,
        name: &str,
        config: &ProcessConfig,
        restarts: u32,
    ) -> DaemonResult<u32> {
        let workers = match config.exec_mode {
            ExecMode::Fork => 1,
            ExecMode::Cluster => config.instances.resolve(),
        };

        let sink = self.log_sink();
        let mut group: Vec<Arc<Container>> = Vec::with_capacity(workers);
        let mut primary_pid = 0;

        for worker in 0..workers {
            let container = Container::new(id, name, worker, config.clone());
            container.set_restarts(restarts);

            match container.start(sink.clone()).await {
                Ok(pid) => {
                    if worker == 0 {
                        primary_pid = pid;
                    }
                }
                Err(e) => {
                    // Unwind the workers that already came up
                    for started in &group {
                        started.mark_intentional_stop();
                        started.stop(true).await;
                    }
                    let _ = self.db.update_status(id, "errored", None).await;
                    self.bus.emit(
                        SOURCE,
                        Event::ProcessError {
                            id,
                            name: name.to_string(),
                            message: e.to_string(),
                        },
                    );
                    return Err(e);
                }
            }

            self.watch_exit(container.clone());
            group.push(container);
        }

        self.groups.insert(name.to_string(), group);
        Ok(primary_pid)
    }

    fn watch_exit(&self, container: Arc<Container>) {
        let supervisor = self.weak.clone();
        tokio::spawn(async move {
            let mut rx = container.subscribe_exit();
            let outcome = loop {
                if let Some(outcome) = *rx.borrow() {
                    break outcome;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            };

            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.handle_exit(container, outcome).await;
            }
        });
    }

    async fn handle_exit(self: Arc<Self>, container: Arc<Container>, outcome: ExitOutcome) {
        let id = container.id();
        let name = container.name().to_string();

        // Serialize against start/stop/restart on the same name so exit
        // bookkeeping never interleaves with an in-flight operation.
        let lock = self.op_lock(&name);
        let _guard = lock.lock().await;

        // Intentional stops (including crashes during shutdown) are owned by
        // the stop flow; never schedule a restart for them.
        if container.is_intentional_stop() || container.status() == ProcessStatus::Stopping {
            return;
        }

        if outcome.is_clean() {
            container.set_status(ProcessStatus::Stopped);
            self.remove_worker(&name, &container);
            let _ = self.db.update_status(id, "stopped", None).await;
            self.bus.emit(
                SOURCE,
                Event::ProcessExit {
                    id,
                    name: name.clone(),
                    code: 0,
                },
            );
            let _ = self
                .db
                .insert_event(id, &name, "exit", Some(serde_json::json!({ "exitCode": 0 })))
                .await;
            return;
        }

        self.bus.emit(
            SOURCE,
            Event::ProcessCrash {
                id,
                name: name.clone(),
                code: outcome.code,
                signal: outcome.signal,
            },
        );
        let _ = self
            .db
            .insert_event(
                id,
                &name,
                "crash",
                Some(serde_json::json!({
                    "exitCode": outcome.code,
                    "signal": outcome.signal,
                })),
            )
            .await;

        let config = container.config().clone();
        let restarts = container.restarts();
        let restartable = config.autorestart
            && config.max_restarts > 0
            && restarts < config.max_restarts
            && !self.shutdown.is_cancelled();

        if !restartable {
            container.set_status(ProcessStatus::Errored);
            let _ = self.db.update_status(id, "errored", None).await;
            debug!(
                "Not restarting {} (restarts={}, cap={})",
                name, restarts, config.max_restarts
            );
            return;
        }

        container.set_status(ProcessStatus::WaitingRestart);
        let _ = self.db.update_status(id, "waiting-restart", None).await;

        let delay = restart_delay(&config, restarts);
        info!(
            "Scheduling restart of {} in {:?} (attempt {})",
            name,
            delay,
            restarts + 1
        );
        self.schedule_restart(id, name, config, restarts, delay);
    }

    fn schedule_restart(
        self: Arc<Self>,
        id: i64,
        name: String,
        config: ProcessConfig,
        restarts: u32,
        delay: Duration,
    ) {
        let token = self.shutdown.child_token();
        self.pending_restarts.insert(name.clone(), token.clone());

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Restart of {} cancelled", name);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let lock = self.op_lock(&name);
            let _guard = lock.lock().await;
            self.pending_restarts.remove(&name);

            if token.is_cancelled() {
                return;
            }

            // Drop the crashed group and re-enter the start flow
            self.groups.remove(&name);

            let new_count = match self.db.increment_restarts(id).await {
                Ok(count) => count,
                Err(e) => {
                    error!("Failed to persist restart counter for {}: {}", name, e);
                    restarts + 1
                }
            };

            match self.spawn_group(id, &name, &config, new_count).await {
                Ok(pid) => {
                    let _ = self.db.update_started(id, pid).await;
                    self.bus.emit(
                        SOURCE,
                        Event::ProcessRestart {
                            id,
                            name: name.clone(),
                            restarts: new_count,
                        },
                    );
                    let _ = self
                        .db
                        .insert_event(
                            id,
                            &name,
                            "restart",
                            Some(serde_json::json!({ "restarts": new_count })),
                        )
                        .await;
                }
                Err(e) => {
                    error!("Auto-restart of {} failed: {}", name, e);
                }
            }
        });
    }

    fn cancel_pending_restart(&self, name: &str) {
        if let Some((_, token)) = self.pending_restarts.remove(name) {
            token.cancel();
        }
    }

    fn remove_worker(&self, name: &str, container: &Arc<Container>) {
        let mut empty = false;
        if let Some(mut entry) = self.groups.get_mut(name) {
            entry
                .value_mut()
                .retain(|c| !Arc::ptr_eq(c, container));
            empty = entry.value().is_empty();
        }
        if empty {
            self.groups.remove(name);
        }
    }

    fn info_for_row(&self, row: &ProcessRow) -> ProcessInfo {
        let group = self.groups.get(&row.name);
        let (status, pid, uptime, restarts, instances) = match group.as_ref() {
            Some(entry) => {
                let containers = entry.value();
                let primary = primary_container(containers);
                match primary {
                    Some(container) => (
                        container.status(),
                        container.pid(),
                        container.uptime().map(|d| d.as_secs()),
                        container.restarts(),
                        containers.len(),
                    ),
                    None => (
                        ProcessStatus::Stopped,
                        None,
                        None,
                        row.restarts,
                        containers.len(),
                    ),
                }
            }
            None => (
                row.status.parse().unwrap_or(ProcessStatus::Stopped),
                None,
                None,
                row.restarts,
                0,
            ),
        };

        ProcessInfo {
            id: row.id,
            name: row.name.clone(),
            status,
            pid,
            restarts,
            uptime_secs: uptime,
            instances,
        }
    }

}

fn primary_container(group: &[Arc<Container>]) -> Option<Arc<Container>> {
    group
        .iter()
        .find(|c| c.is_running())
        .or_else(|| group.first())
        .cloned()
}

/// Delay before the next restart attempt. With backoff enabled the base
/// delay doubles per accumulated restart, capped at the configured maximum.
fn restart_delay(config: &ProcessConfig, restarts: u32) -> Duration {
    let base = config.restart_delay;
    match config.exp_backoff_restart_delay {
        Some(cap) if cap > 0 && base > 0 => {
            let factor = 2u64.saturating_pow(restarts.min(16));
            Duration::from_millis(base.saturating_mul(factor).min(cap))
        }
        _ => Duration::from_millis(base),
    }
}

impl PidSource for Supervisor {
    fn running_pids(&self) -> Vec<(i64, u32)> {
        self.running_pid_map().into_iter().collect()
    }

    fn uptime_secs(&self, id: i64) -> Option<u64> {
        for entry in self.groups.iter() {
            if let Some(container) = primary_container(entry.value()) {
                if container.id() == id {
                    return container.uptime().map(|d| d.as_secs());
                }
            }
        }
        None
    }
}

#[async_trait]
impl Remediator for Supervisor {
    fn is_process_running(&self, id: i64) -> bool {
        for entry in self.groups.iter() {
            for container in entry.value() {
                if container.id() == id && container.is_running() {
                    return true;
                }
            }
        }
        false
    }

    async fn restart_process(&self, id: i64) -> Result<(), String> {
        self.restart(&ProcessSelector::Id(id))
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

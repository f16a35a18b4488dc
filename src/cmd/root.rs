//! Main daemon command - wires the supervisor runtime together

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::FutureExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use novapm::config::Configuration;
use novapm::cron::CronRestartScheduler;
use novapm::database::{Database, EventRepository, MetricsRepository, ProcessRepository};
use novapm::events::{spawn_recorder, Event, EventBus};
use novapm::fleet::{self, Agent, AgentConfig, ServerInfo};
use novapm::health::HealthMonitor;
use novapm::ipc::IpcServer;
use novapm::logs::LogAggregator;
use novapm::metrics::MetricsCollector;
use novapm::plugin::{AuditPlugin, PluginApi, PluginHost};
use novapm::supervisor::{ProcessSelector, Supervisor};

/// Run the main daemon
pub async fn run(config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let config = Arc::new(config);

    info!("Root directory: {}", config.system.root_directory.display());

    let shutdown = CancellationToken::new();
    let bus = EventBus::new();

    let db = Arc::new(Database::open(config.system.database_path())?);

    // Core components
    let supervisor = Supervisor::new(db.clone(), bus.clone(), shutdown.child_token());
    let aggregator = Arc::new(LogAggregator::new(
        config.system.log_directory(),
        config.logs.clone(),
        bus.clone(),
    ));
    supervisor.set_log_aggregator(aggregator.clone());

    spawn_recorder(&bus, db.clone(), shutdown.child_token());

    let collector = MetricsCollector::new(
        supervisor.clone(),
        db.clone(),
        bus.clone(),
        config.metrics.interval(),
    );
    collector.spawn(shutdown.child_token());

    let monitor = HealthMonitor::new(supervisor.clone(), bus.clone(), shutdown.child_token());
    let cron = CronRestartScheduler::new(supervisor.clone(), shutdown.child_token());
    wire_process_services(
        &bus,
        db.clone(),
        monitor.clone(),
        cron.clone(),
        shutdown.child_token(),
    );

    // Plugin host rides the wildcard tap
    let plugin_host = PluginHost::new(
        PluginApi::new(supervisor.clone()),
        config.system.plugin_directory(),
    );
    if let Err(e) = plugin_host
        .register(AuditPlugin::new(), serde_json::json!({}))
        .await
    {
        warn!("Event-audit plugin not registered: {}", e);
    }
    plugin_host.start(&bus, shutdown.child_token());

    // Local control surface
    let ipc = IpcServer::new(
        supervisor.clone(),
        aggregator.clone(),
        collector.clone(),
        bus.clone(),
        config.system.socket_path(),
        shutdown.clone(),
    );
    ipc.start().await?;

    // Re-register persisted definitions
    supervisor.restore_from_db().await?;

    // Fleet agent when configured or discoverable
    let agent = start_agent(&config, &supervisor, &collector, &bus, &shutdown).await;

    spawn_maintenance(db.clone(), shutdown.child_token());

    info!("novapm daemon v{} running", env!("CARGO_PKG_VERSION"));

    // Wait for ctrl-c or an IPC-driven shutdown
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.expect("Failed to install CTRL+C handler");
            warn!("Received shutdown signal, stopping processes...");
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown requested over IPC");
        }
    }

    bus.emit("daemon", Event::SystemShutdown);

    if let Some(agent) = agent {
        agent.stop().await;
    }
    plugin_host.shutdown().await;
    supervisor.stop_all(false).await.ok();
    aggregator.flush();
    shutdown.cancel();

    info!("Daemon stopped");
    Ok(())
}

pub(crate) fn load_config(path: Option<&str>) -> Result<Configuration> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            Configuration::load(path)
        }
        None => Configuration::default_paths(),
    }
}

/// Bridge lifecycle events to health and cron registration. Start and
/// restart (re-)register from the definition; stop unregisters.
fn wire_process_services(
    bus: &EventBus,
    db: Arc<Database>,
    monitor: Arc<HealthMonitor>,
    cron: Arc<CronRestartScheduler>,
    shutdown: CancellationToken,
) {
    let mut rx = bus.watch_all();

    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = shutdown.cancelled() => return,
                received = rx.recv() => match received {
                    Ok(envelope) => envelope,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            };

            let Some(id) = envelope.data["processId"].as_i64() else {
                continue;
            };

            match envelope.event_type.as_str() {
                "process:start" | "process:restart" => {
                    let Ok(Some(row)) = db.process_by_id(id).await else {
                        continue;
                    };
                    let Ok(config) = row.parse_config() else {
                        continue;
                    };

                    if let Some(health) = config.health_check {
                        monitor.register(id, &row.name, health);
                    }
                    if let Some(expr) = config.cron_restart {
                        if let Err(e) = cron.register(id, &row.name, &expr) {
                            warn!("Cron restart for {} not scheduled: {}", row.name, e);
                        }
                    }
                }
                "process:stop" => {
                    monitor.unregister(id);
                    cron.unregister(id);
                }
                _ => {}
            }
        }
    });
}

/// Start the fleet agent when an endpoint is configured or discoverable.
async fn start_agent(
    config: &Arc<Configuration>,
    supervisor: &Arc<Supervisor>,
    collector: &Arc<MetricsCollector>,
    bus: &EventBus,
    shutdown: &CancellationToken,
) -> Option<Arc<Agent>> {
    let agent_config = config.agent.as_ref();
    let endpoint = fleet::discover(agent_config, None).await?;

    let env = fleet::from_env();
    let token = agent_config
        .and_then(|c| c.token.clone())
        .or_else(|| env.as_ref().and_then(|e| e.token.clone()));
    let heartbeat = agent_config
        .map(|c| Duration::from_millis(c.heartbeat_interval_ms))
        .or_else(|| env.as_ref().map(|e| e.heartbeat_interval))
        .unwrap_or(Duration::from_millis(30_000));
    let reconnect = agent_config
        .map(|c| Duration::from_millis(c.reconnect_interval_ms))
        .or_else(|| env.as_ref().map(|e| e.reconnect_interval))
        .unwrap_or(Duration::from_millis(5000));
    let max_attempts = agent_config
        .map(|c| c.max_reconnect_attempts)
        .or_else(|| env.as_ref().map(|e| e.max_reconnect_attempts))
        .unwrap_or(50);

    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
    let agent_id = format!("{}-{}", hostname, std::process::id());
    info!("Fleet agent {} dialing {}", agent_id, endpoint.websocket_url());

    let started = Instant::now();
    let info_supervisor = supervisor.clone();
    let info_collector = collector.clone();
    let info_hostname = hostname.clone();
    let info: fleet::InfoSource = Arc::new(move || {
        let snapshot = info_collector.system_snapshot();
        let pids = info_supervisor.running_pid_map();
        let server_info = ServerInfo {
            hostname: info_hostname.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: started.elapsed().as_secs(),
            cpu_usage: snapshot.map(|s| s.cpu).unwrap_or(0.0),
            memory_usage: snapshot
                .map(|s| {
                    if s.memory_total == 0 {
                        0.0
                    } else {
                        (s.memory_used as f64 / s.memory_total as f64) * 100.0
                    }
                })
                .unwrap_or(0.0),
            process_count: pids.len(),
            metadata: Default::default(),
        };
        (server_info, info_supervisor.live_snapshot())
    });

    let agent = Agent::new(
        AgentConfig {
            agent_id,
            endpoint,
            token,
            heartbeat_interval: heartbeat,
            reconnect_interval: reconnect,
            max_reconnect_attempts: max_attempts,
        },
        info,
        shutdown.child_token(),
    );

    register_agent_handlers(&agent, supervisor);

    // Forward per-process samples to the controller in batches
    let mut rx = bus.watch_all();
    let push_agent = agent.clone();
    let push_shutdown = shutdown.child_token();
    tokio::spawn(async move {
        let mut flush = tokio::time::interval(heartbeat);
        flush.tick().await;

        loop {
            tokio::select! {
                _ = push_shutdown.cancelled() => return,
                _ = flush.tick() => push_agent.flush_metrics(),
                received = rx.recv() => {
                    let Ok(envelope) = received else { continue };
                    if envelope.event_type != "metric:process" {
                        continue;
                    }
                    if let Ok(sample) = serde_json::from_value(envelope.data) {
                        push_agent.push_metric(sample);
                    }
                }
            }
        }
    });

    agent.start();
    Some(agent)
}

/// Remote commands every agent serves.
fn register_agent_handlers(agent: &Arc<Agent>, supervisor: &Arc<Supervisor>) {
    let list_supervisor = supervisor.clone();
    agent.on_command("process.list", move |_params| {
        let supervisor = list_supervisor.clone();
        async move {
            let list = supervisor.list().await.map_err(|e| e.to_string())?;
            serde_json::to_value(list).map_err(|e| e.to_string())
        }
        .boxed()
    });

    let restart_supervisor = supervisor.clone();
    agent.on_command("process.restart", move |params| {
        let supervisor = restart_supervisor.clone();
        async move {
            let name = params["process"]
                .as_str()
                .ok_or_else(|| "process required".to_string())?
                .to_string();
            let info = supervisor
                .restart(&ProcessSelector::Name(name))
                .await
                .map_err(|e| e.to_string())?;
            serde_json::to_value(info).map_err(|e| e.to_string())
        }
        .boxed()
    });

    let health_supervisor = supervisor.clone();
    agent.on_command("health.check", move |_params| {
        let supervisor = health_supervisor.clone();
        async move {
            // Healthy when every definition that should be running is
            let list = supervisor.list().await.map_err(|e| e.to_string())?;
            let errored = list
                .iter()
                .filter(|p| p.status == novapm::process::ProcessStatus::Errored)
                .count();
            Ok(json!({ "healthy": errored == 0, "processes": list.len() }))
        }
        .boxed()
    });
}

/// Periodic repository upkeep: metric downsampling and event retention.
fn spawn_maintenance(db: Arc<Database>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    match db.downsample_metrics().await {
                        Ok(dropped) if dropped > 0 => {
                            debug!("Downsampled {} old metric rows", dropped)
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Metric downsample failed: {}", e),
                    }
                    if let Err(e) = db.cleanup_events(30).await {
                        warn!("Event cleanup failed: {}", e);
                    }
                }
            }
        }
    });
}

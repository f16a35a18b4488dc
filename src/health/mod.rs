//! Health monitoring module
//!
//! Each registered process gets an independent recurring probe timer. Probe
//! failures increment a consecutive-failure counter; crossing the retry
//! threshold marks the process unhealthy, emits `health:fail`, and requests
//! a restart through the supervisor. Recovery emits `health:restore`.
//! Probe outcomes never surface to callers.

mod probe;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::parse_duration_or;
use crate::events::{Event, EventBus};

pub use probe::run_probe;

/// Kind of probe to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeType {
    Http,
    Tcp,
    Script,
}

/// Health probe configuration carried on a process definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(rename = "type")]
    pub check_type: ProbeType,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub script: Option<String>,

    /// Probe cadence, human duration string
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Per-probe deadline
    #[serde(default = "default_timeout")]
    pub timeout: String,

    /// Consecutive failures before remediation
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Grace window after registration during which probes are skipped
    #[serde(default = "default_start_period")]
    pub start_period: String,
}

fn default_interval() -> String {
    "30s".into()
}

fn default_timeout() -> String {
    "5s".into()
}

fn default_retries() -> u32 {
    3
}

fn default_start_period() -> String {
    "0s".into()
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        parse_duration_or(&self.interval, Duration::from_secs(30))
    }

    pub fn timeout(&self) -> Duration {
        parse_duration_or(&self.timeout, Duration::from_secs(5))
    }

    pub fn start_period(&self) -> Duration {
        parse_duration_or(&self.start_period, Duration::ZERO)
    }
}

/// Supervisor surface the monitor needs for remediation
#[async_trait]
pub trait Remediator: Send + Sync {
    /// Whether the container currently holds a live child
    fn is_process_running(&self, id: i64) -> bool;

    /// Restart the process; errors are logged and swallowed by the monitor
    async fn restart_process(&self, id: i64) -> Result<(), String>;
}

struct HealthEntry {
    name: String,
    config: HealthCheckConfig,
    failures: AtomicU32,
    healthy: AtomicBool,
    registered_at: Instant,
    token: CancellationToken,
}

/// Per-process health scheduler
pub struct HealthMonitor {
    remediator: Arc<dyn Remediator>,
    bus: EventBus,
    entries: DashMap<i64, Arc<HealthEntry>>,
    shutdown: CancellationToken,
    weak: std::sync::Weak<HealthMonitor>,
}

impl HealthMonitor {
    pub fn new(
        remediator: Arc<dyn Remediator>,
        bus: EventBus,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            remediator,
            bus,
            entries: DashMap::new(),
            shutdown,
            weak: weak.clone(),
        })
    }

    /// Register a process for monitoring. Replaces any prior registration
    /// for the same id.
    pub fn register(&self, id: i64, name: &str, config: HealthCheckConfig) {
        self.unregister(id);

        let entry = Arc::new(HealthEntry {
            name: name.to_string(),
            config,
            failures: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            registered_at: Instant::now(),
            token: self.shutdown.child_token(),
        });

        self.entries.insert(id, entry.clone());

        let Some(monitor) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(entry.config.interval());
            ticker.tick().await; // first probe after one full interval

            loop {
                tokio::select! {
                    _ = entry.token.cancelled() => {
                        debug!("Health monitoring stopped for {}", entry.name);
                        return;
                    }
                    _ = ticker.tick() => {
                        monitor.probe_once(id, &entry).await;
                    }
                }
            }
        });
    }

    /// Stop monitoring a process.
    pub fn unregister(&self, id: i64) {
        if let Some((_, entry)) = self.entries.remove(&id) {
            entry.token.cancel();
        }
    }

    /// Unregistered processes default to healthy.
    pub fn is_healthy(&self, id: i64) -> bool {
        self.entries
            .get(&id)
            .map(|entry| entry.healthy.load(Ordering::SeqCst))
            .unwrap_or(true)
    }

    /// Consecutive failures recorded for a process
    pub fn failure_count(&self, id: i64) -> u32 {
        self.entries
            .get(&id)
            .map(|entry| entry.failures.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    async fn probe_once(&self, id: i64, entry: &HealthEntry) {
        if entry.registered_at.elapsed() < entry.config.start_period() {
            return;
        }
        if !self.remediator.is_process_running(id) {
            return;
        }

        if probe::run_probe(&entry.config).await {
            self.record_success(id, entry);
        } else {
            self.record_failure(id, entry).await;
        }
    }

    fn record_success(&self, id: i64, entry: &HealthEntry) {
        let was_healthy = entry.healthy.swap(true, Ordering::SeqCst);
        if !was_healthy {
            self.bus.emit(
                "health",
                Event::HealthRestore {
                    id,
                    name: entry.name.clone(),
                },
            );
        }
        entry.failures.store(0, Ordering::SeqCst);
    }

    async fn record_failure(&self, id: i64, entry: &HealthEntry) {
        let failures = entry.failures.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "Health probe failed for {} ({}/{})",
            entry.name, failures, entry.config.retries
        );

        if failures < entry.config.retries {
            return;
        }

        entry.healthy.store(false, Ordering::SeqCst);
        self.bus.emit(
            "health",
            Event::HealthFail {
                id,
                name: entry.name.clone(),
                failures,
            },
        );

        if let Err(e) = self.remediator.restart_process(id).await {
            warn!("Health remediation restart of {} failed: {}", entry.name, e);
        }

        entry.failures.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FakeRemediator {
        running: AtomicBool,
        restarts: Mutex<Vec<i64>>,
    }

    impl FakeRemediator {
        fn new(running: bool) -> Arc<Self> {
            Arc::new(Self {
                running: AtomicBool::new(running),
                restarts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Remediator for FakeRemediator {
        fn is_process_running(&self, _id: i64) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn restart_process(&self, id: i64) -> Result<(), String> {
            self.restarts.lock().push(id);
            Ok(())
        }
    }

    fn failing_script_config(interval: &str) -> HealthCheckConfig {
        HealthCheckConfig {
            check_type: ProbeType::Script,
            host: None,
            port: None,
            path: None,
            script: Some("exit 1".into()),
            interval: interval.into(),
            timeout: "1s".into(),
            retries: 3,
            start_period: "0s".into(),
        }
    }

    #[tokio::test]
    async fn test_unregistered_is_healthy() {
        let monitor = HealthMonitor::new(
            FakeRemediator::new(true),
            EventBus::new(),
            CancellationToken::new(),
        );
        assert!(monitor.is_healthy(99));
    }

    #[tokio::test]
    async fn test_three_failures_trigger_restart_and_reset() {
        let remediator = FakeRemediator::new(true);
        let bus = EventBus::new();
        let mut rx = bus.watch_all();

        let monitor = HealthMonitor::new(
            remediator.clone(),
            bus,
            CancellationToken::new(),
        );
        monitor.register(1, "web", failing_script_config("50ms"));

        // Wait for the health:fail emission
        let envelope = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let envelope = rx.recv().await.unwrap();
                if envelope.event_type == "health:fail" {
                    return envelope;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(envelope.data["failures"], 3);
        assert!(!monitor.is_healthy(1));

        // Restart was requested and the counter reset
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(remediator.restarts.lock().as_slice(), &[1]);
        assert_eq!(monitor.failure_count(1), 0);

        monitor.unregister(1);
    }

    #[tokio::test]
    async fn test_recovery_emits_restore() {
        let remediator = FakeRemediator::new(true);
        let bus = EventBus::new();
        let mut rx = bus.watch_all();

        let monitor = HealthMonitor::new(remediator, bus, CancellationToken::new());

        // Probe passes only once the marker file exists
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ready");
        let mut config = failing_script_config("50ms");
        config.retries = 1;
        config.script = Some(format!("test -f {}", marker.display()));
        monitor.register(1, "web", config);

        // First failure flips to unhealthy
        loop {
            let envelope = rx.recv().await.unwrap();
            if envelope.event_type == "health:fail" {
                break;
            }
        }
        assert!(!monitor.is_healthy(1));

        std::fs::write(&marker, b"").unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let envelope = rx.recv().await.unwrap();
                if envelope.event_type == "health:restore" {
                    return envelope;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(envelope.data["processName"], "web");
        assert!(monitor.is_healthy(1));
        monitor.unregister(1);
    }

    #[tokio::test]
    async fn test_not_running_skips_probe() {
        let remediator = FakeRemediator::new(false);
        let monitor = HealthMonitor::new(
            remediator.clone(),
            EventBus::new(),
            CancellationToken::new(),
        );

        monitor.register(1, "web", failing_script_config("50ms"));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(monitor.failure_count(1), 0);
        assert!(remediator.restarts.lock().is_empty());
        monitor.unregister(1);
    }

    #[tokio::test]
    async fn test_start_period_grace() {
        let remediator = FakeRemediator::new(true);
        let monitor = HealthMonitor::new(
            remediator.clone(),
            EventBus::new(),
            CancellationToken::new(),
        );

        let mut config = failing_script_config("50ms");
        config.start_period = "10s".into();
        monitor.register(1, "web", config);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(monitor.failure_count(1), 0);
        monitor.unregister(1);
    }

    #[tokio::test]
    async fn test_http_probe_failures_drive_remediation() {
        // An HTTP endpoint that always answers 500
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    use tokio::io::AsyncWriteExt;
                    let response = "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        let remediator = FakeRemediator::new(true);
        let bus = EventBus::new();
        let mut rx = bus.watch_all();
        let monitor = HealthMonitor::new(remediator.clone(), bus, CancellationToken::new());

        monitor.register(
            4,
            "api",
            HealthCheckConfig {
                check_type: ProbeType::Http,
                host: None,
                port: Some(port),
                path: Some("/h".into()),
                script: None,
                interval: "100ms".into(),
                timeout: "1s".into(),
                retries: 3,
                start_period: "0s".into(),
            },
        );

        let envelope = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let envelope = rx.recv().await.unwrap();
                if envelope.event_type == "health:fail" {
                    return envelope;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(envelope.data["failures"], 3);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(remediator.restarts.lock().as_slice(), &[4]);
        assert_eq!(monitor.failure_count(4), 0);
        monitor.unregister(4);
    }
}

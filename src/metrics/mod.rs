//! Metrics collection module
//!
//! A timer-driven collector samples cpu/memory for every supervised PID on a
//! fixed tick, publishes each sample on the bus, keeps a latest-sample map,
//! and batch-inserts into the metrics repository. Per-tick errors are logged
//! and swallowed; the collector never takes the daemon down.

mod sampler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::database::{Database, MetricsRepository};
use crate::events::{Event, EventBus};

pub use sampler::round2;

/// Default sampling interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(5000);

/// One per-process sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetrics {
    pub process_id: i64,
    /// Unix seconds
    pub timestamp: i64,
    /// Percent, rounded to two decimals
    pub cpu: f64,
    /// Bytes
    pub memory: u64,
    /// Seconds since spawn
    pub uptime: u64,
    // Reserved fields, always zero on this runtime
    pub heap_used: u64,
    pub heap_total: u64,
    pub event_loop_latency: f64,
    pub active_handles: u32,
    pub active_requests: u32,
}

impl ProcessMetrics {
    /// A sample with every field zeroed except the id and current timestamp.
    pub fn zeroed(process_id: i64) -> Self {
        Self {
            process_id,
            timestamp: chrono::Utc::now().timestamp(),
            cpu: 0.0,
            memory: 0,
            uptime: 0,
            heap_used: 0,
            heap_total: 0,
            event_loop_latency: 0.0,
            active_handles: 0,
            active_requests: 0,
        }
    }
}

/// Host-wide snapshot published on `system:metrics`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub cpu: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub load_average: f64,
    pub process_count: usize,
    pub timestamp: i64,
}

/// Where the collector learns which PIDs to sample
pub trait PidSource: Send + Sync {
    /// Current (process id -> pid) mapping for running containers
    fn running_pids(&self) -> Vec<(i64, u32)>;

    /// Uptime in seconds for a running process
    fn uptime_secs(&self, id: i64) -> Option<u64>;
}

/// Timer-driven metrics collector
pub struct MetricsCollector {
    source: Arc<dyn PidSource>,
    db: Arc<Database>,
    bus: EventBus,
    interval: Duration,
    latest: DashMap<i64, ProcessMetrics>,
    latest_system: parking_lot::Mutex<Option<SystemMetrics>>,
    system: Mutex<System>,
    weak: std::sync::Weak<MetricsCollector>,
}

impl MetricsCollector {
    pub fn new(
        source: Arc<dyn PidSource>,
        db: Arc<Database>,
        bus: EventBus,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            source,
            db,
            bus,
            interval,
            latest: DashMap::new(),
            latest_system: parking_lot::Mutex::new(None),
            system: Mutex::new(System::new()),
            weak: weak.clone(),
        })
    }

    /// Start the sampling loop. Runs until the shutdown token fires.
    pub fn spawn(&self, shutdown: CancellationToken) {
        let Some(collector) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collector.interval);
            ticker.tick().await; // skip the immediate tick

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Metrics collector stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        collector.tick().await;
                    }
                }
            }
        });
    }

    /// Run one sampling pass. Public for tests and manual refresh.
    pub async fn tick(&self) {
        let pids = self.source.running_pids();

        let mut system = self.system.lock().await;
        let snapshot = sampler::sample_system(&mut system, pids.len());
        *self.latest_system.lock() = Some(snapshot);
        self.bus.emit("metrics", Event::SystemMetrics(snapshot));

        if pids.is_empty() {
            return;
        }

        let raw = sampler::sample_processes(&mut system, &pids);
        drop(system);

        let mut batch = Vec::with_capacity(raw.len());
        for (id, cpu, memory) in raw {
            let mut timestamp = chrono::Utc::now().timestamp();
            // Samples per process carry strictly increasing timestamps
            if let Some(prev) = self.latest.get(&id) {
                if prev.timestamp >= timestamp {
                    timestamp = prev.timestamp + 1;
                }
            }

            let sample = ProcessMetrics {
                process_id: id,
                timestamp,
                cpu: round2(cpu as f64),
                memory,
                uptime: self.source.uptime_secs(id).unwrap_or(0),
                heap_used: 0,
                heap_total: 0,
                event_loop_latency: 0.0,
                active_handles: 0,
                active_requests: 0,
            };

            self.bus.emit("metrics", Event::MetricProcess(sample));
            self.latest.insert(id, sample);
            batch.push(sample);
        }

        if batch.is_empty() {
            return;
        }

        if let Err(e) = self.db.insert_metrics_batch(&batch).await {
            warn!("Failed to persist {} metric samples: {}", batch.len(), e);
        }
    }

    /// Latest sample for a process
    pub fn latest(&self, id: i64) -> Option<ProcessMetrics> {
        self.latest.get(&id).map(|entry| *entry.value())
    }

    /// Fresh copy of the latest-sample map
    pub fn all_latest(&self) -> HashMap<i64, ProcessMetrics> {
        self.latest
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Drop the cached sample for a deleted process
    pub fn forget(&self, id: i64) {
        self.latest.remove(&id);
    }

    /// Latest host-wide snapshot, when a tick has run
    pub fn system_snapshot(&self) -> Option<SystemMetrics> {
        *self.latest_system.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ProcessRepository;

    struct SelfSource {
        id: i64,
    }

    impl PidSource for SelfSource {
        fn running_pids(&self) -> Vec<(i64, u32)> {
            vec![(self.id, std::process::id())]
        }

        fn uptime_secs(&self, _id: i64) -> Option<u64> {
            Some(12)
        }
    }

    struct EmptySource;

    impl PidSource for EmptySource {
        fn running_pids(&self) -> Vec<(i64, u32)> {
            Vec::new()
        }

        fn uptime_secs(&self, _id: i64) -> Option<u64> {
            None
        }
    }

    #[tokio::test]
    async fn test_tick_samples_and_persists() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let row = db.create_process("self", "{}").await.unwrap();

        let collector = MetricsCollector::new(
            Arc::new(SelfSource { id: row.id }),
            db.clone(),
            EventBus::new(),
            DEFAULT_INTERVAL,
        );

        collector.tick().await;

        let latest = collector.latest(row.id).unwrap();
        assert_eq!(latest.uptime, 12);
        assert!(latest.memory > 0);
        assert_eq!(latest.heap_used, 0);

        let persisted = db.latest_metric(row.id).await.unwrap().unwrap();
        assert_eq!(persisted.timestamp, latest.timestamp);
    }

    #[tokio::test]
    async fn test_empty_pid_map_skips_insert() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let collector = MetricsCollector::new(
            Arc::new(EmptySource),
            db.clone(),
            EventBus::new(),
            DEFAULT_INTERVAL,
        );

        collector.tick().await;
        assert!(collector.all_latest().is_empty());
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let row = db.create_process("self", "{}").await.unwrap();

        let collector = MetricsCollector::new(
            Arc::new(SelfSource { id: row.id }),
            db.clone(),
            EventBus::new(),
            DEFAULT_INTERVAL,
        );

        collector.tick().await;
        let first = collector.latest(row.id).unwrap().timestamp;
        collector.tick().await;
        let second = collector.latest(row.id).unwrap().timestamp;
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_system_snapshot_emitted() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = EventBus::new();
        let mut rx = bus.watch_all();

        let collector =
            MetricsCollector::new(Arc::new(EmptySource), db, bus, DEFAULT_INTERVAL);
        collector.tick().await;

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event_type, "system:metrics");
    }
}

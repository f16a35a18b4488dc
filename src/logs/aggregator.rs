//! Log aggregation
//!
//! One bounded ring buffer per process plus a pair of on-disk sinks per
//! process name (`<name>-out.log` / `<name>-error.log`). The buffer and the
//! file sink are decoupled: a file-write failure never drops the in-memory
//! entry and vice versa.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::{parse_size, LogConfiguration};
use crate::events::{Event, EventBus};
use crate::process::ProcessLogConfig;

use super::rotator::LogRotator;
use super::{LogEntry, LogStream};

/// Ring buffer capacity per process
const RING_CAPACITY: usize = 1000;

/// Default number of entries returned by the recent-log queries
pub const DEFAULT_RECENT: usize = 50;

struct FileSinks {
    out: Option<File>,
    err: Option<File>,
}

/// Aggregates child stdout/stderr into ring buffers and file sinks
pub struct LogAggregator {
    dir: PathBuf,
    defaults: LogConfiguration,
    bus: EventBus,
    buffers: Mutex<HashMap<i64, VecDeque<LogEntry>>>,
    sinks: Mutex<HashMap<String, FileSinks>>,
    overrides: Mutex<HashMap<String, ProcessLogConfig>>,
}

impl LogAggregator {
    /// Create an aggregator writing under `dir`.
    pub fn new(dir: PathBuf, defaults: LogConfiguration, bus: EventBus) -> Self {
        Self {
            dir,
            defaults,
            bus,
            buffers: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Record a per-process rotation override from the definition.
    pub fn set_override(&self, name: &str, config: ProcessLogConfig) {
        self.overrides.lock().insert(name.to_string(), config);
    }

    /// Ingest one chunk from a child stream. The chunk is trimmed of
    /// trailing whitespace and dropped when empty.
    pub fn write(&self, process_id: i64, process_name: &str, stream: LogStream, chunk: &str) {
        let message = chunk.trim_end();
        if message.is_empty() {
            return;
        }

        let entry = LogEntry {
            process_id,
            process_name: process_name.to_string(),
            stream,
            timestamp: Utc::now(),
            message: message.to_string(),
        };

        {
            let mut buffers = self.buffers.lock();
            let buffer = buffers.entry(process_id).or_default();
            if buffer.len() >= RING_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back(entry.clone());
        }

        self.bus.emit("logs", Event::LogEntry(entry.clone()));

        if let Err(e) = self.append_to_sink(&entry) {
            warn!(
                "Log sink write failed for {} ({}): {}",
                process_name, stream, e
            );
        }
    }

    /// Last `n` entries for a process, oldest first.
    pub fn recent_logs(&self, process_id: i64, n: usize) -> Vec<LogEntry> {
        let buffers = self.buffers.lock();
        match buffers.get(&process_id) {
            Some(buffer) => {
                let skip = buffer.len().saturating_sub(n);
                buffer.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Last `n` entries across every process, merged and sorted ascending by
    /// timestamp.
    pub fn all_recent_logs(&self, n: usize) -> Vec<LogEntry> {
        let buffers = self.buffers.lock();
        let mut merged: Vec<LogEntry> = buffers.values().flatten().cloned().collect();
        merged.sort_by_key(|entry| entry.timestamp);
        let skip = merged.len().saturating_sub(n);
        merged.split_off(skip)
    }

    /// On-disk sink paths for a process name.
    pub fn log_files(&self, name: &str) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{}-out.log", name)),
            self.dir.join(format!("{}-error.log", name)),
        )
    }

    /// Drop the ring buffer for a process.
    pub fn remove_process(&self, process_id: i64) {
        self.buffers.lock().remove(&process_id);
    }

    /// Close the file sinks for a process name.
    pub fn close_sinks(&self, name: &str) {
        self.sinks.lock().remove(name);
        self.overrides.lock().remove(name);
    }

    /// Flush every open sink.
    pub fn flush(&self) {
        let mut sinks = self.sinks.lock();
        for sinks in sinks.values_mut() {
            if let Some(f) = sinks.out.as_mut() {
                let _ = f.flush();
            }
            if let Some(f) = sinks.err.as_mut() {
                let _ = f.flush();
            }
        }
    }

    fn rotator_for(&self, name: &str) -> LogRotator {
        let overrides = self.overrides.lock();
        let over = overrides.get(name);

        let max_size = over
            .and_then(|o| o.max_size.as_deref())
            .and_then(parse_size)
            .unwrap_or_else(|| self.defaults.max_size_bytes());
        let keep = over
            .and_then(|o| o.keep)
            .unwrap_or(self.defaults.keep);
        let compress = over
            .and_then(|o| o.compress)
            .unwrap_or(self.defaults.compress);

        LogRotator::new(max_size, keep, compress)
    }

    fn append_to_sink(&self, entry: &LogEntry) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let (out_path, err_path) = self.log_files(&entry.process_name);
        let path = match entry.stream {
            LogStream::Stdout => &out_path,
            LogStream::Stderr => &err_path,
        };

        let line = format!("{} {}\n", entry.timestamp.to_rfc3339(), entry.message);

        let mut sinks = self.sinks.lock();
        let pair = sinks
            .entry(entry.process_name.clone())
            .or_insert(FileSinks {
                out: None,
                err: None,
            });

        let slot = match entry.stream {
            LogStream::Stdout => &mut pair.out,
            LogStream::Stderr => &mut pair.err,
        };

        if slot.is_none() {
            *slot = Some(OpenOptions::new().create(true).append(true).open(path)?);
        }

        let file = slot.as_mut().expect("sink opened above");
        file.write_all(line.as_bytes())?;

        let rotator = self.rotator_for(&entry.process_name);
        match rotator.rotate_if_needed(path) {
            Ok(true) => {
                // The open handle points at the rotated inode; reopen
                *slot = None;
            }
            Ok(false) => {}
            Err(e) => warn!("Rotation failed for {}: {}", path.display(), e),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(dir: &std::path::Path) -> LogAggregator {
        LogAggregator::new(dir.to_path_buf(), LogConfiguration::default(), EventBus::new())
    }

    #[test]
    fn test_write_trims_and_drops_empty() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());

        agg.write(1, "app", LogStream::Stdout, "hello world   \n");
        agg.write(1, "app", LogStream::Stdout, "   \n");
        agg.write(1, "app", LogStream::Stdout, "");

        let logs = agg.recent_logs(1, 10);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "hello world");
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());

        for i in 0..1100 {
            agg.write(1, "app", LogStream::Stdout, &format!("line {}", i));
        }

        let logs = agg.recent_logs(1, 2000);
        assert_eq!(logs.len(), RING_CAPACITY);
        assert_eq!(logs[0].message, "line 100");
        assert_eq!(logs.last().unwrap().message, "line 1099");
    }

    #[test]
    fn test_recent_logs_returns_tail() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());

        for i in 0..10 {
            agg.write(1, "app", LogStream::Stdout, &format!("line {}", i));
        }

        let logs = agg.recent_logs(1, 3);
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].message, "line 7");
        assert_eq!(logs[2].message, "line 9");
    }

    #[test]
    fn test_all_recent_logs_sorted_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());

        agg.write(1, "app", LogStream::Stdout, "from app");
        agg.write(2, "worker", LogStream::Stderr, "from worker");
        agg.write(1, "app", LogStream::Stdout, "later");

        let logs = agg.all_recent_logs(10);
        assert_eq!(logs.len(), 3);
        for pair in logs.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }

        let capped = agg.all_recent_logs(2);
        assert_eq!(capped.len(), 2);
        assert_eq!(capped.last().unwrap().message, "later");
    }

    #[test]
    fn test_file_sinks_split_by_stream() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());

        agg.write(1, "app", LogStream::Stdout, "to stdout");
        agg.write(1, "app", LogStream::Stderr, "to stderr");
        agg.flush();

        let (out_path, err_path) = agg.log_files("app");
        let out = std::fs::read_to_string(out_path).unwrap();
        let err = std::fs::read_to_string(err_path).unwrap();
        assert!(out.contains("to stdout"));
        assert!(!out.contains("to stderr"));
        assert!(err.contains("to stderr"));
    }

    #[test]
    fn test_log_line_format() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());

        agg.write(1, "app", LogStream::Stdout, "payload");
        agg.flush();

        let (out_path, _) = agg.log_files("app");
        let content = std::fs::read_to_string(out_path).unwrap();
        let line = content.lines().next().unwrap();
        let (timestamp, message) = line.split_once(' ').unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
        assert_eq!(message, "payload");
    }

    #[test]
    fn test_remove_process_drops_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());

        agg.write(1, "app", LogStream::Stdout, "line");
        agg.remove_process(1);
        assert!(agg.recent_logs(1, 10).is_empty());
    }

    #[test]
    fn test_bus_receives_entries() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        bus.on(crate::events::Topic::LogEntry, move |event| {
            if let Event::LogEntry(entry) = event {
                seen_clone.lock().push(entry.message.clone());
            }
        });

        let agg = LogAggregator::new(
            dir.path().to_path_buf(),
            LogConfiguration::default(),
            bus,
        );
        agg.write(1, "app", LogStream::Stdout, "observed");

        assert_eq!(*seen.lock(), vec!["observed".to_string()]);
    }

    #[test]
    fn test_override_rotation_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());
        agg.set_override(
            "chatty",
            ProcessLogConfig {
                max_size: Some("1K".into()),
                keep: Some(2),
                compress: Some(false),
            },
        );

        let long_line = "x".repeat(200);
        for _ in 0..10 {
            agg.write(3, "chatty", LogStream::Stdout, &long_line);
        }
        agg.flush();

        let rotated = dir.path().join("chatty-out.log.1");
        assert!(rotated.exists());
    }
}

//! Log aggregation and rotation module

mod aggregator;
mod rotator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use aggregator::{LogAggregator, DEFAULT_RECENT};
pub use rotator::LogRotator;

/// Which child stream a log entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// One captured log line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub process_id: i64,
    pub process_name: String,
    pub stream: LogStream,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

//! NovaPM daemon library
//!
//! Process supervision with health probes, metrics sampling, log
//! aggregation, a plugin host, and multi-host fleet coordination with
//! rolling / canary / blue-green deployment orchestration.

pub mod config;
pub mod cron;
pub mod database;
pub mod error;
pub mod events;
pub mod fleet;
pub mod health;
pub mod ipc;
pub mod logs;
pub mod metrics;
pub mod plugin;
pub mod process;
pub mod supervisor;

// Re-export commonly used types
pub use config::Configuration;
pub use error::{DaemonError, DaemonResult};
pub use events::EventBus;
pub use supervisor::Supervisor;

//! Daemon configuration and filesystem layout
//!
//! Configuration is loaded from a TOML file; every section has serde
//! defaults so a missing file yields a fully usable configuration rooted at
//! `$NOVA_HOME` (default `~/.novapm`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable overriding the daemon root directory.
pub const NOVA_HOME_ENV: &str = "NOVA_HOME";

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,

    /// Daemon root directory and derived paths
    #[serde(default)]
    pub system: SystemConfiguration,

    /// Metrics collection settings
    #[serde(default)]
    pub metrics: MetricsConfiguration,

    /// Log aggregation and rotation settings
    #[serde(default)]
    pub logs: LogConfiguration,

    /// Fleet agent settings (present when this daemon reports to a controller)
    #[serde(default)]
    pub agent: Option<AgentConfiguration>,

    /// Fleet controller settings (present when running as the controller)
    #[serde(default)]
    pub controller: Option<ControllerConfiguration>,
}

impl Configuration {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        config.system.ensure_directories()?;
        Ok(config)
    }

    /// Build a default configuration rooted at `$NOVA_HOME`.
    pub fn default_paths() -> Result<Self> {
        let config = Configuration {
            debug: false,
            system: SystemConfiguration::default(),
            metrics: MetricsConfiguration::default(),
            logs: LogConfiguration::default(),
            agent: None,
            controller: None,
        };
        config.system.ensure_directories()?;
        Ok(config)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debug: false,
            system: SystemConfiguration::default(),
            metrics: MetricsConfiguration::default(),
            logs: LogConfiguration::default(),
            agent: None,
            controller: None,
        }
    }
}

/// Daemon root directory and derived paths
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfiguration {
    /// Root directory, defaults to `$NOVA_HOME` or `~/.novapm`
    #[serde(default = "default_root_directory")]
    pub root_directory: PathBuf,
}

impl SystemConfiguration {
    /// Directory holding child process logs and the daemon log.
    pub fn log_directory(&self) -> PathBuf {
        self.root_directory.join("logs")
    }

    /// SQLite database path.
    pub fn database_path(&self) -> PathBuf {
        self.root_directory.join("novapm.db")
    }

    /// Unix socket the IPC server listens on.
    pub fn socket_path(&self) -> PathBuf {
        self.root_directory.join("daemon.sock")
    }

    /// Directory holding per-plugin storage files.
    pub fn plugin_directory(&self) -> PathBuf {
        self.root_directory.join("plugins")
    }

    fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_directory)?;
        std::fs::create_dir_all(self.log_directory())?;
        std::fs::create_dir_all(self.plugin_directory())?;
        Ok(())
    }
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            root_directory: default_root_directory(),
        }
    }
}

fn default_root_directory() -> PathBuf {
    if let Ok(dir) = std::env::var(NOVA_HOME_ENV) {
        return PathBuf::from(dir);
    }
    home::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".novapm")
}

/// Metrics collection settings
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfiguration {
    /// Sampling interval in milliseconds
    #[serde(default = "default_metrics_interval_ms")]
    pub interval_ms: u64,
}

impl MetricsConfiguration {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for MetricsConfiguration {
    fn default() -> Self {
        Self {
            interval_ms: default_metrics_interval_ms(),
        }
    }
}

fn default_metrics_interval_ms() -> u64 {
    5000
}

/// Log aggregation and rotation settings
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfiguration {
    /// Rotation threshold, human size string ("100M")
    #[serde(default = "default_rotation_size")]
    pub max_size: String,

    /// Number of rotated files to keep
    #[serde(default = "default_rotation_keep")]
    pub keep: usize,

    /// Gzip rotated files
    #[serde(default)]
    pub compress: bool,
}

impl LogConfiguration {
    /// Rotation threshold in bytes.
    pub fn max_size_bytes(&self) -> u64 {
        parse_size(&self.max_size).unwrap_or(100 * 1024 * 1024)
    }
}

impl Default for LogConfiguration {
    fn default() -> Self {
        Self {
            max_size: default_rotation_size(),
            keep: default_rotation_keep(),
            compress: false,
        }
    }
}

fn default_rotation_size() -> String {
    "100M".to_string()
}

fn default_rotation_keep() -> usize {
    10
}

/// Fleet agent settings
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfiguration {
    /// Controller host; when absent, discovery falls back to env / DNS SRV
    pub controller_host: Option<String>,

    /// Controller port
    pub controller_port: Option<u16>,

    /// Shared bearer token presented on register
    #[serde(default)]
    pub token: Option<String>,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Reconnect interval in milliseconds
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Reconnect attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_max_reconnect_attempts() -> u32 {
    50
}

/// Fleet controller settings
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfiguration {
    /// Host to bind to
    #[serde(default = "default_controller_host")]
    pub host: String,

    /// Port to listen on for agent connections
    #[serde(default = "default_agent_port")]
    pub port: u16,

    /// Allowed bearer tokens; empty disables authentication
    #[serde(default)]
    pub auth_tokens: Vec<String>,
}

impl Default for ControllerConfiguration {
    fn default() -> Self {
        Self {
            host: default_controller_host(),
            port: default_agent_port(),
            auth_tokens: Vec::new(),
        }
    }
}

fn default_controller_host() -> String {
    "0.0.0.0".into()
}

fn default_agent_port() -> u16 {
    crate::fleet::DEFAULT_AGENT_PORT
}

/// Parse a human size string ("512", "64K", "100M", "2G") into bytes.
pub fn parse_size(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (digits, suffix) = match trimmed.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };

    let base: u64 = digits.parse().ok()?;
    let multiplier = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        _ => return None,
    };

    base.checked_mul(multiplier)
}

/// Parse a human duration string ("30s", "5m", "1500ms") with a fallback.
pub fn parse_duration_or(input: &str, fallback: Duration) -> Duration {
    duration_str::parse(input).unwrap_or(fallback)
}

/// Resolve a path against a base directory unless it is already absolute.
pub fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("64K"), Some(64 * 1024));
        assert_eq!(parse_size("100M"), Some(100 * 1024 * 1024));
        assert_eq!(parse_size("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("10MB"), Some(10 * 1024 * 1024));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("abc"), None);
    }

    #[test]
    fn test_parse_duration_fallback() {
        assert_eq!(
            parse_duration_or("30s", Duration::from_secs(1)),
            Duration::from_secs(30)
        );
        assert_eq!(
            parse_duration_or("garbage", Duration::from_secs(7)),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_log_configuration_defaults() {
        let config = LogConfiguration::default();
        assert_eq!(config.max_size_bytes(), 100 * 1024 * 1024);
        assert_eq!(config.keep, 10);
        assert!(!config.compress);
    }

    #[test]
    fn test_parse_toml_sections() {
        let raw = r#"
            debug = true

            [metrics]
            interval_ms = 1000

            [logs]
            max_size = "10M"
            keep = 3
            compress = true

            [controller]
            host = "127.0.0.1"
            port = 9700
        "#;

        let config: Configuration = toml::from_str(raw).unwrap();
        assert!(config.debug);
        assert_eq!(config.metrics.interval_ms, 1000);
        assert_eq!(config.logs.max_size_bytes(), 10 * 1024 * 1024);
        assert_eq!(config.logs.keep, 3);
        let controller = config.controller.unwrap();
        assert_eq!(controller.host, "127.0.0.1");
        assert_eq!(controller.port, 9700);
    }
}

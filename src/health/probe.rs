//! Health probes
//!
//! One probe attempt per call, bounded by the configured timeout. Probes
//! never error out; every failure mode folds into `false`.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

use super::{HealthCheckConfig, ProbeType};

/// Default host probed when the config names none
const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port probed when the config names none
const DEFAULT_PORT: u16 = 80;

/// Run one probe attempt.
pub async fn run_probe(config: &HealthCheckConfig) -> bool {
    let timeout = config.timeout();
    match config.check_type {
        ProbeType::Http => http_probe(config, timeout).await,
        ProbeType::Tcp => tcp_probe(config, timeout).await,
        ProbeType::Script => script_probe(config, timeout).await,
    }
}

async fn http_probe(config: &HealthCheckConfig, timeout: Duration) -> bool {
    let host = config.host.as_deref().unwrap_or(DEFAULT_HOST);
    let port = config.port.unwrap_or(DEFAULT_PORT);
    let path = config.path.as_deref().unwrap_or("/");
    let url = format!("http://{}:{}{}", host, port, path);

    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            debug!("HTTP probe client build failed: {}", e);
            return false;
        }
    };

    match client.get(&url).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!("HTTP probe to {} failed: {}", url, e);
            false
        }
    }
}

async fn tcp_probe(config: &HealthCheckConfig, timeout: Duration) -> bool {
    let host = config.host.as_deref().unwrap_or(DEFAULT_HOST);
    let port = config.port.unwrap_or(DEFAULT_PORT);

    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

async fn script_probe(config: &HealthCheckConfig, timeout: Duration) -> bool {
    let Some(script) = config.script.as_deref() else {
        return false;
    };

    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    // Deadline overruns drop the future, which reaps the child
    command.kill_on_drop(true);

    match tokio::time::timeout(timeout, command.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            debug!("Script probe spawn failed: {}", e);
            false
        }
        Err(_) => false,
    }
}

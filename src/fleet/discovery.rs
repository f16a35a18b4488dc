//! Controller endpoint discovery
//!
//! Resolution order: explicit configuration, then `NOVA_*` environment
//! variables, then a DNS SRV lookup of `_novapm._tcp.<service>`. Every
//! stage that cannot produce a complete endpoint yields nothing and the
//! next stage runs.

use std::time::Duration;

use tracing::{debug, warn};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::AgentConfiguration;

/// Environment variables consulted by env discovery
pub const ENV_CONTROLLER_HOST: &str = "NOVA_CONTROLLER_HOST";
pub const ENV_CONTROLLER_PORT: &str = "NOVA_CONTROLLER_PORT";
pub const ENV_AGENT_PORT: &str = "NOVA_AGENT_PORT";
pub const ENV_AGENT_TOKEN: &str = "NOVA_AGENT_TOKEN";
pub const ENV_HEARTBEAT_INTERVAL: &str = "NOVA_HEARTBEAT_INTERVAL";
pub const ENV_RECONNECT_INTERVAL: &str = "NOVA_RECONNECT_INTERVAL";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "NOVA_MAX_RECONNECT_ATTEMPTS";

/// A resolved controller endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn websocket_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Connection settings resolved from the environment
#[derive(Debug, Clone)]
pub struct EnvSettings {
    pub endpoint: Endpoint,
    pub token: Option<String>,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

/// Discover the controller endpoint for an agent.
pub async fn discover(config: Option<&AgentConfiguration>, service: Option<&str>) -> Option<Endpoint> {
    if let Some(config) = config {
        if let (Some(host), Some(port)) = (&config.controller_host, config.controller_port) {
            return Some(Endpoint {
                host: host.clone(),
                port,
            });
        }
    }

    if let Some(settings) = from_env() {
        return Some(settings.endpoint);
    }

    if let Some(service) = service {
        return srv_lookup(service).await;
    }

    None
}

/// Environment-variable discovery. Missing host or port, a non-integer
/// port, or an out-of-range port yields nothing.
pub fn from_env() -> Option<EnvSettings> {
    let host = std::env::var(ENV_CONTROLLER_HOST).ok()?;
    let port_raw = std::env::var(ENV_CONTROLLER_PORT).ok()?;
    let port: u32 = port_raw.parse().ok()?;
    if port == 0 || port > u16::MAX as u32 {
        return None;
    }

    let heartbeat_ms = env_u64(ENV_HEARTBEAT_INTERVAL, 30_000);
    let reconnect_ms = env_u64(ENV_RECONNECT_INTERVAL, 5000);
    let max_attempts = env_u64(ENV_MAX_RECONNECT_ATTEMPTS, 50) as u32;

    Some(EnvSettings {
        endpoint: Endpoint {
            host,
            port: port as u16,
        },
        token: std::env::var(ENV_AGENT_TOKEN).ok(),
        heartbeat_interval: Duration::from_millis(heartbeat_ms),
        reconnect_interval: Duration::from_millis(reconnect_ms),
        max_reconnect_attempts: max_attempts,
    })
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

/// DNS SRV discovery: `_novapm._tcp.<service>`, records sorted ascending by
/// priority then descending by weight. Empty results and lookup errors
/// yield nothing.
pub async fn srv_lookup(service: &str) -> Option<Endpoint> {
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            warn!("SRV discovery unavailable: {}", e);
            return None;
        }
    };

    let name = format!("_novapm._tcp.{}", service);
    let lookup = match resolver.srv_lookup(name.clone()).await {
        Ok(lookup) => lookup,
        Err(e) => {
            debug!("SRV lookup of {} failed: {}", name, e);
            return None;
        }
    };

    let mut records: Vec<_> = lookup.iter().collect();
    if records.is_empty() {
        return None;
    }

    sort_srv(&mut records);

    let best = records.first()?;
    Some(Endpoint {
        host: best.target().to_utf8().trim_end_matches('.').to_string(),
        port: best.port(),
    })
}

fn sort_srv(records: &mut [&trust_dns_resolver::proto::rr::rdata::SRV]) {
    records.sort_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then(b.weight().cmp(&a.weight()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use trust_dns_resolver::proto::rr::rdata::SRV;
    use trust_dns_resolver::proto::rr::Name;

    fn srv(priority: u16, weight: u16, port: u16) -> SRV {
        SRV::new(priority, weight, port, Name::from_ascii("host.example.").unwrap())
    }

    #[test]
    fn test_srv_ordering_prefers_low_priority_high_weight() {
        let a = srv(10, 5, 1000);
        let b = srv(5, 1, 2000);
        let c = srv(5, 9, 3000);

        let mut records = vec![&a, &b, &c];
        sort_srv(&mut records);

        // Priority 5 first; within priority 5 the heavier weight wins
        assert_eq!(records[0].port(), 3000);
        assert_eq!(records[1].port(), 2000);
        assert_eq!(records[2].port(), 1000);
    }

    #[test]
    fn test_env_discovery_requires_valid_port() {
        // Env-var tests mutate process state; run the variants sequentially
        std::env::remove_var(ENV_CONTROLLER_HOST);
        std::env::remove_var(ENV_CONTROLLER_PORT);
        assert!(from_env().is_none());

        std::env::set_var(ENV_CONTROLLER_HOST, "controller.local");
        assert!(from_env().is_none(), "port missing");

        std::env::set_var(ENV_CONTROLLER_PORT, "not-a-number");
        assert!(from_env().is_none(), "port not an integer");

        std::env::set_var(ENV_CONTROLLER_PORT, "70000");
        assert!(from_env().is_none(), "port out of range");

        std::env::set_var(ENV_CONTROLLER_PORT, "9616");
        let settings = from_env().unwrap();
        assert_eq!(settings.endpoint.host, "controller.local");
        assert_eq!(settings.endpoint.port, 9616);
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(30_000));
        assert_eq!(settings.max_reconnect_attempts, 50);

        std::env::remove_var(ENV_CONTROLLER_HOST);
        std::env::remove_var(ENV_CONTROLLER_PORT);
    }

    #[tokio::test]
    async fn test_explicit_config_wins() {
        let config = AgentConfiguration {
            controller_host: Some("10.0.0.5".into()),
            controller_port: Some(9000),
            token: None,
            heartbeat_interval_ms: 30_000,
            reconnect_interval_ms: 5000,
            max_reconnect_attempts: 50,
        };

        let endpoint = discover(Some(&config), None).await.unwrap();
        assert_eq!(endpoint.host, "10.0.0.5");
        assert_eq!(endpoint.port, 9000);
        assert_eq!(endpoint.websocket_url(), "ws://10.0.0.5:9000");
    }
}

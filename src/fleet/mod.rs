//! Fleet coordination module
//!
//! The agent/controller channel (registration, heartbeats, metrics,
//! request/response commands), controller-side agent bookkeeping, endpoint
//! discovery, and the deployment orchestrator that sequences work across
//! remote agents.

mod agent;
mod controller;
mod deploy;
mod discovery;
mod protocol;

pub use agent::{Agent, AgentConfig, AgentEvent, CommandHandler, InfoSource};
pub use controller::{
    AgentStatus, CommandTransport, ConnectedAgent, Controller, ControllerEvent,
    DEFAULT_COMMAND_TIMEOUT,
};
pub use deploy::{
    DeployStrategy, DeploymentOrchestrator, DeploymentPlan, DeploymentStatus,
    DEFAULT_CANARY_PERCENT, DEPLOY_COMMAND_TIMEOUT,
};
pub use discovery::{discover, from_env, srv_lookup, Endpoint, EnvSettings};
pub use protocol::{
    constant_time_eq, CommandData, CommandResultData, Envelope, HeartbeatData, MessageType,
    MetricsData, RegisterData, ServerInfo, AUTH_CLOSE_CODE, DEFAULT_AGENT_PORT,
    DEFAULT_CONTROLLER_PORT,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfiguration;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn controller_config(tokens: Vec<String>) -> ControllerConfiguration {
        ControllerConfiguration {
            host: "127.0.0.1".into(),
            port: 0,
            auth_tokens: tokens,
        }
    }

    fn info_source() -> InfoSource {
        Arc::new(|| {
            (
                ServerInfo {
                    hostname: "test-host".into(),
                    version: "0.1.0".into(),
                    uptime_secs: 5,
                    cpu_usage: 1.5,
                    memory_usage: 12.0,
                    process_count: 2,
                    metadata: Default::default(),
                },
                vec![json!({ "name": "app", "status": "online" })],
            )
        })
    }

    fn agent_config(port: u16, token: Option<String>) -> AgentConfig {
        AgentConfig {
            agent_id: "agent-1".into(),
            endpoint: Endpoint {
                host: "127.0.0.1".into(),
                port,
            },
            token,
            heartbeat_interval: Duration::from_millis(100),
            reconnect_interval: Duration::from_millis(100),
            max_reconnect_attempts: 1,
        }
    }

    async fn wait_for_join(controller: &Arc<Controller>, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while controller.agent_count() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("agent never joined");
    }

    #[tokio::test]
    async fn test_register_and_heartbeat() {
        let shutdown = CancellationToken::new();
        let controller = Controller::new(controller_config(vec![]), shutdown.child_token());
        let addr = controller.start().await.unwrap();

        let mut events = controller.events();

        let agent = Agent::new(
            agent_config(addr.port(), None),
            info_source(),
            shutdown.child_token(),
        );
        agent.start();

        wait_for_join(&controller, 1).await;

        let connected = controller.agent("agent-1").unwrap();
        assert_eq!(connected.hostname, "test-host");
        assert_eq!(connected.status, AgentStatus::Online);

        // Heartbeats carry the process snapshot
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ControllerEvent::AgentHeartbeat { agent_id }) = events.recv().await {
                    assert_eq!(agent_id, "agent-1");
                    return;
                }
            }
        })
        .await
        .unwrap();

        let connected = controller.agent("agent-1").unwrap();
        assert_eq!(connected.processes.len(), 1);

        agent.stop().await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let shutdown = CancellationToken::new();
        let controller = Controller::new(controller_config(vec![]), shutdown.child_token());
        let addr = controller.start().await.unwrap();

        let agent = Agent::new(
            agent_config(addr.port(), None),
            info_source(),
            shutdown.child_token(),
        );
        agent.on_command("deploy", |params| {
            Box::pin(async move {
                Ok(json!({ "success": true, "version": params["version"] }))
            })
        });
        agent.start();
        wait_for_join(&controller, 1).await;

        let result = controller
            .send_command(
                "agent-1",
                "deploy",
                json!({ "version": "2.0" }),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["version"], "2.0");

        // Unknown commands report success=false with a message
        let err = controller
            .send_command("agent-1", "nope", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown command nope"));

        // Handler errors propagate as rejections
        agent.on_command("explode", |_| {
            Box::pin(async move { Err("handler blew up".to_string()) })
        });
        let err = controller
            .send_command("agent-1", "explode", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("handler blew up"));

        agent.stop().await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_command_to_missing_agent() {
        let shutdown = CancellationToken::new();
        let controller = Controller::new(controller_config(vec![]), shutdown.child_token());
        controller.start().await.unwrap();

        let err = controller
            .send_command("ghost", "deploy", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::DaemonError::AgentNotFound(_)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let shutdown = CancellationToken::new();
        let controller = Controller::new(controller_config(vec![]), shutdown.child_token());
        let addr = controller.start().await.unwrap();

        let agent = Agent::new(
            agent_config(addr.port(), None),
            info_source(),
            shutdown.child_token(),
        );
        agent.on_command("slow", |_| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!({}))
            })
        });
        agent.start();
        wait_for_join(&controller, 1).await;

        let err = controller
            .send_command("agent-1", "slow", json!({}), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::DaemonError::Timeout));

        // The channel still serves later commands
        agent.on_command("fast", |_| Box::pin(async move { Ok(json!(1)) }));
        let result = controller
            .send_command("agent-1", "fast", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, json!(1));

        agent.stop().await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_auth_rejects_bad_token() {
        let shutdown = CancellationToken::new();
        let controller = Controller::new(
            controller_config(vec!["right-token".into()]),
            shutdown.child_token(),
        );
        let addr = controller.start().await.unwrap();

        let agent = Agent::new(
            agent_config(addr.port(), Some("wrong-token".into())),
            info_source(),
            shutdown.child_token(),
        );
        let mut events = agent.events();
        agent.start();

        // The connection is closed before the agent is recorded; the agent
        // exhausts its single reconnect attempt
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(AgentEvent::ReconnectFailed) = events.recv().await {
                    return;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(controller.agent_count(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_auth_accepts_valid_token() {
        let shutdown = CancellationToken::new();
        let controller = Controller::new(
            controller_config(vec!["token-a".into(), "token-b".into()]),
            shutdown.child_token(),
        );
        let addr = controller.start().await.unwrap();

        let agent = Agent::new(
            agent_config(addr.port(), Some("token-b".into())),
            info_source(),
            shutdown.child_token(),
        );
        agent.start();
        wait_for_join(&controller, 1).await;
        assert_eq!(controller.agent_count(), 1);

        agent.stop().await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reconnect_failed_fires_exactly_once() {
        let controller_shutdown = CancellationToken::new();
        let controller =
            Controller::new(controller_config(vec![]), controller_shutdown.clone());
        let addr = controller.start().await.unwrap();

        let agent_shutdown = CancellationToken::new();
        let agent = Agent::new(
            agent_config(addr.port(), None),
            info_source(),
            agent_shutdown.child_token(),
        );
        let mut events = agent.events();
        agent.start();
        wait_for_join(&controller, 1).await;

        // Remote side goes away entirely
        controller.stop().await;

        let mut disconnected = 0;
        let mut failed = 0;
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(AgentEvent::Disconnected) => disconnected += 1,
                    Ok(AgentEvent::ReconnectFailed) => {
                        failed += 1;
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
        })
        .await;

        assert!(disconnected >= 1);
        assert_eq!(failed, 1);

        // No further events after exhaustion
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(
            events.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_metrics_push_and_flush() {
        let shutdown = CancellationToken::new();
        let controller = Controller::new(controller_config(vec![]), shutdown.child_token());
        let addr = controller.start().await.unwrap();

        let agent = Agent::new(
            agent_config(addr.port(), None),
            info_source(),
            shutdown.child_token(),
        );
        agent.start();
        wait_for_join(&controller, 1).await;
        let mut events = controller.events();

        agent.push_metric(crate::metrics::ProcessMetrics::zeroed(1));
        agent.push_metric(crate::metrics::ProcessMetrics::zeroed(2));
        assert_eq!(agent.buffered_metrics(), 2);
        agent.flush_metrics();
        assert_eq!(agent.buffered_metrics(), 0);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ControllerEvent::AgentMetrics { agent_id, samples }) =
                    events.recv().await
                {
                    assert_eq!(agent_id, "agent-1");
                    assert_eq!(samples.len(), 2);
                    return;
                }
            }
        })
        .await
        .unwrap();

        agent.stop().await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_flush_while_disconnected_drops() {
        let shutdown = CancellationToken::new();
        let agent = Agent::new(
            agent_config(1, None), // nothing listening
            info_source(),
            shutdown.child_token(),
        );

        agent.push_metric(crate::metrics::ProcessMetrics::zeroed(1));
        agent.flush_metrics();
        assert_eq!(agent.buffered_metrics(), 0);
    }

    #[tokio::test]
    async fn test_explicit_stop_no_reconnect() {
        let shutdown = CancellationToken::new();
        let controller = Controller::new(controller_config(vec![]), shutdown.child_token());
        let addr = controller.start().await.unwrap();

        let agent = Agent::new(
            agent_config(addr.port(), None),
            info_source(),
            CancellationToken::new(),
        );
        let mut events = agent.events();
        agent.start();
        wait_for_join(&controller, 1).await;

        agent.stop().await;

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(AgentEvent::Stopped) = events.recv().await {
                    return;
                }
            }
        })
        .await
        .unwrap();

        // The controller drops the entry once the socket closes
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if controller.agent_count() == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .unwrap();

        // Grace period: no reconnect-related events appear
        tokio::time::sleep(Duration::from_millis(400)).await;
        loop {
            match events.try_recv() {
                Ok(AgentEvent::ReconnectFailed) => panic!("reconnect after explicit stop"),
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_broadcast_command() {
        let shutdown = CancellationToken::new();
        let controller = Controller::new(controller_config(vec![]), shutdown.child_token());
        let addr = controller.start().await.unwrap();

        for i in 0..2 {
            let mut config = agent_config(addr.port(), None);
            config.agent_id = format!("agent-{}", i);
            let agent = Agent::new(config, info_source(), shutdown.child_token());
            agent.on_command("ping", |_| Box::pin(async move { Ok(json!("pong")) }));
            agent.start();
            wait_for_join(&controller, i + 1).await;
        }

        let results = controller
            .broadcast_command("ping", json!({}), Duration::from_secs(5))
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| matches!(r, Ok(v) if v == "pong")));

        shutdown.cancel();
    }
}

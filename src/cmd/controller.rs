//! Fleet controller command

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use novapm::fleet::{Controller, ControllerEvent, DeploymentOrchestrator};

/// Run the fleet controller
pub async fn run(config_path: Option<&str>) -> Result<()> {
    let config = super::root::load_config(config_path)?;
    let controller_config = config.controller.clone().unwrap_or_default();

    let shutdown = CancellationToken::new();
    let controller = Controller::new(controller_config, shutdown.child_token());
    let addr = controller.start().await?;
    info!("Fleet controller listening on {}", addr);

    // The orchestrator drives deployments over the controller's channel
    let transport: Arc<dyn novapm::fleet::CommandTransport> = controller.clone();
    let _orchestrator = DeploymentOrchestrator::new(transport);

    // Surface fleet membership changes in the daemon log
    let mut events = controller.events();
    let log_shutdown = shutdown.child_token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = log_shutdown.cancelled() => return,
                event = events.recv() => {
                    match event {
                        Ok(ControllerEvent::AgentJoin { agent_id }) => {
                            info!("Agent joined: {}", agent_id);
                        }
                        Ok(ControllerEvent::AgentLeave { agent_id }) => {
                            warn!("Agent left: {}", agent_id);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    warn!("Received shutdown signal, closing agent connections...");

    controller.stop().await;
    shutdown.cancel();

    info!("Controller stopped");
    Ok(())
}

//! Deployment orchestration
//!
//! Sequences deploy / health-check / rollback commands across remote agents
//! under three strategies. The orchestrator only ever talks through the
//! controller's command transport; every remote interaction is a
//! request/response command with a 60 second deadline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DaemonError, DaemonResult};

use super::controller::CommandTransport;

/// Deadline for each remote deployment command
pub const DEPLOY_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Pause between servers under the rolling strategy
const ROLLING_PACE: Duration = Duration::from_millis(5000);

/// Default canary share, percent
pub const DEFAULT_CANARY_PERCENT: usize = 10;

/// Deployment strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployStrategy {
    Rolling,
    Canary,
    BlueGreen,
}

/// Plan lifecycle; monotonic pending -> in-progress -> terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

/// The unit of work for one multi-server deployment
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPlan {
    pub id: String,
    pub strategy: DeployStrategy,
    pub servers: Vec<String>,
    pub config: Value,
    pub status: DeploymentStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeploymentPlan {
    fn new(strategy: DeployStrategy, servers: Vec<String>, config: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy,
            total_steps: servers.len(),
            servers,
            config,
            status: DeploymentStatus::Pending,
            current_step: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Sequences deployments across the fleet
pub struct DeploymentOrchestrator {
    transport: Arc<dyn CommandTransport>,
    plans: DashMap<String, DeploymentPlan>,
}

impl DeploymentOrchestrator {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self {
            transport,
            plans: DashMap::new(),
        }
    }

    /// Look up a plan by id.
    pub fn plan(&self, id: &str) -> Option<DeploymentPlan> {
        self.plans.get(id).map(|entry| entry.value().clone())
    }

    /// Every known plan.
    pub fn plans(&self) -> Vec<DeploymentPlan> {
        self.plans.iter().map(|entry| entry.value().clone()).collect()
    }

    // ========================================================================
    // Strategies
    // ========================================================================

    /// Deploy servers one at a time, health-gating each step. Any failure
    /// fails the plan and rolls back the servers that already passed —
    /// including the failing server when its health check failed.
    pub async fn deploy_rolling(
        &self,
        servers: Vec<String>,
        config: Value,
    ) -> DaemonResult<DeploymentPlan> {
        let mut plan = DeploymentPlan::new(DeployStrategy::Rolling, servers.clone(), config.clone());
        plan.status = DeploymentStatus::InProgress;
        self.store(&plan);

        let mut passed: Vec<String> = Vec::new();

        for (index, server) in servers.iter().enumerate() {
            plan.current_step = index + 1;
            self.store(&plan);

            if let Err(message) = self.deploy_one(server, &config).await {
                plan.errors.push(message);
                // Deploy itself failed; the failing server got nothing to
                // roll back
                self.rollback_servers(&mut plan, &passed).await;
                return Ok(self.fail(plan));
            }
            passed.push(server.clone());

            if let Err(message) = self.check_one(server).await {
                plan.errors.push(message);
                self.rollback_servers(&mut plan, &passed).await;
                return Ok(self.fail(plan));
            }

            if index + 1 < servers.len() {
                tokio::time::sleep(ROLLING_PACE).await;
            }
        }

        Ok(self.complete(plan))
    }

    /// Deploy a canary subset first; only when every canary passes do the
    /// remaining servers deploy sequentially. Phase-two failures fail the
    /// plan but are not rolled back automatically — operators trigger
    /// `rollback` explicitly.
    pub async fn deploy_canary(
        &self,
        servers: Vec<String>,
        config: Value,
        percent: usize,
    ) -> DaemonResult<DeploymentPlan> {
        let mut plan = DeploymentPlan::new(DeployStrategy::Canary, servers.clone(), config.clone());
        plan.status = DeploymentStatus::InProgress;
        self.store(&plan);

        let canary_count = ((servers.len() * percent) / 100).max(1);
        let canary: Vec<String> = servers.iter().take(canary_count).cloned().collect();
        info!(
            "Canary deployment {}: {} of {} servers",
            plan.id,
            canary.len(),
            servers.len()
        );

        // Phase 1: deploy the whole canary set
        for server in &canary {
            plan.current_step += 1;
            self.store(&plan);

            if let Err(message) = self.deploy_one(server, &config).await {
                plan.errors.push(message);
                self.rollback_servers(&mut plan, &canary).await;
                return Ok(self.fail(plan));
            }
        }

        // Then health-check the whole canary set
        for server in &canary {
            if self.check_one(server).await.is_err() {
                plan.errors.push("Canary health check failed".to_string());
                self.rollback_servers(&mut plan, &canary).await;
                return Ok(self.fail(plan));
            }
        }

        // Phase 2: the rest, sequentially, no automatic rollback
        for server in servers.iter().skip(canary_count) {
            plan.current_step += 1;
            self.store(&plan);

            if let Err(message) = self.deploy_one(server, &config).await {
                plan.errors.push(message);
                return Ok(self.fail(plan));
            }
            if let Err(message) = self.check_one(server).await {
                plan.errors.push(message);
                return Ok(self.fail(plan));
            }
        }

        Ok(self.complete(plan))
    }

    /// Deploy the green set, health-gate it, then shift traffic: drain every
    /// blue (failures are non-fatal), accept on every green.
    pub async fn deploy_blue_green(
        &self,
        blue: Vec<String>,
        green: Vec<String>,
        config: Value,
    ) -> DaemonResult<DeploymentPlan> {
        let mut all = green.clone();
        all.extend(blue.iter().cloned());

        let mut plan = DeploymentPlan::new(DeployStrategy::BlueGreen, all, config.clone());
        plan.status = DeploymentStatus::InProgress;
        self.store(&plan);

        // Step 1: deploy green
        for server in &green {
            plan.current_step += 1;
            self.store(&plan);

            if let Err(message) = self.deploy_one(server, &config).await {
                plan.errors.push(message);
                self.rollback_servers(&mut plan, &green).await;
                return Ok(self.fail(plan));
            }
        }

        // Step 2: health-check green
        for server in &green {
            if let Err(message) = self.check_one(server).await {
                plan.errors.push(message);
                self.rollback_servers(&mut plan, &green).await;
                return Ok(self.fail(plan));
            }
        }

        // Step 3: shift traffic
        for server in &blue {
            if let Err(e) = self
                .transport
                .send_command(server, "traffic.drain", json!({}), DEPLOY_COMMAND_TIMEOUT)
                .await
            {
                warn!("Traffic drain on {} failed: {}", server, e);
            }
        }

        for server in &green {
            if let Err(e) = self
                .transport
                .send_command(server, "traffic.accept", json!({}), DEPLOY_COMMAND_TIMEOUT)
                .await
            {
                plan.errors
                    .push(format!("Traffic accept on {} failed: {}", server, e));
            }
        }

        // Accept failures surface on the plan; a plan with errors cannot
        // report success
        if plan.errors.is_empty() {
            Ok(self.complete(plan))
        } else {
            Ok(self.fail(plan))
        }
    }

    /// Roll a finished plan back across its full server list, in order.
    pub async fn rollback(&self, id: &str) -> DaemonResult<DeploymentPlan> {
        let mut plan = self
            .plan(id)
            .ok_or_else(|| DaemonError::DeploymentNotFound(id.to_string()))?;

        let servers = plan.servers.clone();
        self.rollback_servers(&mut plan, &servers).await;

        plan.status = DeploymentStatus::RolledBack;
        plan.completed_at = Some(Utc::now());
        self.store(&plan);
        Ok(plan)
    }

    // ========================================================================
    // Internal
    // ========================================================================

    async fn deploy_one(&self, server: &str, config: &Value) -> Result<(), String> {
        match self
            .transport
            .send_command(server, "deploy", config.clone(), DEPLOY_COMMAND_TIMEOUT)
            .await
        {
            Ok(result) if result.get("success").and_then(Value::as_bool) == Some(true) => Ok(()),
            Ok(result) => Err(format!(
                "Deploy to {} failed: {}",
                server,
                result
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("deployment rejected")
            )),
            Err(e) => Err(format!("Deploy to {} failed: {}", server, e)),
        }
    }

    async fn check_one(&self, server: &str) -> Result<(), String> {
        match self
            .transport
            .send_command(server, "health.check", json!({}), DEPLOY_COMMAND_TIMEOUT)
            .await
        {
            Ok(result) if result.get("healthy").and_then(Value::as_bool) == Some(true) => Ok(()),
            Ok(_) => Err(format!("Health check on {} failed", server)),
            Err(e) => Err(format!("Health check on {} failed: {}", server, e)),
        }
    }

    /// Send `deploy.rollback` to each server; failures are recorded on the
    /// plan but never propagate.
    async fn rollback_servers(&self, plan: &mut DeploymentPlan, servers: &[String]) {
        for server in servers {
            if let Err(e) = self
                .transport
                .send_command(
                    server,
                    "deploy.rollback",
                    json!({ "deploymentId": plan.id }),
                    DEPLOY_COMMAND_TIMEOUT,
                )
                .await
            {
                plan.errors
                    .push(format!("Rollback of {} failed: {}", server, e));
            }
        }
    }

    fn store(&self, plan: &DeploymentPlan) {
        self.plans.insert(plan.id.clone(), plan.clone());
    }

    fn fail(&self, mut plan: DeploymentPlan) -> DeploymentPlan {
        plan.status = DeploymentStatus::Failed;
        plan.completed_at = Some(Utc::now());
        self.store(&plan);
        plan
    }

    fn complete(&self, mut plan: DeploymentPlan) -> DeploymentPlan {
        plan.status = DeploymentStatus::Completed;
        plan.completed_at = Some(Utc::now());
        self.store(&plan);
        plan
    }
}

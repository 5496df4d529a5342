// Promotion Engine
// Deploys versions to environments, verifies health and rolls back on failure

use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::promotion::delegates::{CommandDeployer, CommandHealthCheck, Deployer, HealthCheck};
use crate::promotion::state::{
    EnvironmentState, HealthStatus, PromotionError, PromotionPhase, PromotionResult,
    PromotionStatus,
};
use crate::promotion::store::StateStore;
use crate::workflow::models::{EnvironmentSpec, WorkflowSpec};

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Health policy for promotions
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionConfig {
    /// Health checks to try before rolling back (at least 1)
    pub health_check_attempts: u32,
    /// Wait between failed health checks
    pub health_check_interval: Duration,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            health_check_attempts: 3,
            health_check_interval: Duration::from_secs(5),
        }
    }
}

impl PromotionConfig {
    pub fn with_health_check_attempts(mut self, attempts: u32) -> Self {
        self.health_check_attempts = attempts.max(1);
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// This policy with an environment's own settings applied on top
    fn overridden_by(&self, env: &EnvironmentSpec) -> Self {
        Self {
            health_check_attempts: env
                .health_check_attempts
                .unwrap_or(self.health_check_attempts)
                .max(1),
            health_check_interval: env
                .health_check_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(self.health_check_interval),
        }
    }
}

/// Promotes versions through environments.
///
/// At most one promotion or rollback runs per environment at a time; later
/// requests queue in arrival order. Different environments proceed in
/// parallel.
pub struct PromotionEngine {
    deployer: Arc<dyn Deployer>,
    health_check: Arc<dyn HealthCheck>,
    store: Arc<dyn StateStore>,
    config: PromotionConfig,
    /// Per-environment overrides, applied over `config` at promotion time
    environments: HashMap<String, EnvironmentSpec>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    progress: Option<ProgressSender>,
}

impl PromotionEngine {
    pub fn new(
        deployer: Arc<dyn Deployer>,
        health_check: Arc<dyn HealthCheck>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            deployer,
            health_check,
            store,
            config: PromotionConfig::default(),
            environments: HashMap::new(),
            locks: Mutex::new(HashMap::new()),
            progress: None,
        }
    }

    /// Engine running the workflow's deploy and health-check commands
    pub fn for_workflow(
        workflow: &WorkflowSpec,
        store: Arc<dyn StateStore>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        let working_dir = working_dir.into();
        let deployer = CommandDeployer::from_environments(&workflow.environments)
            .with_working_dir(working_dir.clone());
        let health_check = CommandHealthCheck::from_environments(&workflow.environments)
            .with_working_dir(working_dir);

        let mut engine = Self::new(Arc::new(deployer), Arc::new(health_check), store);
        for (name, env) in &workflow.environments {
            engine = engine.with_environment(name.clone(), env);
        }
        engine
    }

    pub fn with_config(mut self, config: PromotionConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply an environment's own health policy
    pub fn with_environment(mut self, name: impl Into<String>, env: &EnvironmentSpec) -> Self {
        self.environments.insert(name.into(), env.clone());
        self
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    fn config_for(&self, environment: &str) -> PromotionConfig {
        match self.environments.get(environment) {
            Some(env) => self.config.overridden_by(env),
            None => self.config.clone(),
        }
    }

    async fn lock_for(&self, environment: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(environment.to_string()).or_default())
    }

    /// Current state of an environment (empty if never deployed)
    pub async fn state(&self, environment: &str) -> Result<EnvironmentState, PromotionError> {
        self.load(environment).await
    }

    async fn load(&self, environment: &str) -> Result<EnvironmentState, PromotionError> {
        self.store
            .get(environment)
            .await
            .map(|state| state.unwrap_or_else(|| EnvironmentState::empty(environment)))
            .map_err(|e| PromotionError::Store(e.to_string()))
    }

    async fn persist(&self, state: &EnvironmentState) -> Result<(), PromotionError> {
        self.store
            .put(state)
            .await
            .map_err(|e| PromotionError::Store(e.to_string()))
    }

    fn enter(&self, environment: &str, phase: PromotionPhase, transitions: &mut Vec<PromotionPhase>) {
        transitions.push(phase);
        self.progress.send_event(ExecutionEvent::PromotionPhaseChanged {
            environment: environment.to_string(),
            phase,
        });
    }

    /// Deploy `version` to `environment`, verify it and roll back on failure
    pub async fn promote(&self, environment: &str, version: &str) -> PromotionResult {
        let lock = self.lock_for(environment).await;
        let _guard = lock.lock().await;

        tracing::info!(environment, version, "promotion started");
        self.progress.send_event(ExecutionEvent::PromotionStarted {
            environment: environment.to_string(),
            version: version.to_string(),
        });

        let result = self.run_promotion(environment, version).await;

        match &result.reason {
            None => tracing::info!(environment, version, status = %result.status, "promotion finished"),
            Some(reason) => tracing::warn!(
                environment,
                version,
                status = %result.status,
                reason = %reason,
                "promotion finished"
            ),
        }
        self.progress.send_event(ExecutionEvent::PromotionCompleted {
            environment: environment.to_string(),
            version: version.to_string(),
            status: result.status,
            reason: result.reason.as_ref().map(ToString::to_string),
        });

        result
    }

    async fn run_promotion(&self, environment: &str, version: &str) -> PromotionResult {
        let mut result = PromotionResult {
            environment: environment.to_string(),
            version: version.to_string(),
            status: PromotionStatus::RolledBack,
            reason: None,
            health_check_attempts: 0,
            restored_version: None,
            rollback_healthy: None,
            transitions: vec![PromotionPhase::Idle],
        };

        let mut state = match self.load(environment).await {
            Ok(state) => state,
            Err(e) => {
                self.enter(environment, PromotionPhase::RolledBack, &mut result.transitions);
                result.reason = Some(e);
                return result;
            }
        };

        self.enter(environment, PromotionPhase::Deploying, &mut result.transitions);
        if let Err(message) = self.deployer.apply(environment, version).await {
            tracing::warn!(environment, version, error = %message, "deploy failed");
            result.reason = Some(PromotionError::DeployFailed(message));
            self.roll_back(&mut state, &mut result).await;
            return result;
        }

        self.enter(environment, PromotionPhase::HealthChecking, &mut result.transitions);
        let config = self.config_for(environment);
        let mut healthy = false;

        for attempt in 1..=config.health_check_attempts {
            result.health_check_attempts = attempt;
            let status = self.health_check.check(environment).await;
            healthy = status.is_healthy();
            tracing::debug!(environment, attempt, %status, "health check");
            self.progress.send_event(ExecutionEvent::HealthChecked {
                environment: environment.to_string(),
                attempt,
                healthy,
            });

            if healthy {
                break;
            }
            if attempt < config.health_check_attempts {
                tokio::time::sleep(config.health_check_interval).await;
            }
        }

        if !healthy {
            result.reason = Some(PromotionError::HealthCheckFailed {
                attempts: result.health_check_attempts,
            });
            self.roll_back(&mut state, &mut result).await;
            return result;
        }

        state.record_deployment(version, Utc::now());
        state.health = HealthStatus::Healthy;
        self.enter(environment, PromotionPhase::Promoted, &mut result.transitions);
        result.status = PromotionStatus::Promoted;

        if let Err(e) = self.persist(&state).await {
            tracing::error!(environment, error = %e, "failed to persist promoted state");
            result.reason = Some(e);
        }
        result
    }

    /// Restore the version that was live before the failed promotion.
    ///
    /// The restored version gets one health check; its outcome is recorded
    /// but never retried.
    async fn roll_back(&self, state: &mut EnvironmentState, result: &mut PromotionResult) {
        let environment = state.environment.clone();
        self.enter(&environment, PromotionPhase::RolledBack, &mut result.transitions);
        result.status = PromotionStatus::RolledBack;

        match state.current_version.clone() {
            Some(previous) => {
                tracing::info!(environment = %environment, version = %previous, "restoring previous version");
                let healthy = match self.deployer.apply(&environment, &previous).await {
                    Ok(()) => self.health_check.check(&environment).await.is_healthy(),
                    Err(message) => {
                        tracing::error!(environment = %environment, error = %message, "rollback deploy failed");
                        false
                    }
                };
                state.health = if healthy {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                };
                result.restored_version = Some(previous);
                result.rollback_healthy = Some(healthy);
            }
            None => {
                tracing::warn!(environment = %environment, "nothing to restore");
                state.health = HealthStatus::Unhealthy;
            }
        }

        if let Err(e) = self.persist(state).await {
            tracing::error!(environment = %environment, error = %e, "failed to persist rollback state");
        }
    }

    /// Manually return an environment to its newest prior version.
    ///
    /// The abandoned version is dropped rather than pushed onto the history,
    /// so repeated rollbacks walk further back.
    pub async fn rollback(&self, environment: &str) -> Result<PromotionResult, PromotionError> {
        let lock = self.lock_for(environment).await;
        let _guard = lock.lock().await;

        let mut state = self.load(environment).await?;
        let target = state
            .previous()
            .cloned()
            .ok_or(PromotionError::NoRollbackTarget)?;

        tracing::info!(environment, version = %target.version, "manual rollback");
        let mut transitions = vec![PromotionPhase::Idle];
        self.enter(environment, PromotionPhase::Deploying, &mut transitions);
        self.deployer
            .apply(environment, &target.version)
            .await
            .map_err(PromotionError::DeployFailed)?;

        self.enter(environment, PromotionPhase::HealthChecking, &mut transitions);
        let healthy = self.health_check.check(environment).await.is_healthy();
        self.enter(environment, PromotionPhase::RolledBack, &mut transitions);

        state.history.pop();
        state.current_version = Some(target.version.clone());
        state.deployed_at = Some(Utc::now());
        state.health = if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        self.persist(&state).await?;

        self.progress.send_event(ExecutionEvent::PromotionCompleted {
            environment: environment.to_string(),
            version: target.version.clone(),
            status: PromotionStatus::RolledBack,
            reason: None,
        });

        Ok(PromotionResult {
            environment: environment.to_string(),
            version: target.version.clone(),
            status: PromotionStatus::RolledBack,
            reason: None,
            health_check_attempts: 1,
            restored_version: Some(target.version),
            rollback_healthy: Some(healthy),
            transitions,
        })
    }

    /// Promote `version` through each environment in order, stopping at the
    /// first one that rolls back
    pub async fn promote_through(&self, environments: &[String], version: &str) -> Vec<PromotionResult> {
        let mut results = Vec::with_capacity(environments.len());
        for environment in environments {
            let result = self.promote(environment, version).await;
            let promoted = result.is_promoted();
            results.push(result);
            if !promoted {
                break;
            }
        }
        results
    }
}

impl std::fmt::Debug for PromotionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromotionEngine")
            .field("config", &self.config)
            .field("environments", &self.environments)
            .finish_non_exhaustive()
    }
}

// Promotion Delegates
// Deploy and health-check hooks used by the promotion engine

use crate::promotion::state::HealthStatus;
use crate::runners::Shell;
use crate::workflow::models::EnvironmentSpec;

use indexmap::IndexMap;
use std::path::PathBuf;
use std::process::Stdio;

/// Puts a version live in an environment
#[async_trait::async_trait]
pub trait Deployer: Send + Sync {
    async fn apply(&self, environment: &str, version: &str) -> Result<(), String>;
}

/// Probes an environment after a deployment
#[async_trait::async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, environment: &str) -> HealthStatus;
}

/// Runs each environment's `deploy` command with `DEPLOY_ENVIRONMENT` and
/// `DEPLOY_VERSION` set. Environments without a command deploy trivially.
#[derive(Debug, Clone, Default)]
pub struct CommandDeployer {
    commands: IndexMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_environments(environments: &IndexMap<String, EnvironmentSpec>) -> Self {
        Self {
            commands: environments
                .iter()
                .filter_map(|(name, env)| env.deploy.clone().map(|cmd| (name.clone(), cmd)))
                .collect(),
            working_dir: None,
        }
    }

    pub fn with_command(mut self, environment: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.insert(environment.into(), command.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait::async_trait]
impl Deployer for CommandDeployer {
    async fn apply(&self, environment: &str, version: &str) -> Result<(), String> {
        let Some(command) = self.commands.get(environment) else {
            tracing::debug!(environment, "no deploy command configured");
            return Ok(());
        };

        let mut cmd = Shell::Default.command(command);
        cmd.env("DEPLOY_ENVIRONMENT", environment)
            .env("DEPLOY_VERSION", version)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("failed to run deploy command: {}", e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(format!(
                "deploy command exited with {}: {}",
                code,
                stderr.trim()
            ))
        }
    }
}

/// Runs each environment's `health-check` command; exit 0 means healthy.
/// Environments without a command are reported healthy.
#[derive(Debug, Clone, Default)]
pub struct CommandHealthCheck {
    commands: IndexMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandHealthCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_environments(environments: &IndexMap<String, EnvironmentSpec>) -> Self {
        Self {
            commands: environments
                .iter()
                .filter_map(|(name, env)| {
                    env.health_check.clone().map(|cmd| (name.clone(), cmd))
                })
                .collect(),
            working_dir: None,
        }
    }

    pub fn with_command(mut self, environment: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.insert(environment.into(), command.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait::async_trait]
impl HealthCheck for CommandHealthCheck {
    async fn check(&self, environment: &str) -> HealthStatus {
        let Some(command) = self.commands.get(environment) else {
            return HealthStatus::Healthy;
        };

        let mut cmd = Shell::Default.command(command);
        cmd.env("DEPLOY_ENVIRONMENT", environment)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        match cmd.status().await {
            Ok(status) if status.success() => HealthStatus::Healthy,
            Ok(_) => HealthStatus::Unhealthy,
            Err(e) => {
                tracing::warn!(environment, error = %e, "health check could not run");
                HealthStatus::Unknown
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deployer_passes_environment_and_version() {
        let deployer = CommandDeployer::new().with_command(
            "staging",
            r#"test "$DEPLOY_ENVIRONMENT" = staging && test "$DEPLOY_VERSION" = v2"#,
        );
        assert_eq!(deployer.apply("staging", "v2").await, Ok(()));
        assert!(deployer.apply("staging", "v3").await.is_err());
    }

    #[tokio::test]
    async fn test_deployer_reports_stderr() {
        let deployer = CommandDeployer::new().with_command("prod", "echo 'quota exceeded' >&2; exit 3");
        let err = deployer.apply("prod", "v1").await.unwrap_err();
        assert!(err.contains("exited with 3"));
        assert!(err.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_environment_without_command() {
        assert_eq!(CommandDeployer::new().apply("dev", "v1").await, Ok(()));
        assert_eq!(
            CommandHealthCheck::new().check("dev").await,
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_health_check_exit_status() {
        let checks = CommandHealthCheck::new()
            .with_command("good", "true")
            .with_command("bad", "false");
        assert_eq!(checks.check("good").await, HealthStatus::Healthy);
        assert_eq!(checks.check("bad").await, HealthStatus::Unhealthy);
    }
}

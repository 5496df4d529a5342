// Promotion State
// Persisted environment state and promotion results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Health of a deployed environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A version that was live in an environment at some point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    pub deployed_at: DateTime<Utc>,
}

/// What is currently deployed to an environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub environment: String,
    pub current_version: Option<String>,
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub health: HealthStatus,
    /// Prior versions, oldest first
    #[serde(default)]
    pub history: Vec<VersionRecord>,
}

impl EnvironmentState {
    /// State of an environment nothing was ever deployed to
    pub fn empty(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            current_version: None,
            deployed_at: None,
            health: HealthStatus::Unknown,
            history: Vec::new(),
        }
    }

    /// Make `version` current, pushing the previous version onto the history
    pub fn record_deployment(&mut self, version: impl Into<String>, at: DateTime<Utc>) {
        if let (Some(previous), Some(deployed_at)) =
            (self.current_version.take(), self.deployed_at.take())
        {
            self.history.push(VersionRecord {
                version: previous,
                deployed_at,
            });
        }
        self.current_version = Some(version.into());
        self.deployed_at = Some(at);
    }

    /// Newest prior version, if any
    pub fn previous(&self) -> Option<&VersionRecord> {
        self.history.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromotionStatus {
    Promoted,
    RolledBack,
}

impl fmt::Display for PromotionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromotionStatus::Promoted => write!(f, "promoted"),
            PromotionStatus::RolledBack => write!(f, "rolled-back"),
        }
    }
}

/// Phases of a single promotion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionPhase {
    Idle,
    Deploying,
    HealthChecking,
    Promoted,
    RolledBack,
}

impl fmt::Display for PromotionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PromotionPhase::Idle => "idle",
            PromotionPhase::Deploying => "deploying",
            PromotionPhase::HealthChecking => "health-checking",
            PromotionPhase::Promoted => "promoted",
            PromotionPhase::RolledBack => "rolled-back",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum PromotionError {
    #[error("deployment failed: {0}")]
    DeployFailed(String),

    #[error("health check failed after {attempts} attempt(s)")]
    HealthCheckFailed { attempts: u32 },

    #[error("no previous version to roll back to")]
    NoRollbackTarget,

    #[error("state store error: {0}")]
    Store(String),
}

/// Outcome of promoting (or rolling back) one environment
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionResult {
    pub environment: String,
    /// Version that was requested
    pub version: String,
    pub status: PromotionStatus,
    pub reason: Option<PromotionError>,
    pub health_check_attempts: u32,
    /// Version live after a rollback
    pub restored_version: Option<String>,
    /// Result of the single post-rollback health check
    pub rollback_healthy: Option<bool>,
    /// Phases passed through, starting at `Idle`
    pub transitions: Vec<PromotionPhase>,
}

impl PromotionResult {
    pub fn is_promoted(&self) -> bool {
        self.status == PromotionStatus::Promoted
    }
}

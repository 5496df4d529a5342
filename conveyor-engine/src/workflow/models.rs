use crate::value::Value;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// A workflow definition: ordered jobs plus the environments they deploy to.
///
/// This represents the top-level structure of a workflow YAML file and is
/// immutable once loaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// The name of the workflow
    #[serde(default)]
    pub name: Option<String>,

    /// Workflow-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Run defaults that command-line flags may override
    #[serde(default)]
    pub defaults: Defaults,

    /// The jobs that make up this workflow, in declared order
    #[serde(default)]
    pub jobs: IndexMap<String, JobSpec>,

    /// Deployment environments referenced by jobs
    #[serde(default)]
    pub environments: IndexMap<String, EnvironmentSpec>,
}

impl WorkflowSpec {
    /// Display name, falling back to "workflow"
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("workflow")
    }

    pub fn job(&self, id: &str) -> Option<&JobSpec> {
        self.jobs.get(id)
    }
}

/// Default settings for the run, its jobs and their steps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Defaults {
    /// Default settings for run steps
    #[serde(default)]
    pub run: Option<RunDefaults>,

    /// Maximum number of concurrently running jobs (0 = unlimited)
    #[serde(default, rename = "max-parallel")]
    pub max_parallel: Option<usize>,

    /// Cancel pending jobs as soon as one job fails
    #[serde(default, rename = "fail-fast")]
    pub fail_fast: Option<bool>,
}

/// Default settings for run steps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunDefaults {
    /// Default shell to use
    #[serde(default)]
    pub shell: Option<String>,

    /// Default working directory
    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,
}

/// A job within a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job id, taken from the key under `jobs:`
    #[serde(skip)]
    pub id: String,

    /// Display name for the job
    #[serde(default)]
    pub name: Option<String>,

    /// Jobs (or job instances) that must complete before this job runs
    #[serde(default)]
    pub needs: JobNeeds,

    /// Conditional expression for job execution
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    /// Schedule the job regardless of upstream failures
    #[serde(default, rename = "run-always")]
    pub run_always: bool,

    /// Record a failure without failing the run
    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: bool,

    /// Job-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Default settings for steps in this job
    #[serde(default)]
    pub defaults: Option<Defaults>,

    /// Job outputs to pass to dependent jobs (key -> template)
    #[serde(default)]
    pub outputs: IndexMap<String, String>,

    /// Matrix strategy for running multiple job instances
    #[serde(default)]
    pub strategy: Option<Strategy>,

    /// Default retry policy for the job's steps
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Environment deployment target, promoted after the steps succeed
    #[serde(default)]
    pub environment: Option<DeploymentTarget>,

    /// The steps that make up this job
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl JobSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn matrix(&self) -> Option<&Matrix> {
        self.strategy.as_ref().and_then(|s| s.matrix.as_ref())
    }

    /// Limit on concurrently running instances of this job
    pub fn max_parallel(&self) -> Option<usize> {
        self.strategy
            .as_ref()
            .and_then(|s| s.max_parallel)
            .filter(|&n| n > 0)
    }

    pub fn with_needs(mut self, needs: &[&str]) -> Self {
        self.needs = JobNeeds::Multiple(needs.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_if(mut self, condition: impl Into<String>) -> Self {
        self.if_condition = Some(condition.into());
        self
    }

    pub fn with_matrix(mut self, matrix: Matrix) -> Self {
        self.strategy
            .get_or_insert_with(Strategy::default)
            .matrix = Some(matrix);
        self
    }

    pub fn with_environment(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.environment = Some(DeploymentTarget::Detailed {
            name: name.into(),
            version: Some(version.into()),
        });
        self
    }
}

/// Job dependencies - can be a single string or a list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum JobNeeds {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl JobNeeds {
    /// Dependencies as written, job ids or instance ids.
    pub fn as_slice(&self) -> &[String] {
        match self {
            JobNeeds::None => &[],
            JobNeeds::Single(s) => std::slice::from_ref(s),
            JobNeeds::Multiple(v) => v,
        }
    }

    /// Check if there are any dependencies.
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

/// Strategy configuration for matrix builds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Strategy {
    /// Matrix configuration
    #[serde(default)]
    pub matrix: Option<Matrix>,

    /// Maximum number of this job's instances to run in parallel
    #[serde(default, rename = "max-parallel")]
    pub max_parallel: Option<usize>,
}

/// Matrix configuration: ordered axes plus exclude tuples.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Matrix {
    /// Matrix combinations to exclude; a partial tuple matches any value
    /// of the axes it leaves out
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, Value>>,

    /// Matrix axes in declared order
    #[serde(flatten)]
    pub axes: IndexMap<String, Vec<Value>>,
}

impl Matrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn axis<V: Into<Value>>(mut self, name: impl Into<String>, values: Vec<V>) -> Self {
        self.axes
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude<K: Into<String>, V: Into<Value>>(mut self, tuple: Vec<(K, V)>) -> Self {
        self.exclude.push(
            tuple
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }
}

/// Retry policy for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1)
    #[serde(default = "default_max_attempts", rename = "max-attempts")]
    pub max_attempts: u32,

    /// Fixed wait between attempts, in milliseconds
    #[serde(default, rename = "backoff-ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff_ms: backoff.as_millis() as u64,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Environment deployment target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeploymentTarget {
    /// Simple environment name; the version defaults to the commit sha
    Name(String),

    /// Environment with an explicit version template
    Detailed {
        name: String,
        #[serde(default)]
        version: Option<String>,
    },
}

impl DeploymentTarget {
    pub fn name(&self) -> &str {
        match self {
            DeploymentTarget::Name(name) => name,
            DeploymentTarget::Detailed { name, .. } => name,
        }
    }

    /// Version template, interpolated when the job finishes
    pub fn version_template(&self) -> &str {
        match self {
            DeploymentTarget::Detailed {
                version: Some(version),
                ..
            } => version,
            _ => "${{ event.sha }}",
        }
    }
}

/// How to deploy to and probe a named environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Command that deploys `$DEPLOY_VERSION` to `$DEPLOY_ENVIRONMENT`
    #[serde(default)]
    pub deploy: Option<String>,

    /// Command whose zero exit status means healthy
    #[serde(default, rename = "health-check")]
    pub health_check: Option<String>,

    /// Health checks to try before rolling back
    #[serde(default, rename = "health-check-attempts")]
    pub health_check_attempts: Option<u32>,

    /// Wait between health checks, in milliseconds
    #[serde(default, rename = "health-check-interval-ms")]
    pub health_check_interval_ms: Option<u64>,
}

/// A step within a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique identifier for the step (used in outputs)
    #[serde(default)]
    pub id: Option<String>,

    /// Display name for the step
    #[serde(default)]
    pub name: Option<String>,

    /// Conditional expression for step execution
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    /// Shell command to run
    #[serde(default)]
    pub run: Option<String>,

    /// Shell to use for the run command
    #[serde(default)]
    pub shell: Option<String>,

    /// Working directory for the step
    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,

    /// Action to use (e.g., "notify/slack@v1")
    #[serde(default)]
    pub uses: Option<String>,

    /// Inputs to pass to the action
    #[serde(default)]
    pub with: BTreeMap<String, Value>,

    /// Step-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Whether to continue job if this step fails
    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: bool,

    /// Step timeout in minutes (fractions allowed)
    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<f64>,

    /// Retry policy, overriding the job's
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl StepSpec {
    pub fn run(command: impl Into<String>) -> Self {
        Self {
            run: Some(command.into()),
            ..Default::default()
        }
    }

    pub fn uses(action: impl Into<String>) -> Self {
        Self {
            uses: Some(action.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_if(mut self, condition: impl Into<String>) -> Self {
        self.if_condition = Some(condition.into());
        self
    }

    /// Get a display name for the step.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            name.clone()
        } else if let Some(id) = &self.id {
            id.clone()
        } else if let Some(uses) = &self.uses {
            format!("Run {}", uses)
        } else if let Some(run) = &self.run {
            // Truncate long commands
            let first_line = run.lines().next().unwrap_or(run);
            if first_line.chars().count() > 50 {
                let truncated: String = first_line.chars().take(47).collect();
                format!("Run {}...", truncated)
            } else {
                format!("Run {}", first_line)
            }
        } else {
            "Unnamed step".to_string()
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_minutes
            .filter(|m| *m > 0.0)
            .map(|m| Duration::from_secs_f64(m * 60.0))
    }
}

// Run Context
// Shared, append-only record of job results for one workflow run

use crate::execution::cancel::CancellationToken;
use crate::execution::matrix::MatrixCombination;
use crate::expression::{
    EventContext, ExpressionContext, JobStatusContext, NeedContext, StatusContext, StepContext,
};
use crate::promotion::state::{PromotionError, PromotionResult};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;

/// Status of a job instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failure,
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a step, before or after `continue-on-error` is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepConclusion {
    Success,
    Failure,
    Skipped,
    Cancelled,
}

impl StepConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepConclusion::Success => "success",
            StepConclusion::Failure => "failure",
            StepConclusion::Skipped => "skipped",
            StepConclusion::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StepConclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a step or job did not succeed, or why it was skipped
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureReason {
    #[error("condition evaluated to false")]
    ConditionFalse,

    #[error("expression error: {0}")]
    Evaluation(String),

    #[error("matrix produced no combinations")]
    EmptyMatrix,

    #[error("{0}")]
    StepExecution(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("did not stop within the cancellation grace period")]
    ForcedTermination,

    #[error("run was cancelled")]
    Cancelled,

    #[error("step '{0}' failed")]
    StepFailed(String),

    #[error("promotion rolled back: {0}")]
    Promotion(PromotionError),
}

/// Outcome of one step
#[derive(Debug, Clone)]
pub struct StepResult {
    pub name: String,
    pub id: Option<String>,
    /// True result of the step
    pub outcome: StepConclusion,
    /// Result after `continue-on-error`
    pub conclusion: StepConclusion,
    pub exit_code: Option<i32>,
    pub outputs: BTreeMap<String, String>,
    pub stdout: String,
    pub stderr: String,
    pub attempts: u32,
    pub reason: Option<FailureReason>,
    pub duration: Duration,
}

impl StepResult {
    pub fn skipped(name: String, id: Option<String>, reason: FailureReason) -> Self {
        Self {
            name,
            id,
            outcome: StepConclusion::Skipped,
            conclusion: StepConclusion::Skipped,
            exit_code: None,
            outputs: BTreeMap::new(),
            stdout: String::new(),
            stderr: String::new(),
            attempts: 0,
            reason: Some(reason),
            duration: Duration::ZERO,
        }
    }
}

/// Outcome of one job instance
#[derive(Debug, Clone)]
pub struct JobResult {
    pub instance_id: String,
    pub job_id: String,
    pub matrix: MatrixCombination,
    pub status: JobStatus,
    pub outputs: BTreeMap<String, String>,
    pub steps: Vec<StepResult>,
    pub reason: Option<FailureReason>,
    pub duration: Duration,
    /// The job's failure does not fail the run
    pub continue_on_error: bool,
}

impl JobResult {
    pub fn new(instance_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            job_id: job_id.into(),
            matrix: MatrixCombination::default(),
            status: JobStatus::Pending,
            outputs: BTreeMap::new(),
            steps: Vec::new(),
            reason: None,
            duration: Duration::ZERO,
            continue_on_error: false,
        }
    }

    pub fn with_status(mut self, status: JobStatus, reason: Option<FailureReason>) -> Self {
        self.status = status;
        self.reason = reason;
        self
    }

    /// Whether this result makes the whole run unsuccessful
    pub fn fails_run(&self) -> bool {
        self.status == JobStatus::Failure && !self.continue_on_error
    }

    pub fn step(&self, id_or_name: &str) -> Option<&StepResult> {
        self.steps
            .iter()
            .find(|s| s.id.as_deref() == Some(id_or_name) || s.name == id_or_name)
    }
}

/// Combined status of several instances standing for one dependency.
///
/// Any failure wins, then cancellation; all-success is success and anything
/// else (skipped or missing) counts as skipped.
pub fn aggregate_status<'a>(results: impl IntoIterator<Item = Option<&'a JobResult>>) -> JobStatus {
    let mut all_success = true;
    let mut any_cancelled = false;

    for result in results {
        match result.map(|r| r.status) {
            Some(JobStatus::Failure) => return JobStatus::Failure,
            Some(JobStatus::Cancelled) => {
                any_cancelled = true;
                all_success = false;
            }
            Some(JobStatus::Success) => {}
            _ => all_success = false,
        }
    }

    if any_cancelled {
        JobStatus::Cancelled
    } else if all_success {
        JobStatus::Success
    } else {
        JobStatus::Skipped
    }
}

/// Run metadata exposed to expressions as `event.*`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunMetadata {
    pub event_name: String,
    pub git_ref: String,
    pub sha: String,
    pub actor: String,
}

impl RunMetadata {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            ..Default::default()
        }
    }

    pub fn with_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = git_ref.into();
        self
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = sha.into();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn to_event_context(&self) -> EventContext {
        EventContext {
            name: self.event_name.clone(),
            git_ref: self.git_ref.clone(),
            sha: self.sha.clone(),
            actor: self.actor.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("result for '{0}' was already recorded")]
    AlreadyRecorded(String),
}

/// Shared state for one run.
///
/// Each instance's result is written exactly once; readers take snapshots
/// between layers.
#[derive(Debug)]
pub struct RunContext {
    results: RwLock<HashMap<String, JobResult>>,
    env: HashMap<String, String>,
    metadata: RunMetadata,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(
        env: HashMap<String, String>,
        metadata: RunMetadata,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            results: RwLock::new(HashMap::new()),
            env,
            metadata,
            cancel,
        }
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record an instance's final result; a second write is an error
    pub async fn record(&self, result: JobResult) -> Result<(), ContextError> {
        let mut results = self.results.write().await;
        if results.contains_key(&result.instance_id) {
            return Err(ContextError::AlreadyRecorded(result.instance_id));
        }
        results.insert(result.instance_id.clone(), result);
        Ok(())
    }

    pub async fn result(&self, instance_id: &str) -> Option<JobResult> {
        self.results.read().await.get(instance_id).cloned()
    }

    pub async fn snapshot(&self) -> ResultsSnapshot {
        ResultsSnapshot {
            results: self.results.read().await.clone(),
        }
    }
}

/// Point-in-time copy of recorded results
#[derive(Debug, Clone, Default)]
pub struct ResultsSnapshot {
    results: HashMap<String, JobResult>,
}

impl ResultsSnapshot {
    pub fn get(&self, instance_id: &str) -> Option<&JobResult> {
        self.results.get(instance_id)
    }

    /// `needs` context for a job gate: one entry per dependency as written,
    /// outputs merged in instance order
    pub fn needs_context(&self, groups: &[(String, Vec<String>)]) -> BTreeMap<String, NeedContext> {
        groups
            .iter()
            .map(|(name, ids)| {
                let status = aggregate_status(ids.iter().map(|id| self.get(id)));
                let mut outputs = BTreeMap::new();
                for result in ids.iter().filter_map(|id| self.get(id)) {
                    outputs.extend(result.outputs.clone());
                }
                (
                    name.clone(),
                    NeedContext {
                        result: status.as_str().to_string(),
                        outputs,
                    },
                )
            })
            .collect()
    }

    /// Status functions for a job gate over its direct dependencies
    pub fn gate_status(&self, needs: &[String], cancelled: bool) -> StatusContext {
        let statuses: Vec<Option<JobStatus>> =
            needs.iter().map(|id| self.get(id).map(|r| r.status)).collect();

        StatusContext {
            success: statuses.iter().all(|s| *s == Some(JobStatus::Success)),
            failure: statuses.iter().any(|s| *s == Some(JobStatus::Failure)),
            cancelled,
        }
    }
}

/// Expression context for steps: prior step results plus the job's status so far
pub fn step_expression_context(
    base: &ExpressionContext,
    steps: &[StepResult],
    cancelled: bool,
) -> ExpressionContext {
    let failed = steps
        .iter()
        .any(|s| s.conclusion == StepConclusion::Failure);

    let mut ctx = base.clone();
    ctx.steps = steps
        .iter()
        .filter_map(|s| {
            s.id.as_ref().map(|id| {
                (
                    id.clone(),
                    StepContext {
                        outcome: s.outcome.as_str().to_string(),
                        conclusion: s.conclusion.as_str().to_string(),
                        outputs: s.outputs.clone(),
                    },
                )
            })
        })
        .collect();
    ctx.job = Some(JobStatusContext {
        status: if cancelled {
            "cancelled"
        } else if failed {
            "failure"
        } else {
            "success"
        }
        .to_string(),
    });
    ctx.status = StatusContext {
        success: !failed,
        failure: failed,
        cancelled,
    };
    ctx
}

/// Final report of a workflow run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub workflow: String,
    /// Results in topological (layer) order
    pub jobs: Vec<JobResult>,
    pub promotions: Vec<PromotionResult>,
    pub success: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl RunReport {
    pub fn job(&self, instance_id: &str) -> Option<&JobResult> {
        self.jobs.iter().find(|j| j.instance_id == instance_id)
    }

    pub fn status_of(&self, instance_id: &str) -> Option<JobStatus> {
        self.job(instance_id).map(|j| j.status)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}

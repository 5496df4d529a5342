// Workflow Executor
// Runs job instances layer by layer with gates, retries, cancellation and promotion

use crate::error::EngineResult;
use crate::execution::cancel::CancellationToken;
use crate::execution::context::{
    step_expression_context, FailureReason, JobResult, JobStatus, ResultsSnapshot, RunContext,
    RunMetadata, RunReport, StepConclusion, StepResult,
};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::ExecutionGraph;
use crate::execution::matrix::{expand_jobs, JobInstance};
use crate::expression::{ExpressionContext, ExpressionEngine, ExpressionError};
use crate::promotion::{PromotionEngine, PromotionError, PromotionResult};
use crate::runners::{StepAction, StepExecutor, StepInvocation, StepOutcome};
use crate::value::Value;
use crate::workflow::models::{DeploymentTarget, JobSpec, StepSpec, WorkflowSpec};

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

/// Configuration for workflow execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum concurrently running job instances (0 = unlimited)
    pub max_parallel_jobs: usize,
    /// Cancel the run as soon as a job without `continue-on-error` fails
    pub fail_fast: bool,
    /// Time a cancelled step gets to stop before it is abandoned
    pub cancel_grace_period: Duration,
    /// Base directory for steps
    pub working_dir: PathBuf,
    /// Entries overriding the workflow's `env`
    pub env: HashMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 0,
            fail_fast: false,
            cancel_grace_period: Duration::from_secs(10),
            working_dir: PathBuf::from("."),
            env: HashMap::new(),
        }
    }
}

impl ExecutorConfig {
    /// Defaults with the workflow's own `defaults` applied
    pub fn for_workflow(workflow: &WorkflowSpec) -> Self {
        let defaults = Self::default();
        Self {
            max_parallel_jobs: workflow
                .defaults
                .max_parallel
                .unwrap_or(defaults.max_parallel_jobs),
            fail_fast: workflow.defaults.fail_fast.unwrap_or(defaults.fail_fast),
            ..defaults
        }
    }

    pub fn with_max_parallel_jobs(mut self, max: usize) -> Self {
        self.max_parallel_jobs = max;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_cancel_grace_period(mut self, grace: Duration) -> Self {
        self.cancel_grace_period = grace;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }
}

/// Workflow executor
pub struct WorkflowExecutor {
    workflow: Arc<WorkflowSpec>,
    instances: HashMap<String, JobInstance>,
    graph: ExecutionGraph,
    step_executor: Arc<dyn StepExecutor>,
    promotion: Option<Arc<PromotionEngine>>,
    config: ExecutorConfig,
    event_tx: Option<ProgressSender>,
    cancel: CancellationToken,
}

impl WorkflowExecutor {
    /// Expand and order the workflow's jobs
    pub fn new(
        workflow: WorkflowSpec,
        step_executor: Arc<dyn StepExecutor>,
    ) -> EngineResult<Self> {
        let instances = expand_jobs(&workflow)?;
        let graph = ExecutionGraph::build(&instances)?;
        let config = ExecutorConfig::for_workflow(&workflow);

        Ok(Self {
            workflow: Arc::new(workflow),
            instances: instances
                .into_iter()
                .map(|instance| (instance.id.clone(), instance))
                .collect(),
            graph,
            step_executor,
            promotion: None,
            config,
            event_tx: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Deploy jobs that declare an `environment` through this engine
    pub fn with_promotion(mut self, engine: Arc<PromotionEngine>) -> Self {
        self.promotion = Some(engine);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this executor's runs
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the workflow to completion
    pub async fn execute(&self, metadata: RunMetadata) -> RunReport {
        let start = Instant::now();
        let name = self.workflow.display_name().to_string();

        let mut env = self.workflow.env.clone();
        env.extend(self.config.env.clone());

        let scheduler = Arc::new(Scheduler {
            workflow: Arc::clone(&self.workflow),
            step_executor: Arc::clone(&self.step_executor),
            promotion: self.promotion.clone(),
            config: self.config.clone(),
            event_tx: self.event_tx.clone(),
            ctx: RunContext::new(env, metadata, self.cancel.clone()),
            global_limit: (self.config.max_parallel_jobs > 0)
                .then(|| Arc::new(Semaphore::new(self.config.max_parallel_jobs))),
            job_limits: self
                .workflow
                .jobs
                .iter()
                .filter_map(|(id, job)| {
                    job.max_parallel()
                        .map(|max| (id.clone(), Arc::new(Semaphore::new(max))))
                })
                .collect(),
            promotions: Mutex::new(Vec::new()),
            fail_fast: CancellationToken::new(),
        });

        let layers = self.graph.layers();
        tracing::info!(workflow = %name, jobs = self.graph.len(), layers = layers.len(), "run started");
        self.event_tx.send_event(ExecutionEvent::RunStarted {
            workflow_name: name.clone(),
            total_jobs: self.graph.len(),
            total_layers: layers.len(),
        });

        for layer in &layers {
            let snapshot = Arc::new(scheduler.ctx.snapshot().await);
            let mut tasks = JoinSet::new();

            for id in layer {
                let Some(instance) = self.instances.get(*id).cloned() else {
                    continue;
                };
                let scheduler = Arc::clone(&scheduler);
                let snapshot = Arc::clone(&snapshot);
                tasks.spawn(async move { scheduler.run_instance(instance, snapshot).await });
            }

            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "job task aborted");
                }
            }

            // A task that panicked never recorded its result
            for id in layer {
                if scheduler.ctx.result(id).await.is_none() {
                    let job_id = self
                        .instances
                        .get(*id)
                        .map(|i| i.job_id().to_string())
                        .unwrap_or_else(|| id.to_string());
                    let result = JobResult::new(*id, job_id).with_status(
                        JobStatus::Failure,
                        Some(FailureReason::StepExecution("job task panicked".to_string())),
                    );
                    scheduler.record(result).await;
                }
            }
        }

        let mut jobs = Vec::with_capacity(self.graph.len());
        for id in self.graph.topological_order() {
            if let Some(result) = scheduler.ctx.result(id).await {
                jobs.push(result);
            }
        }

        let cancelled = self.cancel.is_cancelled();
        let success = !cancelled && jobs.iter().all(|job| !job.fails_run());
        let promotions = std::mem::take(&mut *scheduler.promotions.lock().await);
        let duration = start.elapsed();

        tracing::info!(workflow = %name, success, cancelled, ?duration, "run finished");
        self.event_tx.send_event(ExecutionEvent::RunCompleted {
            workflow_name: name.clone(),
            success,
            cancelled,
            duration,
        });

        RunReport {
            workflow: name,
            jobs,
            promotions,
            success,
            cancelled,
            duration,
        }
    }
}

/// Result of one step attempt as seen by the scheduler
enum Attempt {
    Finished(StepOutcome),
    TimedOut(Duration),
    /// Stopped within the grace period after cancellation
    Cancelled(StepOutcome),
    /// Still running when the grace period ran out
    Abandoned,
}

/// Per-run state shared by all job tasks
struct Scheduler {
    workflow: Arc<WorkflowSpec>,
    step_executor: Arc<dyn StepExecutor>,
    promotion: Option<Arc<PromotionEngine>>,
    config: ExecutorConfig,
    event_tx: Option<ProgressSender>,
    ctx: RunContext,
    global_limit: Option<Arc<Semaphore>>,
    job_limits: HashMap<String, Arc<Semaphore>>,
    promotions: Mutex<Vec<PromotionResult>>,
    /// Tripped by the first failing job under fail-fast; only stops jobs that have not started
    fail_fast: CancellationToken,
}

impl Scheduler {
    async fn record(&self, result: JobResult) {
        if let Err(e) = self.ctx.record(result).await {
            tracing::error!(error = %e, "dropping duplicate job result");
        }
    }

    async fn run_instance(&self, instance: JobInstance, snapshot: Arc<ResultsSnapshot>) {
        let result = self.execute_instance(&instance, &snapshot).await;
        self.record(result).await;
    }

    /// Stop pending jobs from starting once a job fails the run
    fn trip_fail_fast(&self, result: &JobResult) {
        if !self.config.fail_fast || !result.fails_run() || self.halted() {
            return;
        }
        tracing::warn!(job = %result.instance_id, "fail-fast: cancelling pending jobs");
        self.event_tx.send_event(ExecutionEvent::RunCancelling {
            reason: format!("fail-fast: job '{}' failed", result.instance_id),
        });
        self.fail_fast.cancel();
    }

    /// Whether jobs that have not started yet must not start
    fn halted(&self) -> bool {
        self.ctx.is_cancelled() || self.fail_fast.is_cancelled()
    }

    fn not_started(&self, mut result: JobResult, status: JobStatus, reason: FailureReason) -> JobResult {
        tracing::info!(job = %result.instance_id, %status, reason = %reason, "job not started");
        self.event_tx.send_event(ExecutionEvent::job_skipped(
            &result.instance_id,
            status,
            reason.to_string(),
        ));
        result.status = status;
        result.reason = Some(reason);
        result
    }

    async fn execute_instance(&self, instance: &JobInstance, snapshot: &ResultsSnapshot) -> JobResult {
        let job = &instance.job;
        let start = Instant::now();

        let mut result = JobResult::new(&instance.id, &job.id);
        result.matrix = instance.matrix.clone();
        result.continue_on_error = job.continue_on_error;

        if instance.empty_matrix {
            return self.not_started(result, JobStatus::Skipped, FailureReason::EmptyMatrix);
        }
        if self.halted() {
            return self.not_started(result, JobStatus::Cancelled, FailureReason::Cancelled);
        }

        let base = self.job_context(instance, snapshot);
        match ExpressionEngine::new(&base).evaluate_gate(job.if_condition.as_deref(), job.run_always) {
            Ok(true) => {}
            Ok(false) => {
                return self.not_started(result, JobStatus::Skipped, FailureReason::ConditionFalse)
            }
            Err(e) => {
                return self.not_started(
                    result,
                    JobStatus::Skipped,
                    FailureReason::Evaluation(e.to_string()),
                )
            }
        }

        let Some(_permits) = self.acquire(&job.id).await else {
            return self.not_started(result, JobStatus::Cancelled, FailureReason::Cancelled);
        };
        if self.halted() {
            return self.not_started(result, JobStatus::Cancelled, FailureReason::Cancelled);
        }

        tracing::info!(job = %instance.id, "job started");
        self.event_tx.send_event(ExecutionEvent::job_started(
            &instance.id,
            instance.display_name(),
            job.steps.len(),
        ));

        let (status, reason) = match self.with_job_env(job, base) {
            Ok(job_ctx) => self.run_job(instance, job_ctx, &mut result).await,
            Err(e) => (
                JobStatus::Failure,
                Some(FailureReason::Evaluation(e.to_string())),
            ),
        };

        result.status = status;
        result.reason = reason;
        result.duration = start.elapsed();

        tracing::info!(job = %instance.id, %status, duration = ?result.duration, "job finished");
        self.event_tx.send_event(ExecutionEvent::job_completed(
            &instance.id,
            status,
            result.duration,
            result.reason.as_ref().map(ToString::to_string),
        ));

        // Still holding the permits, so a queued job cannot slip in first
        self.trip_fail_fast(&result);
        result
    }

    /// Steps, outputs and deployment of a started job
    async fn run_job(
        &self,
        instance: &JobInstance,
        job_ctx: ExpressionContext,
        result: &mut JobResult,
    ) -> (JobStatus, Option<FailureReason>) {
        let job = &instance.job;
        let mut steps: Vec<StepResult> = Vec::with_capacity(job.steps.len());
        let mut forced = false;
        let mut cancelled = false;

        for (index, step) in job.steps.iter().enumerate() {
            let name = step.display_name();

            if self.ctx.is_cancelled() {
                cancelled = true;
                self.event_tx.send_event(ExecutionEvent::step_skipped(
                    &instance.id,
                    &name,
                    index,
                    "run cancelled",
                ));
                steps.push(StepResult::skipped(name, step.id.clone(), FailureReason::Cancelled));
                continue;
            }

            let step_ctx = step_expression_context(&job_ctx, &steps, false);
            let gate = ExpressionEngine::new(&step_ctx).evaluate_gate(step.if_condition.as_deref(), false);
            let skip_reason = match gate {
                Ok(true) => None,
                Ok(false) => Some(FailureReason::ConditionFalse),
                Err(e) => Some(FailureReason::Evaluation(e.to_string())),
            };
            if let Some(reason) = skip_reason {
                self.event_tx.send_event(ExecutionEvent::step_skipped(
                    &instance.id,
                    &name,
                    index,
                    reason.to_string(),
                ));
                steps.push(StepResult::skipped(name, step.id.clone(), reason));
                continue;
            }

            let step_result = self.run_step(instance, step, index, &step_ctx).await;
            match step_result.reason {
                Some(FailureReason::ForcedTermination) => forced = true,
                Some(FailureReason::Cancelled) => cancelled = true,
                _ => {}
            }
            steps.push(step_result);
        }

        let final_ctx = step_expression_context(&job_ctx, &steps, cancelled || forced);
        let (mut status, mut reason) = if forced {
            (JobStatus::Cancelled, Some(FailureReason::ForcedTermination))
        } else if cancelled {
            (JobStatus::Cancelled, Some(FailureReason::Cancelled))
        } else if let Some(failed) = steps.iter().find(|s| s.conclusion == StepConclusion::Failure) {
            (
                JobStatus::Failure,
                Some(FailureReason::StepFailed(failed.name.clone())),
            )
        } else {
            (JobStatus::Success, None)
        };

        match job_outputs(job, &final_ctx, &steps) {
            Ok(outputs) => result.outputs = outputs,
            Err(e) if status == JobStatus::Success => {
                status = JobStatus::Failure;
                reason = Some(FailureReason::Evaluation(e.to_string()));
            }
            Err(e) => tracing::debug!(job = %instance.id, error = %e, "outputs not available"),
        }

        if status == JobStatus::Success {
            if let Some(target) = &job.environment {
                if let Some((new_status, new_reason)) =
                    self.deploy(instance, target, &final_ctx).await
                {
                    status = new_status;
                    reason = Some(new_reason);
                }
            }
        }

        result.steps = steps;
        (status, reason)
    }

    /// Promote the job's target environment; returns an override for the
    /// job status when the deployment did not go through
    async fn deploy(
        &self,
        instance: &JobInstance,
        target: &DeploymentTarget,
        ctx: &ExpressionContext,
    ) -> Option<(JobStatus, FailureReason)> {
        let Some(engine) = &self.promotion else {
            tracing::warn!(job = %instance.id, environment = target.name(), "no promotion engine configured, skipping deployment");
            self.event_tx.send_event(ExecutionEvent::warning(
                format!("deployment to '{}' skipped: no promotion engine", target.name()),
                Some(instance.id.clone()),
            ));
            return None;
        };
        if self.ctx.is_cancelled() {
            return Some((JobStatus::Cancelled, FailureReason::Cancelled));
        }

        let version = match ExpressionEngine::new(ctx).interpolate(target.version_template()) {
            Ok(version) => version,
            Err(e) => {
                return Some((JobStatus::Failure, FailureReason::Evaluation(e.to_string())))
            }
        };

        let promotion = engine.promote(target.name(), &version).await;
        let promoted = promotion.is_promoted();
        let failure = promotion.reason.clone().unwrap_or_else(|| {
            PromotionError::DeployFailed("promotion rolled back".to_string())
        });
        self.promotions.lock().await.push(promotion);

        if promoted {
            None
        } else {
            Some((JobStatus::Failure, FailureReason::Promotion(failure)))
        }
    }

    /// Run one step with its retry policy and timeout
    async fn run_step(
        &self,
        instance: &JobInstance,
        step: &StepSpec,
        index: usize,
        ctx: &ExpressionContext,
    ) -> StepResult {
        let start = Instant::now();
        let mut result = StepResult {
            name: step.display_name(),
            id: step.id.clone(),
            outcome: StepConclusion::Success,
            conclusion: StepConclusion::Success,
            exit_code: None,
            outputs: BTreeMap::new(),
            stdout: String::new(),
            stderr: String::new(),
            attempts: 0,
            reason: None,
            duration: Duration::ZERO,
        };

        match self.invocation(instance, step, index, ctx) {
            Ok(invocation) => {
                let policy = step.retry.or(instance.job.retry).unwrap_or_default();
                let max_attempts = policy.max_attempts.max(1);

                for attempt in 1..=max_attempts {
                    self.event_tx.send_event(ExecutionEvent::StepStarted {
                        job_id: instance.id.clone(),
                        step_name: result.name.clone(),
                        step_index: index,
                        attempt,
                    });

                    let (outcome, reason) = match self.run_attempt(&invocation, step.timeout()).await {
                        Attempt::Finished(outcome) if outcome.is_success() => (outcome, None),
                        Attempt::Finished(outcome) if self.ctx.is_cancelled() => {
                            (outcome, Some(FailureReason::Cancelled))
                        }
                        Attempt::Finished(outcome) => {
                            let message = outcome.failure_message();
                            (outcome, Some(FailureReason::StepExecution(message)))
                        }
                        Attempt::TimedOut(limit) => (
                            StepOutcome::failure(format!("timed out after {:?}", limit)),
                            Some(FailureReason::Timeout(limit)),
                        ),
                        Attempt::Cancelled(outcome) => (outcome, Some(FailureReason::Cancelled)),
                        Attempt::Abandoned => (
                            StepOutcome::failure("step did not stop after cancellation"),
                            Some(FailureReason::ForcedTermination),
                        ),
                    };

                    result.attempts = attempt;
                    result.exit_code = outcome.exit_code;
                    result.outputs = outcome.outputs;
                    result.stdout = outcome.stdout;
                    result.stderr = outcome.stderr;
                    result.reason = reason;

                    let retryable = matches!(
                        result.reason,
                        Some(FailureReason::StepExecution(_)) | Some(FailureReason::Timeout(_))
                    );
                    if !retryable || attempt == max_attempts {
                        break;
                    }

                    tracing::warn!(
                        job = %instance.id,
                        step = %result.name,
                        attempt,
                        max_attempts,
                        "step failed, retrying"
                    );
                    self.event_tx.send_event(ExecutionEvent::StepRetrying {
                        job_id: instance.id.clone(),
                        step_name: result.name.clone(),
                        step_index: index,
                        attempt,
                        max_attempts,
                        backoff: policy.backoff(),
                    });
                    if !self.ctx.cancel_token().sleep(policy.backoff()).await {
                        result.reason = Some(FailureReason::Cancelled);
                        break;
                    }
                }
            }
            Err(reason) => result.reason = Some(reason),
        }

        result.outcome = match result.reason {
            None => StepConclusion::Success,
            Some(FailureReason::Cancelled) => StepConclusion::Cancelled,
            Some(_) => StepConclusion::Failure,
        };
        result.conclusion = if result.outcome == StepConclusion::Failure && step.continue_on_error {
            StepConclusion::Success
        } else {
            result.outcome
        };
        result.duration = start.elapsed();

        self.event_tx.send_event(ExecutionEvent::StepCompleted {
            job_id: instance.id.clone(),
            step_name: result.name.clone(),
            step_index: index,
            outcome: result.outcome,
            conclusion: result.conclusion,
            duration: result.duration,
            exit_code: result.exit_code,
        });

        result
    }

    /// Race one attempt against its timeout and the run's cancellation
    async fn run_attempt(&self, invocation: &StepInvocation, timeout: Option<Duration>) -> Attempt {
        let token = self.ctx.cancel_token().clone();
        let mut execution = self.step_executor.execute(invocation, token.clone());
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            outcome = &mut execution => return Attempt::Finished(outcome),
            _ = deadline => return Attempt::TimedOut(timeout.unwrap_or_default()),
            _ = token.cancelled() => {}
        }

        match tokio::time::timeout(self.config.cancel_grace_period, &mut execution).await {
            Ok(outcome) => Attempt::Cancelled(outcome),
            Err(_) => {
                tracing::warn!(job = %invocation.job_id, step = %invocation.step_name, "abandoning step after grace period");
                Attempt::Abandoned
            }
        }
    }

    /// Resolve env, command and working directory for a step
    fn invocation(
        &self,
        instance: &JobInstance,
        step: &StepSpec,
        index: usize,
        ctx: &ExpressionContext,
    ) -> Result<StepInvocation, FailureReason> {
        let job = &instance.job;
        let engine = ExpressionEngine::new(ctx);
        let eval_err = |e: ExpressionError| FailureReason::Evaluation(e.to_string());

        let mut env: HashMap<String, String> = ctx.env.clone().into_iter().collect();
        for (key, value) in &step.env {
            env.insert(key.clone(), engine.interpolate(value).map_err(eval_err)?);
        }

        let job_run = job.defaults.as_ref().and_then(|d| d.run.as_ref());
        let workflow_run = self.workflow.defaults.run.as_ref();

        let action = match (&step.run, &step.uses) {
            (Some(command), _) => StepAction::Run {
                command: engine.interpolate(command).map_err(eval_err)?,
                shell: step
                    .shell
                    .clone()
                    .or_else(|| job_run.and_then(|r| r.shell.clone()))
                    .or_else(|| workflow_run.and_then(|r| r.shell.clone())),
            },
            (None, Some(action)) => {
                let mut inputs = BTreeMap::new();
                for (name, value) in &step.with {
                    let value = match value {
                        Value::String(s) => Value::String(engine.interpolate(s).map_err(eval_err)?),
                        other => other.clone(),
                    };
                    inputs.insert(name.clone(), value);
                }
                StepAction::Uses {
                    action: action.clone(),
                    inputs,
                }
            }
            (None, None) => {
                return Err(FailureReason::StepExecution(
                    "step has neither 'run' nor 'uses'".to_string(),
                ))
            }
        };

        let working_dir = step
            .working_directory
            .as_ref()
            .or_else(|| job_run.and_then(|r| r.working_directory.as_ref()))
            .or_else(|| workflow_run.and_then(|r| r.working_directory.as_ref()))
            .map(|dir| self.config.working_dir.join(dir))
            .unwrap_or_else(|| self.config.working_dir.clone());

        Ok(StepInvocation {
            job_id: instance.id.clone(),
            step_name: step.display_name(),
            step_index: index,
            action,
            env,
            working_dir,
            progress: self.event_tx.clone(),
        })
    }

    /// Acquire the job's and the run's concurrency permits, giving up on cancellation or fail-fast
    async fn acquire(&self, job_id: &str) -> Option<Vec<OwnedSemaphorePermit>> {
        let mut permits = Vec::new();
        let limits = self.job_limits.get(job_id).into_iter().chain(self.global_limit.as_ref());

        for limit in limits {
            let limit = Arc::clone(limit);
            tokio::select! {
                permit = limit.acquire_owned() => permits.push(permit.ok()?),
                _ = self.ctx.cancel_token().cancelled() => return None,
                _ = self.fail_fast.cancelled() => return None,
            }
        }

        Some(permits)
    }

    /// Context for the job gate
    fn job_context(&self, instance: &JobInstance, snapshot: &ResultsSnapshot) -> ExpressionContext {
        ExpressionContext {
            event: self.ctx.metadata().to_event_context(),
            env: self
                .ctx
                .env()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            matrix: instance
                .matrix
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            needs: snapshot.needs_context(&instance.need_groups),
            steps: BTreeMap::new(),
            job: None,
            status: snapshot.gate_status(&instance.needs, self.ctx.is_cancelled()),
        }
    }

    /// Interpolate workflow env, then layer the job's env on top
    fn with_job_env(
        &self,
        job: &JobSpec,
        mut ctx: ExpressionContext,
    ) -> Result<ExpressionContext, ExpressionError> {
        ctx.env = interpolate_env(&ctx, self.ctx.env())?;
        let job_env = interpolate_env(&ctx, &job.env)?;
        ctx.env.extend(job_env);
        Ok(ctx)
    }
}

fn interpolate_env(
    ctx: &ExpressionContext,
    env: &HashMap<String, String>,
) -> Result<BTreeMap<String, String>, ExpressionError> {
    let engine = ExpressionEngine::new(ctx);
    env.iter()
        .map(|(key, value)| Ok((key.clone(), engine.interpolate(value)?)))
        .collect()
}

/// Declared outputs interpolated against the final step context, or else the
/// union of step outputs in step order
fn job_outputs(
    job: &JobSpec,
    ctx: &ExpressionContext,
    steps: &[StepResult],
) -> Result<BTreeMap<String, String>, ExpressionError> {
    if job.outputs.is_empty() {
        let mut outputs = BTreeMap::new();
        for step in steps {
            outputs.extend(step.outputs.clone());
        }
        return Ok(outputs);
    }

    let engine = ExpressionEngine::new(ctx);
    job.outputs
        .iter()
        .map(|(key, template)| Ok((key.clone(), engine.interpolate(template)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::models::{Defaults, RetryPolicy};
    use std::sync::Mutex as StdMutex;

    /// Records every command it is asked to run; `fail` fails, anything else succeeds
    #[derive(Default)]
    struct RecordingExecutor {
        seen: StdMutex<Vec<(String, HashMap<String, String>)>>,
    }

    #[async_trait::async_trait]
    impl StepExecutor for RecordingExecutor {
        async fn execute(&self, step: &StepInvocation, _cancel: CancellationToken) -> StepOutcome {
            let command = match &step.action {
                StepAction::Run { command, .. } => command.clone(),
                StepAction::Uses { action, .. } => action.clone(),
            };
            self.seen
                .lock()
                .unwrap()
                .push((command.clone(), step.env.clone()));
            if command == "fail" {
                StepOutcome::default().with_exit_code(1)
            } else {
                StepOutcome::success()
            }
        }
    }

    fn workflow(jobs: Vec<JobSpec>) -> WorkflowSpec {
        WorkflowSpec {
            name: Some("ci".to_string()),
            jobs: jobs.into_iter().map(|j| (j.id.clone(), j)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_from_workflow_defaults() {
        let mut wf = workflow(vec![]);
        wf.defaults = Defaults {
            max_parallel: Some(2),
            fail_fast: Some(true),
            ..Default::default()
        };

        let config = ExecutorConfig::for_workflow(&wf);
        assert_eq!(config.max_parallel_jobs, 2);
        assert!(config.fail_fast);

        let executor = WorkflowExecutor::new(wf, Arc::new(RecordingExecutor::default())).unwrap();
        assert_eq!(executor.config().max_parallel_jobs, 2);
    }

    #[tokio::test]
    async fn test_env_cascade_and_interpolation() {
        let mut wf = workflow(vec![]);
        wf.env.insert("STAGE".into(), "ci".into());
        wf.env.insert("SHA".into(), "${{ event.sha }}".into());

        let mut job = JobSpec::new("build");
        job.env.insert("STAGE".into(), "job-${{ env.STAGE }}".into());
        let mut step = StepSpec::run("echo ${{ env.STAGE }}");
        step.env.insert("LOCAL".into(), "${{ env.SHA }}".into());
        job.steps.push(step);
        wf.jobs.insert("build".into(), job);

        let recorder = Arc::new(RecordingExecutor::default());
        let executor = WorkflowExecutor::new(wf, recorder.clone()).unwrap();
        let report = executor.execute(RunMetadata::new("push").with_sha("abc123")).await;

        assert!(report.success);
        let seen = recorder.seen.lock().unwrap();
        let (command, env) = &seen[0];
        assert_eq!(command, "echo job-ci");
        assert_eq!(env["STAGE"], "job-ci");
        assert_eq!(env["SHA"], "abc123");
        assert_eq!(env["LOCAL"], "abc123");
    }

    #[tokio::test]
    async fn test_failed_step_gates_later_steps() {
        let job = JobSpec::new("build")
            .with_step(StepSpec::run("fail").with_id("compile"))
            .with_step(StepSpec::run("skipped-step"))
            .with_step(StepSpec::run("cleanup").with_if("always()"))
            .with_step(StepSpec::run("report").with_if("failure()"));

        let recorder = Arc::new(RecordingExecutor::default());
        let executor = WorkflowExecutor::new(workflow(vec![job]), recorder.clone()).unwrap();
        let report = executor.execute(RunMetadata::default()).await;

        let result = report.job("build").unwrap();
        assert_eq!(result.status, JobStatus::Failure);
        assert_eq!(
            result.reason,
            Some(FailureReason::StepFailed("compile".to_string()))
        );
        let commands: Vec<String> = recorder
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _)| c.clone())
            .collect();
        assert_eq!(commands, vec!["fail", "cleanup", "report"]);
        assert_eq!(result.steps[1].outcome, StepConclusion::Skipped);
        assert!(!report.success);
    }

    #[tokio::test]
    async fn test_job_retry_policy_applies_to_steps() {
        let mut job = JobSpec::new("build").with_step(StepSpec::run("fail"));
        job.retry = Some(RetryPolicy::new(3, Duration::from_millis(1)));

        let recorder = Arc::new(RecordingExecutor::default());
        let executor = WorkflowExecutor::new(workflow(vec![job]), recorder.clone()).unwrap();
        let report = executor.execute(RunMetadata::default()).await;

        assert_eq!(recorder.seen.lock().unwrap().len(), 3);
        assert_eq!(report.job("build").unwrap().steps[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_step_continue_on_error_keeps_outcome() {
        let mut lint = StepSpec::run("fail").with_id("lint");
        lint.continue_on_error = true;
        let job = JobSpec::new("build")
            .with_step(lint)
            .with_step(StepSpec::run("next").with_if("steps.lint.outcome == 'failure'"));

        let recorder = Arc::new(RecordingExecutor::default());
        let executor = WorkflowExecutor::new(workflow(vec![job]), recorder.clone()).unwrap();
        let report = executor.execute(RunMetadata::default()).await;

        let result = report.job("build").unwrap();
        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(result.steps[0].outcome, StepConclusion::Failure);
        assert_eq!(result.steps[0].conclusion, StepConclusion::Success);
        assert_eq!(result.steps[1].outcome, StepConclusion::Success);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_cancels_everything() {
        let job = JobSpec::new("build").with_step(StepSpec::run("echo"));
        let recorder = Arc::new(RecordingExecutor::default());
        let executor = WorkflowExecutor::new(workflow(vec![job]), recorder.clone()).unwrap();
        executor.cancellation_token().cancel();

        let report = executor.execute(RunMetadata::default()).await;
        assert!(report.cancelled);
        assert!(!report.success);
        assert_eq!(report.status_of("build"), Some(JobStatus::Cancelled));
        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}

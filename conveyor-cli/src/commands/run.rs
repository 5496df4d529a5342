use crate::output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;

use conveyor_engine::execution::events::LogLevel;
use conveyor_engine::{
    progress_channel, ExecutionEvent, ExecutorConfig, JobStatus, PromotionEngine, RunMetadata,
    ShellStepExecutor, WorkflowExecutor,
};

/// Run a workflow locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Set an environment variable (can be repeated, format: NAME=VALUE)
    #[arg(long = "env", short = 'e', value_name = "NAME=VALUE")]
    pub env: Vec<String>,

    /// Maximum number of jobs running at once (0 = unlimited)
    #[arg(long, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Cancel the run as soon as a job fails
    #[arg(long)]
    pub fail_fast: bool,

    /// Seconds a cancelled step gets to stop before it is abandoned
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub grace_period: u64,

    /// Triggering event name
    #[arg(long, default_value = "manual")]
    pub event: String,

    /// Git ref of the run
    #[arg(long = "ref", value_name = "REF", env = "CONVEYOR_REF", default_value = "")]
    pub git_ref: String,

    /// Commit SHA of the run
    #[arg(long, env = "CONVEYOR_SHA", default_value = "")]
    pub sha: String,

    /// Actor that triggered the run
    #[arg(long, env = "USER", default_value = "")]
    pub actor: String,

    /// Directory holding environment state
    #[arg(long, value_name = "DIR", env = "CONVEYOR_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Working directory for execution
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,
}

pub async fn execute(args: RunArgs) -> Result<bool> {
    let workflow = super::load_workflow(&args.workflow)?;
    let working_dir = super::working_dir(args.working_dir.clone())?;

    let mut config = ExecutorConfig::for_workflow(&workflow)
        .with_working_dir(working_dir.clone())
        .with_cancel_grace_period(Duration::from_secs(args.grace_period));
    if let Some(max) = args.max_parallel {
        config = config.with_max_parallel_jobs(max);
    }
    if args.fail_fast {
        config = config.with_fail_fast(true);
    }
    for entry in &args.env {
        let Some((name, value)) = entry.split_once('=') else {
            bail!("Invalid variable format '{}'. Expected NAME=VALUE", entry);
        };
        config = config.with_env(name, value);
    }

    let steps_count: usize = workflow.jobs.values().map(|j| j.steps.len()).sum();
    output::info(&format!(
        "Workflow '{}': {} jobs, {} steps",
        workflow.display_name(),
        workflow.jobs.len(),
        steps_count
    ));

    let (tx, mut rx) = progress_channel();

    let mut executor = WorkflowExecutor::new(workflow.clone(), Arc::new(ShellStepExecutor::new()))
        .map_err(|e| eyre!("Failed to plan workflow: {}", e))?
        .with_config(config)
        .with_progress(tx.clone());

    if !workflow.environments.is_empty() {
        let engine = PromotionEngine::for_workflow(
            &workflow,
            super::state_store(args.state_dir.clone()),
            working_dir,
        )
        .with_progress(tx);
        executor = executor.with_promotion(Arc::new(engine));
    } else {
        drop(tx);
    }

    let token = executor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, cancelling run");
            token.cancel();
        }
    });

    let metadata = RunMetadata::new(args.event)
        .with_ref(args.git_ref)
        .with_sha(args.sha)
        .with_actor(args.actor);

    // Spawn execution in background
    let exec_handle = tokio::spawn(async move { executor.execute(metadata).await });

    // Process events in the foreground
    while let Some(event) = rx.recv().await {
        print_event(&event);
    }

    let report = exec_handle.await?;

    println!();
    output::header("Summary");
    for job in &report.jobs {
        let (label, color_fn) = output::job_label(job.status);
        let reason = job
            .reason
            .as_ref()
            .map(|r| format!(": {}", r))
            .unwrap_or_default();
        color_fn(&format!("  {:<32} {}{}", job.instance_id, label, reason));
    }
    for promotion in &report.promotions {
        output::dim(&format!(
            "  {} -> {} ({})",
            promotion.environment, promotion.version, promotion.status
        ));
    }

    Ok(report.success)
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted {
            workflow_name,
            total_jobs,
            total_layers,
        } => {
            println!();
            output::header(&format!(
                "Workflow '{}' ({} jobs in {} layers)",
                workflow_name, total_jobs, total_layers
            ));
        }

        ExecutionEvent::RunCompleted {
            success,
            cancelled,
            duration,
            ..
        } => {
            println!();
            if *success {
                output::success(&format!(
                    "Workflow completed successfully in {:.2}s",
                    duration.as_secs_f64()
                ));
            } else if *cancelled {
                output::failure(&format!(
                    "Workflow cancelled after {:.2}s",
                    duration.as_secs_f64()
                ));
            } else {
                output::failure(&format!(
                    "Workflow failed after {:.2}s",
                    duration.as_secs_f64()
                ));
            }
        }

        ExecutionEvent::RunCancelling { reason } => {
            output::warning(&format!("Cancelling: {}", reason));
        }

        ExecutionEvent::JobStarted {
            display_name,
            total_steps,
            ..
        } => {
            println!("    Job '{}' ({} steps)", display_name, total_steps);
        }

        ExecutionEvent::JobCompleted {
            job_id,
            status,
            duration,
            reason,
        } => {
            let (label, color_fn) = output::job_label(*status);
            let mut line = format!(
                "    Job '{}' {} ({:.2}s)",
                job_id,
                label,
                duration.as_secs_f64()
            );
            if let Some(reason) = reason {
                line.push_str(&format!(": {}", reason));
            }
            color_fn(&line);
        }

        ExecutionEvent::JobSkipped {
            job_id,
            status,
            reason,
        } => {
            let verb = if *status == JobStatus::Cancelled {
                "cancelled"
            } else {
                "skipped"
            };
            output::warning(&format!("  Job '{}' {}: {}", job_id, verb, reason));
        }

        ExecutionEvent::StepStarted {
            step_name,
            step_index,
            attempt,
            ..
        } => {
            if *attempt > 1 {
                println!(
                    "      [{}] {} (attempt {})",
                    step_index + 1,
                    step_name,
                    attempt
                );
            } else {
                println!("      [{}] {}", step_index + 1, step_name);
            }
        }

        ExecutionEvent::StepOutput {
            output: line,
            is_error,
            ..
        } => {
            if *is_error {
                output::step_error(line);
            } else {
                output::step_output(line);
            }
        }

        ExecutionEvent::StepRetrying {
            step_name,
            attempt,
            max_attempts,
            backoff,
            ..
        } => {
            output::warning(&format!(
                "      {} failed (attempt {}/{}), retrying in {:.1}s",
                step_name,
                attempt,
                max_attempts,
                backoff.as_secs_f64()
            ));
        }

        ExecutionEvent::StepCompleted {
            step_name,
            step_index,
            outcome,
            conclusion,
            duration,
            exit_code,
            ..
        } => {
            let mut line = format!(
                "      [{}] {} {} ({:.2}s",
                step_index + 1,
                step_name,
                output::step_label(*conclusion),
                duration.as_secs_f64()
            );
            if let Some(code) = exit_code {
                line.push_str(&format!(", exit code: {}", code));
            }
            line.push(')');
            if outcome != conclusion {
                line.push_str(&format!(" [outcome: {}]", outcome));
            }
            if conclusion == &conveyor_engine::StepConclusion::Success {
                output::dim_success(&line);
            } else {
                output::dim_failure(&line);
            }
        }

        ExecutionEvent::StepSkipped {
            step_name, reason, ..
        } => {
            output::dim(&format!("      {} skipped: {}", step_name, reason));
        }

        ExecutionEvent::PromotionStarted {
            environment,
            version,
        } => {
            output::status("Promoting", &format!("{} to {}", version, environment));
        }

        ExecutionEvent::PromotionPhaseChanged { environment, phase } => {
            output::dim(&format!("    {}: {}", environment, phase));
        }

        ExecutionEvent::HealthChecked {
            environment,
            attempt,
            healthy,
        } => {
            let verdict = if *healthy { "healthy" } else { "unhealthy" };
            output::dim(&format!(
                "    {}: health check {} {}",
                environment, attempt, verdict
            ));
        }

        ExecutionEvent::PromotionCompleted {
            environment,
            version,
            status,
            reason,
        } => {
            let line = format!("{} {} in {}", version, status, environment);
            match reason {
                None => output::success(&line),
                Some(reason) => output::failure(&format!("{}: {}", line, reason)),
            }
        }

        ExecutionEvent::Log { level, message, .. } => match level {
            LogLevel::Debug => output::dim(message),
            LogLevel::Info => output::info(message),
            LogLevel::Warning => output::warning(message),
            LogLevel::Error => output::error(message),
        },
    }
}

use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::bail;
use color_eyre::Result;

use conveyor_engine::{
    progress_channel, ExecutionEvent, PromotionEngine, PromotionResult, WorkflowSpec,
};

/// Deploy a version to an environment, optionally continuing through more
#[derive(Args, Debug)]
pub struct PromoteArgs {
    /// Workflow file declaring the environments
    pub workflow: PathBuf,

    /// Target environment
    pub environment: String,

    /// Version to deploy
    pub version: String,

    /// Environments to promote to afterwards, in order; promotion stops at
    /// the first rollback
    #[arg(long = "then", value_name = "ENV")]
    pub then: Vec<String>,

    /// Directory holding environment state
    #[arg(long, value_name = "DIR", env = "CONVEYOR_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Working directory for deploy and health-check commands
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,
}

/// Restore an environment's previous version
#[derive(Args, Debug)]
pub struct RollbackArgs {
    /// Workflow file declaring the environment
    pub workflow: PathBuf,

    /// Environment to roll back
    pub environment: String,

    /// Directory holding environment state
    #[arg(long, value_name = "DIR", env = "CONVEYOR_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Working directory for deploy and health-check commands
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,
}

fn check_environments(workflow: &WorkflowSpec, names: &[String]) -> Result<()> {
    for name in names {
        if !workflow.environments.contains_key(name) {
            let known: Vec<&str> = workflow.environments.keys().map(String::as_str).collect();
            bail!(
                "Unknown environment '{}' (declared: {})",
                name,
                if known.is_empty() {
                    "none".to_string()
                } else {
                    known.join(", ")
                }
            );
        }
    }
    Ok(())
}

fn engine(
    workflow: &WorkflowSpec,
    state_dir: Option<PathBuf>,
    working_dir: Option<PathBuf>,
) -> Result<(PromotionEngine, tokio::task::JoinHandle<()>)> {
    let (tx, mut rx) = progress_channel();
    let engine = PromotionEngine::for_workflow(
        workflow,
        super::state_store(state_dir),
        super::working_dir(working_dir)?,
    )
    .with_progress(tx);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ExecutionEvent::PromotionPhaseChanged { environment, phase } => {
                    output::dim(&format!("    {}: {}", environment, phase));
                }
                ExecutionEvent::HealthChecked {
                    environment,
                    attempt,
                    healthy,
                } => {
                    let verdict = if healthy { "healthy" } else { "unhealthy" };
                    output::dim(&format!(
                        "    {}: health check {} {}",
                        environment, attempt, verdict
                    ));
                }
                _ => {}
            }
        }
    });

    Ok((engine, printer))
}

fn report(result: &PromotionResult) {
    if result.is_promoted() {
        output::success(&format!(
            "{} promoted to {} ({} health check(s))",
            result.version, result.environment, result.health_check_attempts
        ));
        return;
    }

    let reason = result
        .reason
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string());
    output::failure(&format!(
        "{} rolled back in {}: {}",
        result.version, result.environment, reason
    ));
    match (&result.restored_version, result.rollback_healthy) {
        (Some(restored), Some(false)) => {
            output::warning(&format!("Restored {} but it is not healthy", restored))
        }
        (Some(restored), _) => output::info(&format!("Restored {}", restored)),
        (None, _) => output::warning("No previous version to restore"),
    }
}

pub async fn promote(args: PromoteArgs) -> Result<bool> {
    let workflow = super::load_workflow(&args.workflow)?;
    let mut environments = vec![args.environment.clone()];
    environments.extend(args.then.iter().cloned());
    check_environments(&workflow, &environments)?;

    let (engine, printer) = engine(&workflow, args.state_dir, args.working_dir)?;

    output::status(
        "Promoting",
        &format!("{} through {}", args.version, environments.join(" -> ")),
    );
    let results = engine
        .promote_through(&environments, &args.version)
        .await;
    drop(engine);
    printer.await?;

    for result in &results {
        report(result);
    }

    let reached = results.iter().filter(|r| r.is_promoted()).count();
    if reached < environments.len() {
        let stopped = &environments[results.len().saturating_sub(1)..];
        output::dim(&format!("  Not promoted: {}", stopped.join(", ")));
        return Ok(false);
    }
    Ok(true)
}

pub async fn rollback(args: RollbackArgs) -> Result<bool> {
    let workflow = super::load_workflow(&args.workflow)?;
    check_environments(&workflow, std::slice::from_ref(&args.environment))?;

    let (engine, printer) = engine(&workflow, args.state_dir, args.working_dir)?;

    output::status("Rolling back", &args.environment);
    let outcome = engine.rollback(&args.environment).await;
    drop(engine);
    printer.await?;

    match outcome {
        Ok(result) => {
            let restored = result.restored_version.as_deref().unwrap_or("?");
            if result.rollback_healthy == Some(false) {
                output::warning(&format!(
                    "{} restored {} but it is not healthy",
                    args.environment, restored
                ));
                Ok(false)
            } else {
                output::success(&format!("{} restored {}", args.environment, restored));
                Ok(true)
            }
        }
        Err(e) => {
            output::error(&format!("Rollback failed: {}", e));
            Ok(false)
        }
    }
}

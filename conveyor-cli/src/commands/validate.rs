use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use conveyor_engine::execution::expand_jobs;
use conveyor_engine::{ExecutionGraph, WorkflowParser};

/// Validate a workflow YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Also print the execution layers
    #[arg(long)]
    pub plan: bool,
}

pub fn execute(args: ValidateArgs) -> Result<bool> {
    let path = &args.workflow;

    if !path.exists() {
        color_eyre::eyre::bail!("Workflow file not found: {}", path.display());
    }

    output::status("Validating", &format!("{}", path.display()));

    // Step 1: Parse YAML syntax
    let content = std::fs::read_to_string(path)?;
    let workflow = match WorkflowParser::parse(&content) {
        Ok(w) => w,
        Err(e) => {
            output::error(&format!("Parse error: {}", e));
            return Ok(false);
        }
    };

    output::check("YAML syntax valid");

    let steps_count: usize = workflow.jobs.values().map(|j| j.steps.len()).sum();
    output::check(&format!(
        "Structure: {} jobs, {} steps, {} environments",
        workflow.jobs.len(),
        steps_count,
        workflow.environments.len()
    ));

    // Step 2: Expressions, matrices and dependencies
    if let Err(e) = WorkflowParser::validate(&workflow) {
        output::error(&format!("Validation error: {}", e));
        return Ok(false);
    }

    output::check("Semantic validation passed");

    if args.plan {
        let instances = expand_jobs(&workflow)?;
        let graph = ExecutionGraph::build(&instances)?;
        output::check(&format!("{} job instances", graph.len()));
        for (index, layer) in graph.layers().iter().enumerate() {
            output::dim(&format!("  layer {}: {}", index + 1, layer.join(", ")));
        }
    }

    println!();
    output::success("Workflow is valid");

    Ok(true)
}

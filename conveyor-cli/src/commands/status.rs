use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use conveyor_engine::{HealthStatus, StateStore};

/// Show the recorded state of an environment
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Environment name
    pub environment: String,

    /// Directory holding environment state
    #[arg(long, value_name = "DIR", env = "CONVEYOR_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Number of history entries to show
    #[arg(long, default_value_t = 5)]
    pub history: usize,
}

pub async fn execute(args: StatusArgs) -> Result<bool> {
    let store = super::state_store(args.state_dir);

    let Some(state) = store.get(&args.environment).await? else {
        output::info(&format!(
            "'{}' has no recorded deployments ({})",
            args.environment,
            store.dir().display()
        ));
        return Ok(true);
    };

    output::header(&format!("Environment '{}'", state.environment));
    match (&state.current_version, state.deployed_at) {
        (Some(version), Some(at)) => println!("  version:  {} (deployed {})", version, at.to_rfc3339()),
        (Some(version), None) => println!("  version:  {}", version),
        _ => println!("  version:  none"),
    }

    let health = format!("  health:   {}", state.health);
    match state.health {
        HealthStatus::Healthy => output::dim_success(&health),
        HealthStatus::Unhealthy => output::dim_failure(&health),
        HealthStatus::Unknown => output::dim(&health),
    }

    if !state.history.is_empty() {
        println!("  history:");
        for record in state.history.iter().rev().take(args.history) {
            println!("    {}  {}", record.deployed_at.to_rfc3339(), record.version);
        }
        if state.history.len() > args.history {
            output::dim(&format!(
                "    ... {} older",
                state.history.len() - args.history
            ));
        }
    }

    Ok(state.health != HealthStatus::Unhealthy)
}

mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use commands::promote::{PromoteArgs, RollbackArgs};
use commands::run::RunArgs;
use commands::status::StatusArgs;
use commands::validate::ValidateArgs;

/// Run CI/CD workflows locally and promote builds through environments
#[derive(Parser, Debug)]
#[command(name = "conveyor", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a workflow
    Run(RunArgs),

    /// Check a workflow file without running it
    Validate(ValidateArgs),

    /// Deploy a version to an environment with health checks
    Promote(PromoteArgs),

    /// Restore an environment's previous version
    Rollback(RollbackArgs),

    /// Show the recorded state of an environment
    Status(StatusArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // Logs go to stderr; progress output is handled by the commands
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("CONVEYOR_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let ok = match cli.command {
        Command::Run(args) => commands::run::execute(args).await?,
        Command::Validate(args) => commands::validate::execute(args)?,
        Command::Promote(args) => commands::promote::promote(args).await?,
        Command::Rollback(args) => commands::promote::rollback(args).await?,
        Command::Status(args) => commands::status::execute(args).await?,
    };

    if !ok {
        std::process::exit(1);
    }

    Ok(())
}

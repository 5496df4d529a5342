pub mod promote;
pub mod run;
pub mod status;
pub mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use conveyor_engine::{JsonFileStateStore, WorkflowParser, WorkflowSpec};

/// Parse and validate a workflow file
pub fn load_workflow(path: &Path) -> Result<WorkflowSpec> {
    if !path.exists() {
        bail!("Workflow file not found: {}", path.display());
    }
    WorkflowParser::from_file(path)
        .wrap_err_with(|| format!("Invalid workflow {}", path.display()))
}

/// State store rooted at `dir`, or at `~/.conveyor/state`
pub fn state_store(dir: Option<PathBuf>) -> Arc<JsonFileStateStore> {
    Arc::new(JsonFileStateStore::new(
        dir.unwrap_or_else(JsonFileStateStore::default_dir),
    ))
}

/// Working directory from a flag, defaulting to the current directory
pub fn working_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => Ok(std::env::current_dir()?),
    }
}

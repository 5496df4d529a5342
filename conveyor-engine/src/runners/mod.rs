// Runners Module
// Step execution delegates

pub mod shell;

pub use shell::{Shell, ShellStepExecutor};

use crate::execution::cancel::CancellationToken;
use crate::execution::events::ProgressSender;
use crate::value::Value;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// What a step does
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    /// Run a command through a shell
    Run {
        command: String,
        shell: Option<String>,
    },
    /// Invoke a named action with inputs
    Uses {
        action: String,
        inputs: BTreeMap<String, Value>,
    },
}

/// A fully resolved step, ready to run
#[derive(Debug, Clone)]
pub struct StepInvocation {
    /// Instance id of the job running the step
    pub job_id: String,
    pub step_name: String,
    pub step_index: usize,
    pub action: StepAction,
    /// Merged and interpolated environment
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
    /// Where to stream output lines, if anyone is listening
    pub progress: Option<ProgressSender>,
}

/// Result of one step attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub exit_code: Option<i32>,
    pub outputs: BTreeMap<String, String>,
    pub stdout: String,
    pub stderr: String,
    /// Set when the step could not run or did not finish normally
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }

    /// Short description of why the attempt failed
    pub fn failure_message(&self) -> String {
        match (&self.error, self.exit_code) {
            (Some(error), _) => error.clone(),
            (None, Some(code)) => format!("exited with code {}", code),
            (None, None) => "terminated without an exit code".to_string(),
        }
    }
}

/// Runs a single step attempt.
///
/// Implementations must watch `cancel` and return promptly once it fires;
/// the scheduler abandons steps that ignore it.
#[async_trait::async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &StepInvocation, cancel: CancellationToken) -> StepOutcome;
}

// Shell Step Executor
// Runs `run` steps and registered `uses` actions as shell processes

use crate::execution::cancel::CancellationToken;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::runners::{StepAction, StepExecutor, StepInvocation, StepOutcome};
use crate::value::Value;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Shell types supported by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// Default shell (sh on Unix, cmd on Windows)
    Default,
    /// Bash shell
    Bash,
    /// PowerShell Core (cross-platform)
    Pwsh,
}

impl Shell {
    /// Resolve a `shell:` value from the workflow
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sh" | "default" => Some(Shell::Default),
            "bash" => Some(Shell::Bash),
            "pwsh" | "powershell" => Some(Shell::Pwsh),
            _ => None,
        }
    }

    /// Get the shell executable and arguments
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Bash => ("bash", &["-c"]),
            Shell::Pwsh => ("pwsh", &["-NoLogo", "-NoProfile", "-Command"]),
        }
    }

    /// A command running `script` through this shell
    pub(crate) fn command(&self, script: &str) -> Command {
        let (shell_cmd, shell_args) = self.get_command();
        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args);
        cmd.arg(script);
        cmd
    }
}

/// Step executor backed by local shell processes.
///
/// `uses` steps resolve through a registry of action name to command; the
/// step's inputs are exported as `INPUT_<NAME>`.
#[derive(Debug, Clone)]
pub struct ShellStepExecutor {
    default_shell: Shell,
    actions: HashMap<String, String>,
}

impl ShellStepExecutor {
    pub fn new() -> Self {
        Self {
            default_shell: Shell::Default,
            actions: HashMap::new(),
        }
    }

    pub fn with_default_shell(mut self, shell: Shell) -> Self {
        self.default_shell = shell;
        self
    }

    /// Register a command for a `uses` action name
    pub fn with_action(mut self, name: impl Into<String>, command: impl Into<String>) -> Self {
        self.actions.insert(name.into(), command.into());
        self
    }

    fn resolve(&self, action: &StepAction) -> Result<(Shell, String, HashMap<String, String>), String> {
        match action {
            StepAction::Run { command, shell } => {
                let shell = match shell {
                    Some(name) => {
                        Shell::parse(name).ok_or_else(|| format!("unsupported shell '{}'", name))?
                    }
                    None => self.default_shell,
                };
                Ok((shell, command.clone(), HashMap::new()))
            }
            StepAction::Uses { action, inputs } => {
                let command = self
                    .actions
                    .get(action)
                    .ok_or_else(|| format!("unknown action '{}'", action))?;
                Ok((self.default_shell, command.clone(), input_env(inputs)))
            }
        }
    }

    async fn run_command(
        &self,
        shell: Shell,
        script: &str,
        env: &HashMap<String, String>,
        working_dir: &Path,
        step: &StepInvocation,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let (shell_cmd, _) = shell.get_command();

        let mut cmd = shell.command(script);
        cmd.current_dir(working_dir);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return StepOutcome::failure(format!(
                    "failed to spawn shell process '{}': {}",
                    shell_cmd, e
                ));
            }
        };

        let stdout_handle = child.stdout.take().map(|stdout| {
            tokio::spawn(collect_lines(
                stdout,
                step.progress.clone(),
                step.job_id.clone(),
                step.step_index,
                false,
            ))
        });
        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(collect_lines(
                stderr,
                step.progress.clone(),
                step.job_id.clone(),
                step.step_index,
                true,
            ))
        });

        let (exit_code, error) = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => (status.code(), None),
                Err(e) => (None, Some(format!("failed to wait for process: {}", e))),
            },
            _ = cancel.cancelled() => {
                tracing::debug!(job = %step.job_id, step = %step.step_name, "killing cancelled step");
                let _ = child.start_kill();
                let _ = child.wait().await;
                (None, Some("cancelled".to_string()))
            }
        };

        let stdout = match stdout_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        StepOutcome {
            exit_code,
            outputs: parse_output_commands(&stdout),
            stdout,
            stderr,
            error,
        }
    }
}

impl Default for ShellStepExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StepExecutor for ShellStepExecutor {
    async fn execute(&self, step: &StepInvocation, cancel: CancellationToken) -> StepOutcome {
        let (shell, script, extra_env) = match self.resolve(&step.action) {
            Ok(resolved) => resolved,
            Err(message) => return StepOutcome::failure(message),
        };

        let mut env = step.env.clone();
        env.extend(extra_env);

        self.run_command(shell, &script, &env, &step.working_dir, step, &cancel)
            .await
    }
}

/// Read a stream line by line, forwarding each line as a progress event
async fn collect_lines<R>(
    reader: R,
    progress: Option<ProgressSender>,
    job_id: String,
    step_index: usize,
    is_error: bool,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut output = String::new();
    loop {
        buf.clear();
        // Raw bytes so a stray non-UTF-8 byte does not stop draining the pipe
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "stopped reading step output");
                break;
            }
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        progress.send_event(ExecutionEvent::step_output(
            job_id.clone(),
            step_index,
            line.clone(),
            is_error,
        ));
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&line);
    }
    output
}

/// `INPUT_<NAME>` variables for an action's inputs
fn input_env(inputs: &BTreeMap<String, Value>) -> HashMap<String, String> {
    inputs
        .iter()
        .map(|(name, value)| {
            let key = format!("INPUT_{}", name.to_uppercase().replace([' ', '-'], "_"));
            (key, value.as_string())
        })
        .collect()
}

/// Parse `::set-output name=<key>::<value>` lines; a later line wins
fn parse_output_commands(output: &str) -> BTreeMap<String, String> {
    let mut outputs = BTreeMap::new();

    for line in output.lines() {
        let Some(rest) = line.trim_start().strip_prefix("::set-output name=") else {
            continue;
        };
        if let Some((name, value)) = rest.split_once("::") {
            let name = name.trim();
            if !name.is_empty() {
                outputs.insert(name.to_string(), value.to_string());
            }
        }
    }

    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::progress_channel;
    use std::time::Duration;

    fn invocation(command: &str) -> StepInvocation {
        StepInvocation {
            job_id: "build".to_string(),
            step_name: "step".to_string(),
            step_index: 0,
            action: StepAction::Run {
                command: command.to_string(),
                shell: None,
            },
            env: HashMap::new(),
            working_dir: std::env::current_dir().unwrap(),
            progress: None,
        }
    }

    #[tokio::test]
    async fn test_shell_echo() {
        let executor = ShellStepExecutor::new();
        let outcome = executor
            .execute(&invocation("echo hello"), CancellationToken::new())
            .await;

        assert!(outcome.is_success());
        assert!(outcome.stdout.contains("hello"));
        assert!(outcome.stderr.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_with_env_and_exit_code() {
        let executor = ShellStepExecutor::new();
        let mut step = invocation("echo $MY_VAR; exit 42");
        step.env.insert("MY_VAR".to_string(), "test_value".to_string());

        let outcome = executor.execute(&step, CancellationToken::new()).await;

        assert_eq!(outcome.exit_code, Some(42));
        assert!(!outcome.is_success());
        assert!(outcome.stdout.contains("test_value"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_survives_non_utf8_output() {
        let executor = ShellStepExecutor::new();
        let step = invocation(
            "printf '\\377\\n'; head -c 300000 /dev/zero | tr '\\0' a; echo; \
             echo '::set-output name=result::done'",
        );
        let outcome = executor.execute(&step, CancellationToken::new()).await;

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stdout.starts_with('\u{FFFD}'));
        assert!(outcome.stdout.len() > 300_000);
        assert_eq!(outcome.outputs.get("result").map(String::as_str), Some("done"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_outputs_and_streaming() {
        let (tx, mut rx) = progress_channel();
        let executor = ShellStepExecutor::new();
        let mut step = invocation("echo '::set-output name=version::1.2.3'; echo oops >&2");
        step.progress = Some(tx);

        let outcome = executor.execute(&step, CancellationToken::new()).await;
        drop(step);

        assert!(outcome.is_success());
        assert_eq!(outcome.outputs.get("version"), Some(&"1.2.3".to_string()));
        assert!(outcome.stderr.contains("oops"));

        let mut lines = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ExecutionEvent::StepOutput { output, is_error, .. } = event {
                lines.push((output, is_error));
            }
        }
        assert!(lines.contains(&("oops".to_string(), true)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_uses_action_exports_inputs() {
        let executor =
            ShellStepExecutor::new().with_action("greet", "echo \"hi $INPUT_WHO_NAME\"");
        let mut step = invocation("");
        step.action = StepAction::Uses {
            action: "greet".to_string(),
            inputs: [("who-name".to_string(), Value::from("ops"))].into_iter().collect(),
        };

        let outcome = executor.execute(&step, CancellationToken::new()).await;
        assert!(outcome.is_success());
        assert!(outcome.stdout.contains("hi ops"));
    }

    #[tokio::test]
    async fn test_unknown_action_fails() {
        let executor = ShellStepExecutor::new();
        let mut step = invocation("");
        step.action = StepAction::Uses {
            action: "missing".to_string(),
            inputs: BTreeMap::new(),
        };

        let outcome = executor.execute(&step, CancellationToken::new()).await;
        assert!(!outcome.is_success());
        assert!(outcome.failure_message().contains("unknown action 'missing'"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_process() {
        let executor = ShellStepExecutor::new();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(&invocation("exec sleep 30"), token),
        )
        .await
        .expect("cancelled step should return");

        assert!(!outcome.is_success());
        assert_eq!(outcome.error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_parse_output_commands() {
        let output = r#"
Starting build
::set-output name=version::1.0.0
::set-output name=url::http://example.com::8080
::set-output name=version::1.0.1
Build complete
"#;

        let outputs = parse_output_commands(output);
        assert_eq!(outputs.get("version"), Some(&"1.0.1".to_string()));
        assert_eq!(
            outputs.get("url"),
            Some(&"http://example.com::8080".to_string())
        );
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn test_shell_parse() {
        assert_eq!(Shell::parse("bash"), Some(Shell::Bash));
        assert_eq!(Shell::parse("PowerShell"), Some(Shell::Pwsh));
        assert_eq!(Shell::parse("fish"), None);
    }
}

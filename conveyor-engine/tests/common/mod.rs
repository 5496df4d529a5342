// Shared fixtures for the engine integration tests

#![allow(dead_code)]

use conveyor_engine::promotion::{Deployer, HealthCheck};
use conveyor_engine::runners::StepAction;
use conveyor_engine::{CancellationToken, HealthStatus, StepExecutor, StepInvocation, StepOutcome};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Step executor driven by the command text.
///
/// - `ok` succeeds, `fail` exits 1
/// - `flaky:N` fails until its Nth call
/// - `sleep:MS` sleeps, stopping early on cancellation
/// - `hang:MS` sleeps and ignores cancellation
/// - `emit:KEY=VALUE` succeeds with an output
///
/// Anything else succeeds. Every command is recorded in call order.
#[derive(Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<String>>,
    counts: Mutex<HashMap<String, usize>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of steps observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn call_count(&self, command: &str) -> usize {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(command.to_string()).or_default();
        *count += 1;
        *count
    }
}

#[async_trait::async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, step: &StepInvocation, cancel: CancellationToken) -> StepOutcome {
        let command = match &step.action {
            StepAction::Run { command, .. } => command.clone(),
            StepAction::Uses { action, .. } => action.clone(),
        };
        self.calls.lock().unwrap().push(command.clone());
        let call = self.call_count(&command);

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let outcome = match command.split_once(':') {
            Some(("flaky", n)) => {
                let succeed_on: usize = n.parse().unwrap();
                if call >= succeed_on {
                    StepOutcome::success()
                } else {
                    StepOutcome::default().with_exit_code(1)
                }
            }
            Some(("sleep", ms)) => {
                if cancel.sleep(Duration::from_millis(ms.parse().unwrap())).await {
                    StepOutcome::success()
                } else {
                    StepOutcome::failure("cancelled")
                }
            }
            Some(("hang", ms)) => {
                tokio::time::sleep(Duration::from_millis(ms.parse().unwrap())).await;
                StepOutcome::success()
            }
            Some(("emit", pair)) => {
                let (key, value) = pair.split_once('=').unwrap();
                StepOutcome::success().with_output(key, value)
            }
            _ if command == "fail" => StepOutcome::default().with_exit_code(1),
            _ => StepOutcome::success(),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Deployer that records every call and fails for listed versions
#[derive(Default)]
pub struct RecordingDeployer {
    pub log: Mutex<Vec<String>>,
    pub delay: Duration,
    pub failing: Vec<String>,
}

impl RecordingDeployer {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Deployer for RecordingDeployer {
    async fn apply(&self, environment: &str, version: &str) -> Result<(), String> {
        self.log
            .lock()
            .unwrap()
            .push(format!("start {} {}", environment, version));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("end {} {}", environment, version));

        if self.failing.iter().any(|v| v == version) {
            Err(format!("{} rejected", version))
        } else {
            Ok(())
        }
    }
}

/// Health check answering from a script, then a fallback
pub struct ScriptedHealth {
    script: Mutex<VecDeque<HealthStatus>>,
    fallback: HealthStatus,
    pub calls: AtomicUsize,
}

impl ScriptedHealth {
    pub fn always(status: HealthStatus) -> Self {
        Self::new(Vec::new(), status)
    }

    pub fn new(script: Vec<HealthStatus>, fallback: HealthStatus) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl HealthCheck for ScriptedHealth {
    async fn check(&self, _environment: &str) -> HealthStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

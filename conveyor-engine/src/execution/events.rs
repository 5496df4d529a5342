// Execution Events
// Progress reporting for workflow runs and promotions

use crate::execution::context::{JobStatus, StepConclusion};
use crate::promotion::state::{PromotionPhase, PromotionStatus};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run started
    RunStarted {
        workflow_name: String,
        total_jobs: usize,
        total_layers: usize,
    },

    /// Run finished
    RunCompleted {
        workflow_name: String,
        success: bool,
        cancelled: bool,
        duration: Duration,
    },

    /// Cancellation was requested; running work is being stopped
    RunCancelling { reason: String },

    /// Job instance started
    JobStarted {
        job_id: String,
        display_name: String,
        total_steps: usize,
    },

    /// Job instance finished (success, failure or cancelled)
    JobCompleted {
        job_id: String,
        status: JobStatus,
        duration: Duration,
        reason: Option<String>,
    },

    /// Job instance never started
    JobSkipped {
        job_id: String,
        status: JobStatus,
        reason: String,
    },

    /// Step attempt started
    StepStarted {
        job_id: String,
        step_name: String,
        step_index: usize,
        attempt: u32,
    },

    /// Step output (stdout/stderr)
    StepOutput {
        job_id: String,
        step_index: usize,
        output: String,
        is_error: bool,
    },

    /// Step attempt failed and will be retried after `backoff`
    StepRetrying {
        job_id: String,
        step_name: String,
        step_index: usize,
        attempt: u32,
        max_attempts: u32,
        backoff: Duration,
    },

    /// Step finished
    StepCompleted {
        job_id: String,
        step_name: String,
        step_index: usize,
        outcome: StepConclusion,
        conclusion: StepConclusion,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Step was skipped (condition false or run cancelled)
    StepSkipped {
        job_id: String,
        step_name: String,
        step_index: usize,
        reason: String,
    },

    /// Promotion of a version into an environment started
    PromotionStarted { environment: String, version: String },

    /// Promotion moved to a new phase
    PromotionPhaseChanged {
        environment: String,
        phase: PromotionPhase,
    },

    /// A health check attempt finished
    HealthChecked {
        environment: String,
        attempt: u32,
        healthy: bool,
    },

    /// Promotion finished
    PromotionCompleted {
        environment: String,
        version: String,
        status: PromotionStatus,
        reason: Option<String>,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        job_id: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn job_started(
        job_id: impl Into<String>,
        display_name: impl Into<String>,
        total_steps: usize,
    ) -> Self {
        Self::JobStarted {
            job_id: job_id.into(),
            display_name: display_name.into(),
            total_steps,
        }
    }

    pub fn job_completed(
        job_id: impl Into<String>,
        status: JobStatus,
        duration: Duration,
        reason: Option<String>,
    ) -> Self {
        Self::JobCompleted {
            job_id: job_id.into(),
            status,
            duration,
            reason,
        }
    }

    pub fn job_skipped(job_id: impl Into<String>, status: JobStatus, reason: impl Into<String>) -> Self {
        Self::JobSkipped {
            job_id: job_id.into(),
            status,
            reason: reason.into(),
        }
    }

    pub fn step_output(
        job_id: impl Into<String>,
        step_index: usize,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            job_id: job_id.into(),
            step_index,
            output: output.into(),
            is_error,
        }
    }

    pub fn step_skipped(
        job_id: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
        reason: impl Into<String>,
    ) -> Self {
        Self::StepSkipped {
            job_id: job_id.into(),
            step_name: step_name.into(),
            step_index,
            reason: reason.into(),
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            job_id,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            job_id,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            job_id,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::job_started("build", "Build", 2));
        tx.send_event(ExecutionEvent::step_output("build", 0, "compiling", false));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, ExecutionEvent::JobStarted { total_steps: 2, .. }));

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(event2, ExecutionEvent::StepOutput { .. }));
    }

    #[test]
    fn test_event_construction() {
        let event = ExecutionEvent::job_completed(
            "test-linux",
            JobStatus::Failure,
            Duration::from_secs(30),
            Some("step 'unit' failed".to_string()),
        );

        if let ExecutionEvent::JobCompleted {
            job_id,
            status,
            duration,
            reason,
        } = event
        {
            assert_eq!(job_id, "test-linux");
            assert_eq!(status, JobStatus::Failure);
            assert_eq!(duration, Duration::from_secs(30));
            assert_eq!(reason.as_deref(), Some("step 'unit' failed"));
        } else {
            panic!("wrong event type");
        }
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = progress_channel();
        drop(rx);
        tx.send_event(ExecutionEvent::info("nobody listening", None));

        let sender: Option<ProgressSender> = None;
        sender.send_event(ExecutionEvent::info("test", None));
    }
}

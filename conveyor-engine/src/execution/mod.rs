// Execution Engine Module
// Handles matrix expansion, DAG construction and job scheduling

pub mod cancel;
pub mod context;
pub mod events;
pub mod executor;
pub mod graph;
pub mod matrix;

// Re-export key types
pub use cancel::CancellationToken;
pub use context::{
    FailureReason, JobResult, JobStatus, RunContext, RunMetadata, RunReport, StepConclusion,
    StepResult,
};
pub use events::{progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use executor::{ExecutorConfig, WorkflowExecutor};
pub use graph::{ExecutionGraph, GraphError, GraphErrorKind, GraphNode};
pub use matrix::{expand_jobs, JobInstance, MatrixCombination, MatrixExpander};

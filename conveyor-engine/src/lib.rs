// Conveyor Engine Library
// Workflow expressions, matrix expansion, job scheduling and environment promotion

pub mod error;
pub mod execution;
pub mod expression;
pub mod promotion;
pub mod runners;
pub mod value;
pub mod workflow;

// Re-export commonly used types
pub use error::{EngineError, EngineResult};
pub use value::Value;

// Re-export expression types
pub use expression::{ExpressionContext, ExpressionEngine, ExpressionError};

// Re-export execution types
pub use execution::{
    progress_channel, CancellationToken, ExecutionEvent, ExecutionGraph, ExecutorConfig,
    FailureReason, GraphError, JobResult, JobStatus, ProgressReceiver, ProgressSender,
    RunMetadata, RunReport, StepConclusion, StepResult, WorkflowExecutor,
};

// Re-export promotion types
pub use promotion::{
    EnvironmentState, HealthStatus, InMemoryStateStore, JsonFileStateStore, PromotionConfig,
    PromotionEngine, PromotionError, PromotionResult, PromotionStatus, StateStore,
};

// Re-export runner types
pub use runners::{ShellStepExecutor, StepExecutor, StepInvocation, StepOutcome};

// Re-export workflow types
pub use workflow::{JobSpec, StepSpec, WorkflowParser, WorkflowSpec};

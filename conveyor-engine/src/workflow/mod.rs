// Workflow Module
// Workflow definitions and the YAML loader

pub mod models;
pub mod parser;

pub use models::{
    Defaults, DeploymentTarget, EnvironmentSpec, JobNeeds, JobSpec, Matrix, RetryPolicy,
    RunDefaults, StepSpec, Strategy, WorkflowSpec,
};
pub use parser::WorkflowParser;

// Promotion Module
// Environment promotion with health checks, rollback and persisted state

pub mod delegates;
pub mod engine;
pub mod state;
pub mod store;

pub use delegates::{CommandDeployer, CommandHealthCheck, Deployer, HealthCheck};
pub use engine::{PromotionConfig, PromotionEngine};
pub use state::{
    EnvironmentState, HealthStatus, PromotionError, PromotionPhase, PromotionResult,
    PromotionStatus, VersionRecord,
};
pub use store::{InMemoryStateStore, JsonFileStateStore, StateStore, StoreError};

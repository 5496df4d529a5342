// Engine Errors
// Load-time errors that stop a workflow before anything runs

use crate::execution::graph::GraphError;
use crate::expression::ParseExprError;
use crate::promotion::store::StoreError;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid expression in {location}: {source}")]
    Parse {
        location: String,
        source: ParseExprError,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid workflow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn parse(location: impl Into<String>, source: ParseExprError) -> Self {
        Self::Parse {
            location: location.into(),
            source,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

// State Store
// Persistence for environment state

use crate::promotion::state::EnvironmentState;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid state file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid environment name '{0}'")]
    InvalidName(String),
}

/// Storage contract for environment state
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Load an environment's state; `None` if nothing was ever stored
    async fn get(&self, environment: &str) -> Result<Option<EnvironmentState>, StoreError>;

    async fn put(&self, state: &EnvironmentState) -> Result<(), StoreError>;
}

/// Volatile store, mostly for tests and dry runs
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<String, EnvironmentState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, environment: &str) -> Result<Option<EnvironmentState>, StoreError> {
        Ok(self.states.read().await.get(environment).cloned())
    }

    async fn put(&self, state: &EnvironmentState) -> Result<(), StoreError> {
        self.states
            .write()
            .await
            .insert(state.environment.clone(), state.clone());
        Ok(())
    }
}

/// One pretty-printed JSON file per environment in a directory
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.conveyor/state`, or `./.conveyor/state` without a home directory
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".conveyor")
            .join("state")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, environment: &str) -> Result<PathBuf, StoreError> {
        let valid = !environment.is_empty()
            && environment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && environment != "."
            && environment != "..";
        if !valid {
            return Err(StoreError::InvalidName(environment.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", environment)))
    }
}

#[async_trait::async_trait]
impl StateStore for JsonFileStateStore {
    async fn get(&self, environment: &str) -> Result<Option<EnvironmentState>, StoreError> {
        let path = self.path_for(environment)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StoreError::Json { path, source })
    }

    async fn put(&self, state: &EnvironmentState) -> Result<(), StoreError> {
        let path = self.path_for(&state.environment)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let json = serde_json::to_string_pretty(state).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;

        // Atomic replace: write a sibling file, then rename over the target
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }
}

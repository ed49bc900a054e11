// Storage module for client state persistence
//
// Persists guard pools and vanguard slots between runs:
// - MemoryStore: process-local, for tests and ephemeral clients
// - JsonFileStore: a single JSON document on disk

use crate::error::{Result, TorError};
use crate::vanguards::PoolState;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Somewhere guard and vanguard state can be kept between runs
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last saved state, `None` if nothing was ever saved
    async fn load(&self) -> Result<Option<PoolState>>;

    /// Replace the saved state
    async fn save(&self, state: &PoolState) -> Result<()>;
}

/// In-memory state store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Option<PoolState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<Option<PoolState>> {
        let state = self
            .state
            .lock()
            .map_err(|_| TorError::Storage("state lock poisoned".into()))?;
        Ok(state.clone())
    }

    async fn save(&self, state: &PoolState) -> Result<()> {
        let mut slot = self
            .state
            .lock()
            .map_err(|_| TorError::Storage("state lock poisoned".into()))?;
        *slot = Some(state.clone());
        Ok(())
    }
}

/// State kept as one JSON file
///
/// Saves write a sibling temporary file and rename it over the target, so a
/// crash mid-save leaves the previous state intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<Option<PoolState>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No saved state at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(TorError::Storage(e.to_string())),
        };
        let state: PoolState =
            serde_json::from_slice(&bytes).map_err(|e| TorError::Storage(e.to_string()))?;
        log::info!(
            "📂 Loaded state: {} primary guards, {} vanguards",
            state.guards.primary.len(),
            state.second_layer.len()
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &PoolState) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(state).map_err(|e| TorError::Storage(e.to_string()))?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, &json)
            .await
            .map_err(|e| TorError::Storage(e.to_string()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| TorError::Storage(e.to_string()))?;
        log::debug!("💾 Saved state to {}", self.path.display());
        Ok(())
    }
}

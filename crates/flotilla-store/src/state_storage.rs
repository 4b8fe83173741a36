//! Durable storage for agent state snapshots.
//!
//! Contract: `save` is durable when it resolves; `load` returns the last
//! successfully saved state or `None`. The file backend writes through a
//! temp file and renames so a crash mid-write never corrupts the previous
//! snapshot.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use flotilla_types::SavedState;

use crate::StoreError;

/// Abstraction over durable agent-state storage.
#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Last successfully saved state, or `None`.
    async fn load(&self, agent_id: &str) -> Result<Option<SavedState>>;

    /// Durably persist a snapshot. Atomic per agent.
    async fn save(&self, agent_id: &str, state: &SavedState) -> Result<()>;

    /// Remove a persisted snapshot; absent snapshots are not an error.
    async fn delete(&self, agent_id: &str) -> Result<()>;

    /// Ids of all agents with a persisted snapshot.
    async fn list(&self) -> Result<Vec<String>>;
}

//─────────────────────────────
//  In-memory backend
//─────────────────────────────

/// Non-durable state storage for tests and development.
#[derive(Default)]
pub struct MemoryStateStorage {
    states: RwLock<HashMap<String, SavedState>>,
}

impl MemoryStateStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStorage for MemoryStateStorage {
    async fn load(&self, agent_id: &str) -> Result<Option<SavedState>> {
        Ok(self.states.read().await.get(agent_id).cloned())
    }

    async fn save(&self, agent_id: &str, state: &SavedState) -> Result<()> {
        self.states
            .write()
            .await
            .insert(agent_id.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, agent_id: &str) -> Result<()> {
        self.states.write().await.remove(agent_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.states.read().await.keys().cloned().collect())
    }
}

//─────────────────────────────
//  File backend
//─────────────────────────────

/// One-JSON-file-per-agent state storage with atomic replace.
pub struct FileStateStorage {
    dir: PathBuf,
}

impl FileStateStorage {
    /// Open storage rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating state dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, agent_id: &str) -> Result<PathBuf> {
        // Agent ids become file names; reject anything that could escape
        // the storage directory.
        if agent_id.is_empty()
            || agent_id.contains('/')
            || agent_id.contains('\\')
            || agent_id.contains("..")
            || agent_id.starts_with('.')
        {
            return Err(StoreError::InvalidAgentId(agent_id.to_string()).into());
        }
        Ok(self.dir.join(format!("{agent_id}.json")))
    }
}

#[async_trait]
impl StateStorage for FileStateStorage {
    async fn load(&self, agent_id: &str) -> Result<Option<SavedState>> {
        let path = self.path_for(agent_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing {}", path.display()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn save(&self, agent_id: &str, state: &SavedState) -> Result<()> {
        let path = self.path_for(agent_id)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        debug!(agent_id, path = %path.display(), "saved agent state");
        Ok(())
    }

    async fn delete(&self, agent_id: &str) -> Result<()> {
        let path = self.path_for(agent_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting {}", path.display())),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("listing {}", self.dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

use crate::agent::task::TaskSnapshot;
use crate::errors::MetaloopError;
use crate::session::store::SnapshotStore;
use crate::utils::{ensure_private_dir, snapshot_file_name, write_atomic};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One pretty-printed JSON file per task, `<task_id>.json`, written atomically.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = ensure_private_dir(dir.into())?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(snapshot_file_name(task_id))
    }
}

/// Read a snapshot from an explicit path.
pub fn read_snapshot(path: &Path) -> Result<TaskSnapshot> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
    let snapshot = serde_json::from_str(&content).map_err(|e| {
        MetaloopError::Persistence(format!("invalid snapshot {}: {}", path.display(), e))
    })?;
    Ok(snapshot)
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &TaskSnapshot) -> Result<()> {
        let path = self.path_for(&snapshot.task_id);
        let content = serde_json::to_string_pretty(snapshot)?;
        tokio::task::spawn_blocking(move || write_atomic(&path, content.as_bytes()))
            .await
            .context("snapshot writer panicked")??;
        debug!("Saved snapshot for task {}", snapshot.task_id);
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Option<TaskSnapshot>> {
        let path = self.path_for(task_id);
        if !path.exists() {
            return Ok(None);
        }
        tokio::task::spawn_blocking(move || read_snapshot(&path))
            .await
            .context("snapshot reader panicked")?
            .map(Some)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list {}", self.dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

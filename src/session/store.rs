use crate::agent::task::TaskSnapshot;
use anyhow::Result;
use async_trait::async_trait;

/// Storage backend for resumable task snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &TaskSnapshot) -> Result<()>;

    /// Load a snapshot by task id, `None` if it was never saved.
    async fn load(&self, task_id: &str) -> Result<Option<TaskSnapshot>>;

    /// Task ids with a saved snapshot, sorted.
    async fn list(&self) -> Result<Vec<String>>;
}

//! Task tracker for background analyses
//!
//! Tracks fire-and-forget work spawned with `tokio::spawn` so shutdown can perform a
//! bounded join over everything still in flight. The map is guarded by a std mutex so
//! spawning works from synchronous call sites (timer callbacks, drop guards); the lock
//! is never held across an await.
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type TaskMap = HashMap<String, JoinHandle<()>>;

pub struct TaskTracker {
    tasks: Arc<Mutex<TaskMap>>,
}

fn lock(tasks: &Mutex<TaskMap>) -> MutexGuard<'_, TaskMap> {
    tasks
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a tracked background task that removes itself on completion
    pub fn spawn_auto_cleanup<F>(&self, name: String, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let tasks = self.tasks.clone();
        let name_clone = name.clone();

        // Hold the lock while spawning and inserting: the spawned task removes itself
        // on completion, so the handle must be present before it can finish.
        let mut guard = lock(&self.tasks);
        let handle = tokio::spawn(async move {
            future.await;
            lock(&tasks).remove(&name_clone);
            debug!("Task '{}' completed and removed from tracker", name_clone);
        });
        if let Some(old) = guard.insert(name.clone(), handle) {
            warn!("Task '{}' was already tracked, detaching previous handle", name);
            drop(old);
        }
    }

    /// Number of tracked tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Wait up to `limit` for every tracked task to finish.
    ///
    /// Returns the number of tasks still running when the limit elapsed. Those tasks
    /// are disowned, not aborted: they keep running but are no longer tracked.
    pub async fn wait_all(&self, limit: Duration) -> usize {
        let tasks: TaskMap = lock(&self.tasks).drain().collect();
        if tasks.is_empty() {
            return 0;
        }
        let total = tasks.len();
        let names: Vec<String> = tasks.keys().cloned().collect();
        let handles: Vec<JoinHandle<()>> = tasks.into_values().collect();

        let abort_handles: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(limit, join_all(handles)).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(e) = result {
                        warn!("Tracked task '{}' ended abnormally: {}", name, e);
                    }
                }
                debug!("All {} tracked tasks drained", total);
                0
            }
            Err(_) => {
                let remaining = abort_handles.iter().filter(|h| !h.is_finished()).count();
                warn!(
                    "Abandoning {} of {} tracked tasks after {:?}",
                    remaining, total, limit
                );
                remaining
            }
        }
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

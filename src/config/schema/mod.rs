use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

mod meta;

pub use meta::*;

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub meta: MetaConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Config {
    pub fn snapshot_path(&self) -> PathBuf {
        crate::utils::resolve_dir(&self.storage.snapshot_dir)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), crate::errors::MetaloopError> {
        self.validate_meta()?;
        self.validate_task()?;
        self.validate_storage()?;
        self.validate_checkpoint()?;
        Ok(())
    }

    fn validate_meta(&self) -> Result<(), crate::errors::MetaloopError> {
        use crate::errors::MetaloopError;
        let m = &self.meta;

        if m.memory_debounce_ms == 0 {
            return Err(MetaloopError::Config(
                "meta.memoryDebounceMs must be > 0".into(),
            ));
        }
        if m.memory_batch_threshold == 0 {
            return Err(MetaloopError::Config(
                "meta.memoryBatchThreshold must be > 0".into(),
            ));
        }
        if m.cognition_debounce_ms == 0 {
            return Err(MetaloopError::Config(
                "meta.cognitionDebounceMs must be > 0".into(),
            ));
        }
        if m.cognition_periodic_secs == 0 {
            return Err(MetaloopError::Config(
                "meta.cognitionPeriodicSecs must be > 0".into(),
            ));
        }
        if m.analysis_timeout_secs == 0 {
            return Err(MetaloopError::Config(
                "meta.analysisTimeoutSecs must be > 0".into(),
            ));
        }
        if m.stuck_threshold_secs == 0 {
            return Err(MetaloopError::Config(
                "meta.stuckThresholdSecs must be > 0".into(),
            ));
        }
        if m.stuck_threshold_secs < m.analysis_timeout_secs {
            warn!(
                "meta.stuckThresholdSecs ({}) is below meta.analysisTimeoutSecs ({}); \
                 slow analyses may be reset before their timeout",
                m.stuck_threshold_secs, m.analysis_timeout_secs
            );
        }
        Ok(())
    }

    fn validate_task(&self) -> Result<(), crate::errors::MetaloopError> {
        use crate::errors::MetaloopError;
        let t = &self.task;

        if t.cognition_frequency == 0 {
            return Err(MetaloopError::Config(
                "task.cognitionFrequency must be > 0".into(),
            ));
        }
        if t.max_requests == 0 {
            return Err(MetaloopError::Config(
                "task.maxRequests must be > 0".into(),
            ));
        }
        if t.event_buffer == 0 {
            return Err(MetaloopError::Config(
                "task.eventBuffer must be > 0".into(),
            ));
        }
        if t.completion_tools.iter().any(|name| name.trim().is_empty()) {
            return Err(MetaloopError::Config(
                "task.completionTools entries must be non-empty".into(),
            ));
        }
        if t.completion_tools.is_empty() && !t.run_indefinitely {
            warn!("task.completionTools is empty; tasks will only end at task.maxRequests");
        }
        Ok(())
    }

    fn validate_storage(&self) -> Result<(), crate::errors::MetaloopError> {
        use crate::errors::MetaloopError;

        if self.storage.snapshot_dir.trim().is_empty() {
            return Err(MetaloopError::Config(
                "storage.snapshotDir must be non-empty".into(),
            ));
        }
        Ok(())
    }

    fn validate_checkpoint(&self) -> Result<(), crate::errors::MetaloopError> {
        use crate::errors::MetaloopError;
        let c = &self.checkpoint;

        if c.gentle_threshold == 0 {
            return Err(MetaloopError::Config(
                "checkpoint.gentleThreshold must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&c.disable_below_score) {
            return Err(MetaloopError::Config(format!(
                "checkpoint.disableBelowScore must be between 0 and 1, got {}",
                c.disable_below_score
            )));
        }
        Ok(())
    }
}

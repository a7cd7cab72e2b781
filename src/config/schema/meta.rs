use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_memory_debounce_ms() -> u64 {
    1000
}

fn default_memory_batch_threshold() -> usize {
    10
}

fn default_cognition_debounce_ms() -> u64 {
    1000
}

fn default_cognition_periodic_secs() -> u64 {
    180
}

fn default_analysis_timeout_secs() -> u64 {
    180
}

fn default_stuck_threshold_secs() -> u64 {
    120
}

fn default_shutdown_wait_secs() -> u64 {
    5
}

/// Timing and volume knobs for the background memory and cognition analyses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Quiet period after the last message before memory analysis launches.
    #[serde(default = "default_memory_debounce_ms", rename = "memoryDebounceMs")]
    pub memory_debounce_ms: u64,
    /// Unprocessed message count that launches memory analysis without waiting.
    #[serde(
        default = "default_memory_batch_threshold",
        rename = "memoryBatchThreshold"
    )]
    pub memory_batch_threshold: usize,
    #[serde(
        default = "default_cognition_debounce_ms",
        rename = "cognitionDebounceMs"
    )]
    pub cognition_debounce_ms: u64,
    /// Recurring cognition attempt, independent of message volume.
    #[serde(
        default = "default_cognition_periodic_secs",
        rename = "cognitionPeriodicSecs"
    )]
    pub cognition_periodic_secs: u64,
    /// Hard limit raced against every analysis call.
    #[serde(
        default = "default_analysis_timeout_secs",
        rename = "analysisTimeoutSecs"
    )]
    pub analysis_timeout_secs: u64,
    /// Age after which a still-set processing flag is force-cleared.
    #[serde(
        default = "default_stuck_threshold_secs",
        rename = "stuckThresholdSecs"
    )]
    pub stuck_threshold_secs: u64,
    /// Bounded wait for in-flight analyses when a task shuts down.
    #[serde(default = "default_shutdown_wait_secs", rename = "shutdownWaitSecs")]
    pub shutdown_wait_secs: u64,
}

impl MetaConfig {
    pub fn memory_debounce(&self) -> Duration {
        Duration::from_millis(self.memory_debounce_ms)
    }

    pub fn cognition_debounce(&self) -> Duration {
        Duration::from_millis(self.cognition_debounce_ms)
    }

    pub fn cognition_periodic(&self) -> Duration {
        Duration::from_secs(self.cognition_periodic_secs)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_threshold_secs as i64)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait_secs)
    }
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            memory_debounce_ms: default_memory_debounce_ms(),
            memory_batch_threshold: default_memory_batch_threshold(),
            cognition_debounce_ms: default_cognition_debounce_ms(),
            cognition_periodic_secs: default_cognition_periodic_secs(),
            analysis_timeout_secs: default_analysis_timeout_secs(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            shutdown_wait_secs: default_shutdown_wait_secs(),
        }
    }
}

fn default_cognition_frequency() -> u32 {
    5
}

fn default_max_requests() -> u32 {
    50
}

fn default_completion_tools() -> Vec<String> {
    vec!["task_complete".to_string()]
}

fn default_event_buffer() -> usize {
    256
}

/// Per-task defaults applied when a task is started fresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "super::default_true", rename = "cognitionEnabled")]
    pub cognition_enabled: bool,
    /// Messages per cognition trigger.
    #[serde(
        default = "default_cognition_frequency",
        rename = "cognitionFrequency"
    )]
    pub cognition_frequency: u32,
    #[serde(default = "super::default_true", rename = "memoryEnabled")]
    pub memory_enabled: bool,
    /// Ignore completion tools and keep requesting until aborted or `maxRequests`.
    #[serde(default, rename = "runIndefinitely")]
    pub run_indefinitely: bool,
    #[serde(default = "default_max_requests", rename = "maxRequests")]
    pub max_requests: u32,
    /// Pause between model requests.
    #[serde(default, rename = "thoughtDelayMs")]
    pub thought_delay_ms: u64,
    /// Tool names whose results end the task.
    #[serde(default = "default_completion_tools", rename = "completionTools")]
    pub completion_tools: Vec<String>,
    /// Capacity of the channel carrying task events to the caller.
    #[serde(default = "default_event_buffer", rename = "eventBuffer")]
    pub event_buffer: usize,
}

impl TaskConfig {
    pub fn thought_delay(&self) -> Duration {
        Duration::from_millis(self.thought_delay_ms)
    }

    pub fn is_completion_tool(&self, name: &str) -> bool {
        self.completion_tools.iter().any(|t| t == name)
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            cognition_enabled: true,
            cognition_frequency: default_cognition_frequency(),
            memory_enabled: true,
            run_indefinitely: false,
            max_requests: default_max_requests(),
            thought_delay_ms: 0,
            completion_tools: default_completion_tools(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_snapshot_dir() -> String {
    "~/.metaloop/snapshots".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding resumable task snapshots.
    #[serde(default = "default_snapshot_dir", rename = "snapshotDir")]
    pub snapshot_dir: String,
    /// Persist a snapshot whenever a task ends.
    #[serde(default = "super::default_true", rename = "saveOnExit")]
    pub save_on_exit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: default_snapshot_dir(),
            save_on_exit: true,
        }
    }
}

fn default_gentle_threshold() -> u32 {
    12
}
fn default_firm_threshold() -> u32 {
    20
}
fn default_urgent_threshold() -> u32 {
    30
}
fn default_recent_tools_window() -> usize {
    10
}
fn default_min_scored_results() -> usize {
    4
}
fn default_disable_below_score() -> f64 {
    0.5
}

/// Tuning for the bundled checkpoint analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_gentle_threshold", rename = "gentleThreshold")]
    pub gentle_threshold: u32,
    #[serde(default = "default_firm_threshold", rename = "firmThreshold")]
    pub firm_threshold: u32,
    #[serde(default = "default_urgent_threshold", rename = "urgentThreshold")]
    pub urgent_threshold: u32,
    #[serde(default = "default_recent_tools_window", rename = "recentToolsWindow")]
    pub recent_tools_window: usize,
    /// Tool results needed in one batch before the active model is scored.
    #[serde(default = "default_min_scored_results", rename = "minScoredResults")]
    pub min_scored_results: usize,
    /// Success ratio under which the active model is disabled.
    #[serde(default = "default_disable_below_score", rename = "disableBelowScore")]
    pub disable_below_score: f64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            gentle_threshold: default_gentle_threshold(),
            firm_threshold: default_firm_threshold(),
            urgent_threshold: default_urgent_threshold(),
            recent_tools_window: default_recent_tools_window(),
            min_scored_results: default_min_scored_results(),
            disable_below_score: default_disable_below_score(),
        }
    }
}

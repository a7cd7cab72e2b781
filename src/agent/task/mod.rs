use crate::agent::meta::events::AnalysisKind;
use crate::config::TaskConfig;
use crate::providers::base::{AgentProfile, Message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// In-flight marker for one analysis kind.
///
/// `processing`, `started_at` and `run_id` are only ever set by [`begin`](Self::begin)
/// and cleared by [`clear`](Self::clear), so `processing` implies `started_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    #[serde(default)]
    processing: bool,
    #[serde(default, rename = "processingStartedAt")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "runId")]
    run_id: Option<Uuid>,
}

impl ProcessingStatus {
    /// Mark a new run as in flight and return its id.
    pub fn begin(&mut self, now: DateTime<Utc>) -> Uuid {
        let run_id = Uuid::new_v4();
        self.processing = true;
        self.started_at = Some(now);
        self.run_id = Some(run_id);
        run_id
    }

    pub fn clear(&mut self) {
        self.processing = false;
        self.started_at = None;
        self.run_id = None;
    }

    /// Clear the flag on behalf of a finished run.
    ///
    /// Returns false, leaving the status untouched, when `run_id` no longer owns
    /// the flag (it was force-reset and a newer run has started since).
    pub fn finish(&mut self, run_id: Uuid) -> bool {
        if self.run_id == Some(run_id) {
            self.clear();
            true
        } else {
            false
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn run_id(&self) -> Option<Uuid> {
        self.run_id
    }

    /// Time spent processing so far, if in flight.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        if !self.processing {
            return None;
        }
        self.started_at.map(|started| now - started)
    }

    /// Repair a status deserialized from an older or hand-edited snapshot.
    fn normalize(mut self) -> Self {
        if self.processing != self.started_at.is_some() {
            self.clear();
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CognitionState {
    pub enabled: bool,
    /// Messages per cognition trigger.
    pub frequency: u32,
    pub status: ProcessingStatus,
    pub disabled_models: HashSet<String>,
    pub model_scores: HashMap<String, f64>,
}

impl CognitionState {
    /// Model to request with: the agent's default unless cognition disabled it,
    /// then the best-scored enabled alternative (unscored count as 0.5, ties
    /// keep declaration order). Falls back to the default when everything is
    /// disabled.
    pub fn select_model<'a>(&self, agent: &'a AgentProfile) -> &'a str {
        if !self.disabled_models.contains(&agent.model) {
            return &agent.model;
        }
        let mut best: Option<(&'a str, f64)> = None;
        for candidate in agent
            .models
            .iter()
            .filter(|m| !self.disabled_models.contains(*m))
        {
            let score = self.model_scores.get(candidate).copied().unwrap_or(0.5);
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((candidate.as_str(), score));
            }
        }
        best.map_or(agent.model.as_str(), |(model, _)| model)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryState {
    pub enabled: bool,
    pub status: ProcessingStatus,
    /// Opaque tagger state, restored into the tagger on resume.
    pub topic_state: Value,
}

/// Mutable record of one task invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub task_id: String,
    pub messages: Vec<Message>,
    pub request_count: u32,
    pub started_at: DateTime<Utc>,
    pub run_indefinitely: bool,
    pub cognition: CognitionState,
    pub memory: MemoryState,
}

impl TaskState {
    pub fn new(task_id: impl Into<String>, config: &TaskConfig, messages: Vec<Message>) -> Self {
        Self {
            task_id: task_id.into(),
            messages,
            request_count: 0,
            started_at: Utc::now(),
            run_indefinitely: config.run_indefinitely,
            cognition: CognitionState {
                enabled: config.cognition_enabled,
                frequency: config.cognition_frequency,
                status: ProcessingStatus::default(),
                disabled_models: HashSet::new(),
                model_scores: HashMap::new(),
            },
            memory: MemoryState {
                enabled: config.memory_enabled,
                status: ProcessingStatus::default(),
                topic_state: Value::Null,
            },
        }
    }

    pub fn is_enabled(&self, kind: AnalysisKind) -> bool {
        match kind {
            AnalysisKind::Memory => self.memory.enabled,
            AnalysisKind::Cognition => self.cognition.enabled,
        }
    }

    pub fn status(&self, kind: AnalysisKind) -> &ProcessingStatus {
        match kind {
            AnalysisKind::Memory => &self.memory.status,
            AnalysisKind::Cognition => &self.cognition.status,
        }
    }

    pub fn status_mut(&mut self, kind: AnalysisKind) -> &mut ProcessingStatus {
        match kind {
            AnalysisKind::Memory => &mut self.memory.status,
            AnalysisKind::Cognition => &mut self.cognition.status,
        }
    }

    pub fn to_snapshot(&self) -> TaskSnapshot {
        let mut disabled_models: Vec<String> =
            self.cognition.disabled_models.iter().cloned().collect();
        disabled_models.sort();
        TaskSnapshot {
            task_id: self.task_id.clone(),
            messages: self.messages.clone(),
            request_count: self.request_count,
            started_at: self.started_at,
            run_indefinitely: self.run_indefinitely,
            cognition: CognitionSnapshot {
                enabled: self.cognition.enabled,
                frequency: self.cognition.frequency,
                status: self.cognition.status.clone(),
                disabled_models,
                model_scores: self
                    .cognition
                    .model_scores
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect(),
            },
            memory: MemorySnapshot {
                enabled: self.memory.enabled,
                status: self.memory.status.clone(),
                topic_state: self.memory.topic_state.clone(),
            },
        }
    }

    pub fn from_snapshot(snapshot: TaskSnapshot) -> Self {
        Self {
            task_id: snapshot.task_id,
            messages: snapshot.messages,
            request_count: snapshot.request_count,
            started_at: snapshot.started_at,
            run_indefinitely: snapshot.run_indefinitely,
            cognition: CognitionState {
                enabled: snapshot.cognition.enabled,
                frequency: snapshot.cognition.frequency.max(1),
                status: snapshot.cognition.status.normalize(),
                disabled_models: snapshot.cognition.disabled_models.into_iter().collect(),
                model_scores: snapshot.cognition.model_scores.into_iter().collect(),
            },
            memory: MemoryState {
                enabled: snapshot.memory.enabled,
                status: snapshot.memory.status.normalize(),
                topic_state: snapshot.memory.topic_state,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CognitionSnapshot {
    pub enabled: bool,
    pub frequency: u32,
    #[serde(flatten)]
    pub status: ProcessingStatus,
    #[serde(default, rename = "disabledModels")]
    pub disabled_models: Vec<String>,
    #[serde(default, rename = "modelScores")]
    pub model_scores: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub enabled: bool,
    #[serde(flatten)]
    pub status: ProcessingStatus,
    #[serde(default, rename = "topicState")]
    pub topic_state: Value,
}

/// Serializable form of [`TaskState`], returned when a task ends and accepted by resume.
///
/// Sets and maps are stored as a sorted list and an ordered map. The task's
/// cancellation token is never part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub messages: Vec<Message>,
    #[serde(default, rename = "requestCount")]
    pub request_count: u32,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(default, rename = "runIndefinitely")]
    pub run_indefinitely: bool,
    pub cognition: CognitionSnapshot,
    pub memory: MemorySnapshot,
}

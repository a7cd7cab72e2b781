use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// The two background analyses run alongside a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    Memory,
    Cognition,
}

impl AnalysisKind {
    pub const ALL: [Self; 2] = [Self::Memory, Self::Cognition];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cognition => "cognition",
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisPhase {
    Start,
    Complete,
}

/// Lifecycle event of one analysis run.
///
/// A start and its matching complete share `id`. Timestamps are assigned by
/// [`EventQueue::push`](super::queue::EventQueue::push).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEvent {
    pub id: Uuid,
    pub kind: AnalysisKind,
    pub phase: AnalysisPhase,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl MetaEvent {
    pub fn start(id: Uuid, kind: AnalysisKind, payload: Value) -> Self {
        Self {
            id,
            kind,
            phase: AnalysisPhase::Start,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn complete(id: Uuid, kind: AnalysisKind, payload: Value) -> Self {
        Self {
            id,
            kind,
            phase: AnalysisPhase::Complete,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn is_start_of(&self, kind: AnalysisKind) -> bool {
        self.kind == kind && self.phase == AnalysisPhase::Start
    }
}

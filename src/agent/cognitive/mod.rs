//! Cognitive self-analysis boundary.
//!
//! An analyzer looks at the conversation so far and may inject guidance
//! messages, change how often it runs, or steer model selection. It runs as a
//! background analysis, so it never touches the live task state: everything it
//! wants changed comes back as a [`CognitionOutcome`] that the task loop applies
//! at its next flush point.

use crate::agent::task::CognitionState;
use crate::config::CheckpointConfig;
use crate::providers::base::{AgentProfile, Message};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Input to one analysis run. Everything is a snapshot taken at launch.
#[derive(Debug, Clone)]
pub struct CognitionContext {
    pub agent: AgentProfile,
    /// Model the task is currently requesting with.
    pub active_model: String,
    pub history: Vec<Message>,
    /// Messages produced since the previous cognition launch.
    pub new_messages: Vec<Message>,
    pub task_started_at: DateTime<Utc>,
    pub request_count: u32,
    pub state: CognitionState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CognitionOutcome {
    /// Appended to history by the task loop; must be `system` or `user` entries.
    #[serde(default, rename = "injectedMessages")]
    pub injected_messages: Vec<Message>,
    /// New messages-per-trigger value.
    #[serde(default)]
    pub frequency: Option<u32>,
    #[serde(default, rename = "disabledModels")]
    pub disabled_models: Vec<String>,
    #[serde(default, rename = "modelScores")]
    pub model_scores: HashMap<String, f64>,
    #[serde(default)]
    pub result: Value,
}

#[async_trait]
pub trait CognitiveAnalyzer: Send + Sync {
    async fn analyze(&self, ctx: CognitionContext) -> Result<CognitionOutcome>;
}

#[async_trait]
impl<T: CognitiveAnalyzer + ?Sized> CognitiveAnalyzer for Arc<T> {
    async fn analyze(&self, ctx: CognitionContext) -> Result<CognitionOutcome> {
        (**self).analyze(ctx).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Pressure {
    None,
    Gentle,
    Firm,
    Urgent,
}

impl Pressure {
    fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gentle => "gentle",
            Self::Firm => "firm",
            Self::Urgent => "urgent",
        }
    }
}

/// Tracks tool call volume across analyses and emits escalating pressure
/// messages that nudge the model to checkpoint its progress.
struct CheckpointTracker {
    config: CheckpointConfig,
    total_tool_calls: u32,
    recent_tools: VecDeque<String>,
    /// Highest level already emitted; each level fires once until reset.
    emitted: Pressure,
}

impl CheckpointTracker {
    fn new(mut config: CheckpointConfig) -> Self {
        // Ensure thresholds are properly ordered: gentle <= firm <= urgent
        let mut sorted = [
            config.gentle_threshold,
            config.firm_threshold,
            config.urgent_threshold,
        ];
        sorted.sort_unstable();
        if sorted
            != [
                config.gentle_threshold,
                config.firm_threshold,
                config.urgent_threshold,
            ]
        {
            tracing::warn!(
                "checkpoint thresholds reordered: gentle={}, firm={}, urgent={}",
                sorted[0],
                sorted[1],
                sorted[2]
            );
            config.gentle_threshold = sorted[0];
            config.firm_threshold = sorted[1];
            config.urgent_threshold = sorted[2];
        }

        Self {
            config,
            total_tool_calls: 0,
            recent_tools: VecDeque::new(),
            emitted: Pressure::None,
        }
    }

    fn record_tool_calls<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        for name in names {
            self.total_tool_calls = self.total_tool_calls.saturating_add(1);
            self.recent_tools.push_back(name.to_string());
        }
        while self.recent_tools.len() > self.config.recent_tools_window {
            self.recent_tools.pop_front();
        }
    }

    fn reset(&mut self) {
        self.total_tool_calls = 0;
        self.recent_tools.clear();
        self.emitted = Pressure::None;
    }

    /// Next pressure level to emit, checked from lowest to highest so levels
    /// escalate one step per analysis even when several thresholds are crossed.
    fn next_pressure(&mut self) -> Option<(Pressure, &'static str)> {
        let next = match self.emitted {
            Pressure::None if self.total_tool_calls >= self.config.gentle_threshold => {
                Pressure::Gentle
            }
            Pressure::Gentle if self.total_tool_calls >= self.config.firm_threshold => {
                Pressure::Firm
            }
            Pressure::Firm if self.total_tool_calls >= self.config.urgent_threshold => {
                Pressure::Urgent
            }
            _ => return None,
        };
        self.emitted = next;
        let text = match next {
            Pressure::Gentle => {
                "[Cognitive checkpoint hint] You have been working for a while. Consider briefly \
                 noting what you've accomplished and what remains."
            }
            Pressure::Firm => {
                "[Cognitive checkpoint warning] You have made many tool calls since your last \
                 checkpoint. Please pause and write a brief checkpoint: what you've accomplished \
                 so far and what's next."
            }
            Pressure::Urgent | Pressure::None => {
                "[Cognitive checkpoint URGENT] You have made a large number of tool calls \
                 without summarizing progress. STOP and write a detailed progress summary NOW: \
                 what is done, what failed, what remains."
            }
        };
        Some((next, text))
    }

    fn breadcrumb(&self) -> String {
        let recent: Vec<&str> = self.recent_tools.iter().map(String::as_str).collect();
        format!(
            "[Cognitive state] {} tool calls, pressure: {}. Recent tools: [{}]",
            self.total_tool_calls,
            self.emitted.as_str(),
            recent.join(", ")
        )
    }
}

/// Bundled analyzer: checkpoint pressure from tool-call volume, plus scoring of
/// the active model by the success ratio of its tool results.
///
/// A plain assistant reply that mentions "checkpoint" or "progress" counts as
/// the model checkpointing and resets the pressure.
pub struct CheckpointAnalyzer {
    config: CheckpointConfig,
    tracker: Mutex<CheckpointTracker>,
}

impl CheckpointAnalyzer {
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            tracker: Mutex::new(CheckpointTracker::new(config.clone())),
            config,
        }
    }

    fn tracker(&self) -> MutexGuard<'_, CheckpointTracker> {
        self.tracker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn score_model(&self, ctx: &CognitionContext, outcome: &mut CognitionOutcome) {
        let results: Vec<&Message> = ctx.new_messages.iter().filter(|m| m.role == "tool").collect();
        if results.len() < self.config.min_scored_results {
            return;
        }
        let ok = results.iter().filter(|m| !m.is_error).count();
        let score = ok as f64 / results.len() as f64;
        outcome.model_scores.insert(ctx.active_model.clone(), score);

        let has_alternative = std::iter::once(&ctx.agent.model)
            .chain(&ctx.agent.models)
            .any(|m| *m != ctx.active_model && !ctx.state.disabled_models.contains(m));
        if score < self.config.disable_below_score && has_alternative {
            tracing::info!(
                "disabling model {} after tool success ratio {:.2}",
                ctx.active_model,
                score
            );
            outcome.disabled_models.push(ctx.active_model.clone());
        }
    }
}

impl Default for CheckpointAnalyzer {
    fn default() -> Self {
        Self::new(CheckpointConfig::default())
    }
}

fn is_checkpoint_reply(message: &Message) -> bool {
    if message.role != "assistant" || message.tool_call_count() > 0 {
        return false;
    }
    let text = message.content.to_lowercase();
    text.contains("checkpoint") || text.contains("progress")
}

#[async_trait]
impl CognitiveAnalyzer for CheckpointAnalyzer {
    async fn analyze(&self, ctx: CognitionContext) -> Result<CognitionOutcome> {
        let mut outcome = CognitionOutcome::default();

        let (pressure, breadcrumb) = {
            let mut tracker = self.tracker();
            if ctx.new_messages.iter().any(is_checkpoint_reply) {
                tracker.reset();
            }
            let announced: Vec<&str> = ctx
                .new_messages
                .iter()
                .flat_map(|m| m.tool_calls.iter().flatten())
                .map(|tc| tc.name.as_str())
                .collect();
            if announced.is_empty() {
                tracker.record_tool_calls(
                    ctx.new_messages
                        .iter()
                        .filter(|m| m.role == "tool")
                        .filter_map(|m| m.tool_name.as_deref()),
                );
            } else {
                tracker.record_tool_calls(announced);
            }
            let pressure = tracker.next_pressure();
            (pressure, tracker.breadcrumb())
        };

        if let Some((level, text)) = pressure {
            outcome.injected_messages.push(Message::system(text));
            if level == Pressure::Urgent {
                outcome.frequency = Some((ctx.state.frequency / 2).max(1));
            }
        }
        self.score_model(&ctx, &mut outcome);

        let elapsed = Utc::now() - ctx.task_started_at;
        outcome.result = serde_json::json!({
            "breadcrumb": breadcrumb,
            "pressure": pressure.map_or("none", |(level, _)| level.as_str()),
            "requestCount": ctx.request_count,
            "elapsedSecs": elapsed.num_seconds(),
        });
        Ok(outcome)
    }
}

// Shared test helpers; not every test binary uses every item.
#![allow(unused)]

use async_trait::async_trait;
use futures_util::StreamExt;
use metaloop::agent::meta::events::{AnalysisKind, AnalysisPhase, MetaEvent};
use metaloop::agent::{
    CognitionContext, CognitionOutcome, CognitiveAnalyzer, MemoryTagger, TaggingResult,
    TaskEvent, TaskRunner,
};
use metaloop::config::Config;
use metaloop::errors::MetaloopError;
use metaloop::providers::base::{
    AgentProfile, Message, ModelEvent, ModelEventStream, ModelRequest, ModelRequestService,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted reply from [`MockModelService`].
#[derive(Debug, Clone)]
pub enum Turn {
    /// Stream these events, followed by `Completed` if missing.
    Events(Vec<ModelEvent>),
    /// Stream these events, then fail mid-stream.
    StreamError(Vec<ModelEvent>, String),
    /// Fail to open the stream.
    OpenError { message: String, retryable: bool },
}

pub struct MockModelService {
    turns: Mutex<VecDeque<Turn>>,
    pub requests: Arc<Mutex<Vec<ModelRequest>>>,
    pub event_delay: Duration,
    pub default_response: String,
}

impl MockModelService {
    pub fn with_turns(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(VecDeque::from(turns)),
            requests: Arc::new(Mutex::new(Vec::new())),
            event_delay: Duration::ZERO,
            default_response: "Mock response".to_string(),
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockModelService {
    fn default() -> Self {
        Self::with_turns(Vec::new())
    }
}

#[async_trait]
impl ModelRequestService for MockModelService {
    async fn request(&self, req: ModelRequest) -> anyhow::Result<ModelEventStream> {
        self.requests.lock().unwrap().push(req);

        let turn = self.turns.lock().unwrap().pop_front();
        let mut items: Vec<anyhow::Result<ModelEvent>> = match turn {
            None => vec![Ok(assistant_event(&self.default_response))],
            Some(Turn::Events(events)) => events.into_iter().map(Ok).collect(),
            Some(Turn::StreamError(events, error)) => {
                let mut items: Vec<_> = events.into_iter().map(Ok).collect();
                items.push(Err(anyhow::anyhow!("{}", error)));
                items
            }
            Some(Turn::OpenError { message, retryable }) => {
                return Err(MetaloopError::Provider { message, retryable }.into());
            }
        };
        let ends_cleanly = items.last().is_none_or(Result::is_ok);
        if ends_cleanly && !matches!(items.last(), Some(Ok(ModelEvent::Completed))) {
            items.push(Ok(ModelEvent::Completed));
        }

        let delay = self.event_delay;
        Ok(futures_util::stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed())
    }
}

// --- Event builders ---

pub fn assistant_event(content: &str) -> ModelEvent {
    ModelEvent::Message {
        message: Message::assistant(content, None),
    }
}

pub fn tool_result_event(tool_name: &str, content: &str) -> ModelEvent {
    ModelEvent::ToolResult {
        tool_call_id: format!("call_{tool_name}"),
        tool_name: tool_name.to_string(),
        content: content.to_string(),
        is_error: false,
    }
}

pub fn reply(content: &str) -> Turn {
    Turn::Events(vec![assistant_event(content)])
}

// --- Recording collaborators ---

#[derive(Default)]
pub struct RecordingTagger {
    /// Message contents of every batch, in call order.
    pub batches: Mutex<Vec<Vec<String>>>,
    /// History length seen by every call.
    pub histories: Mutex<Vec<usize>>,
    pub restored: Mutex<Vec<Value>>,
    pub delay: Duration,
}

impl RecordingTagger {
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn history_lens(&self) -> Vec<usize> {
        self.histories.lock().unwrap().clone()
    }
}

#[async_trait]
impl MemoryTagger for RecordingTagger {
    async fn process_messages(
        &self,
        history: &[Message],
        messages: &[Message],
    ) -> anyhow::Result<TaggingResult> {
        self.histories.lock().unwrap().push(history.len());
        self.batches
            .lock()
            .unwrap()
            .push(messages.iter().map(|m| m.content.clone()).collect());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(TaggingResult {
            messages_processed: messages.len(),
            tags: vec!["recorded".into()],
        })
    }

    fn state(&self) -> Value {
        serde_json::json!({ "batches": self.batches.lock().unwrap().len() })
    }

    fn restore_state(&self, state: Value) -> anyhow::Result<()> {
        self.restored.lock().unwrap().push(state);
        Ok(())
    }

    async fn compact(&self, messages: &[Message]) -> anyhow::Result<Vec<Message>> {
        Ok(messages.to_vec())
    }

    fn check_compact(&self, _messages: &[Message]) -> bool {
        false
    }
}

#[derive(Default)]
pub struct RecordingAnalyzer {
    /// Size of `new_messages` for every call.
    pub batches: Mutex<Vec<usize>>,
    /// Returned by every call.
    pub outcome: Mutex<CognitionOutcome>,
    pub delay: Duration,
}

impl RecordingAnalyzer {
    pub fn returning(outcome: CognitionOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            ..Self::default()
        }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl CognitiveAnalyzer for RecordingAnalyzer {
    async fn analyze(&self, ctx: CognitionContext) -> anyhow::Result<CognitionOutcome> {
        self.batches.lock().unwrap().push(ctx.new_messages.len());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.outcome.lock().unwrap().clone())
    }
}

// --- Setup ---

pub fn agent() -> AgentProfile {
    let mut agent = AgentProfile::new("tester", "primary");
    agent.models = vec!["backup".into()];
    agent
}

/// Config with long timers so only the triggers a test sets up can fire.
pub fn quiet_config() -> Config {
    let mut config = Config::default();
    config.meta.memory_debounce_ms = 600_000;
    config.meta.cognition_debounce_ms = 1000;
    config.meta.cognition_periodic_secs = 3600;
    config.task.max_requests = 10;
    config
}

pub struct Harness {
    pub runner: TaskRunner,
    pub service: Arc<MockModelService>,
    pub tagger: Arc<RecordingTagger>,
    pub analyzer: Arc<RecordingAnalyzer>,
}

pub fn harness(config: &Config, service: MockModelService) -> Harness {
    harness_with(config, service, RecordingTagger::default(), RecordingAnalyzer::default())
}

pub fn harness_with(
    config: &Config,
    service: MockModelService,
    tagger: RecordingTagger,
    analyzer: RecordingAnalyzer,
) -> Harness {
    let service = Arc::new(service);
    let tagger = Arc::new(tagger);
    let analyzer = Arc::new(analyzer);
    let runner = TaskRunner::new(
        config,
        service.clone(),
        {
            let tagger = tagger.clone();
            move || tagger.clone()
        },
        {
            let analyzer = analyzer.clone();
            move || analyzer.clone()
        },
    );
    Harness {
        runner,
        service,
        tagger,
        analyzer,
    }
}

// --- Event inspection ---

pub fn terminal(events: &[TaskEvent]) -> &TaskEvent {
    let last = events.last().expect("no events");
    assert!(last.is_terminal(), "last event not terminal: {last:?}");
    last
}

pub fn meta_events(events: &[TaskEvent]) -> Vec<&MetaEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::Meta(m) => Some(m),
            _ => None,
        })
        .collect()
}

pub fn starts_of(events: &[TaskEvent], kind: AnalysisKind) -> usize {
    meta_events(events)
        .iter()
        .filter(|m| m.kind == kind && m.phase == AnalysisPhase::Start)
        .count()
}

/// Number of history messages the model produced before each event index.
pub fn model_messages_before(events: &[TaskEvent], index: usize) -> usize {
    events[..index]
        .iter()
        .filter(|e| matches!(e, TaskEvent::Model(ModelEvent::Message { .. })))
        .count()
}

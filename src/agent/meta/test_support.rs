use super::MetaProcessor;
use crate::agent::cognitive::{CognitionContext, CognitionOutcome, CognitiveAnalyzer};
use crate::agent::memory::{MemoryTagger, TaggingResult};
use crate::agent::task::TaskState;
use crate::config::{MetaConfig, TaskConfig};
use crate::providers::base::{AgentProfile, Message};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tracks how many calls are running at once.
#[derive(Default)]
pub(crate) struct Concurrency {
    active: AtomicUsize,
    max_active: AtomicUsize,
}

pub(crate) struct Active<'a>(&'a Concurrency);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Concurrency {
    fn enter(&self) -> Active<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        Active(self)
    }

    pub(crate) fn max(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct RecordingTagger {
    pub(crate) batches: Mutex<Vec<usize>>,
    pub(crate) histories: Mutex<Vec<usize>>,
    pub(crate) delays: Mutex<VecDeque<Duration>>,
    pub(crate) fail: AtomicBool,
    pub(crate) concurrency: Concurrency,
}

impl RecordingTagger {
    pub(crate) fn with_delays(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            delays: Mutex::new(delays.into_iter().collect()),
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }

    pub(crate) fn history_lens(&self) -> Vec<usize> {
        self.histories.lock().unwrap().clone()
    }
}

#[async_trait]
impl MemoryTagger for RecordingTagger {
    async fn process_messages(
        &self,
        history: &[Message],
        messages: &[Message],
    ) -> Result<TaggingResult> {
        self.batches.lock().unwrap().push(messages.len());
        self.histories.lock().unwrap().push(history.len());
        let delay = self.delays.lock().unwrap().pop_front();
        let active = self.concurrency.enter();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        drop(active);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("tagger offline");
        }
        Ok(TaggingResult {
            messages_processed: messages.len(),
            tags: vec!["fake".into()],
        })
    }

    fn state(&self) -> Value {
        serde_json::json!({ "calls": self.batches.lock().unwrap().len() })
    }

    fn restore_state(&self, _state: Value) -> Result<()> {
        Ok(())
    }

    async fn compact(&self, messages: &[Message]) -> Result<Vec<Message>> {
        Ok(messages.to_vec())
    }

    fn check_compact(&self, _messages: &[Message]) -> bool {
        false
    }
}

#[derive(Default)]
pub(crate) struct RecordingAnalyzer {
    pub(crate) batches: Mutex<Vec<usize>>,
    pub(crate) delays: Mutex<VecDeque<Duration>>,
    pub(crate) outcome: Mutex<CognitionOutcome>,
    pub(crate) concurrency: Concurrency,
}

impl RecordingAnalyzer {
    pub(crate) fn with_delays(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            delays: Mutex::new(delays.into_iter().collect()),
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl CognitiveAnalyzer for RecordingAnalyzer {
    async fn analyze(&self, ctx: CognitionContext) -> Result<CognitionOutcome> {
        self.batches.lock().unwrap().push(ctx.new_messages.len());
        let delay = self.delays.lock().unwrap().pop_front();
        let active = self.concurrency.enter();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        drop(active);
        Ok(self.outcome.lock().unwrap().clone())
    }
}

pub(crate) struct Fixture {
    pub(crate) meta: MetaProcessor,
    pub(crate) tagger: Arc<RecordingTagger>,
    pub(crate) analyzer: Arc<RecordingAnalyzer>,
    pub(crate) cancel: CancellationToken,
}

pub(crate) fn fixture_with(
    config: &MetaConfig,
    task: &TaskConfig,
    tagger: RecordingTagger,
    analyzer: RecordingAnalyzer,
) -> Fixture {
    let tagger = Arc::new(tagger);
    let analyzer = Arc::new(analyzer);
    let cancel = CancellationToken::new();
    let mut agent = AgentProfile::new("worker", "primary");
    agent.models = vec!["backup".into()];
    let meta = MetaProcessor::new(
        config,
        TaskState::new("task-test", task, vec![Message::user("begin")]),
        agent,
        tagger.clone(),
        analyzer.clone(),
        cancel.clone(),
    );
    Fixture {
        meta,
        tagger,
        analyzer,
        cancel,
    }
}

pub(crate) fn fixture() -> Fixture {
    fixture_with(
        &MetaConfig::default(),
        &TaskConfig::default(),
        RecordingTagger::default(),
        RecordingAnalyzer::default(),
    )
}

pub(crate) fn msg(n: usize) -> Message {
    Message::assistant(format!("response {n}"), None)
}

/// Let spawned tasks run without advancing the clock past pending timers.
pub(crate) async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

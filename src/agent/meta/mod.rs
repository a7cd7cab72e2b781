//! Background meta-processing for a running task.
//!
//! The driver reports every new conversation message to the [`scheduler`],
//! which decides when memory and cognition analyses should run. The
//! [`supervisor`] launches them, at most one per kind, and pushes lifecycle
//! events into the [`queue`] that the driver drains at its flush points.
//! [`recovery`] clears processing flags that outlived their run.

pub mod events;
pub mod queue;
pub mod recovery;
pub mod scheduler;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_support;

use crate::agent::cognitive::{CognitionOutcome, CognitiveAnalyzer};
use crate::agent::memory::MemoryTagger;
use crate::agent::task::{TaskSnapshot, TaskState};
use crate::config::MetaConfig;
use crate::providers::base::{AgentProfile, Message};
use chrono::Utc;
use events::{AnalysisKind, MetaEvent};
use queue::EventQueue;
use scheduler::TriggerScheduler;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use supervisor::Supervisor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Messages waiting for the next launch of each analysis.
#[derive(Debug, Default)]
pub struct MetaProcessingState {
    pub unprocessed_memory: Vec<Message>,
    pub unprocessed_cognition: Vec<Message>,
    /// Reset when a cognition trigger fires, not when the analysis completes.
    pub messages_since_last_cognition: u32,
}

impl MetaProcessingState {
    pub fn unprocessed(&self, kind: AnalysisKind) -> &Vec<Message> {
        match kind {
            AnalysisKind::Memory => &self.unprocessed_memory,
            AnalysisKind::Cognition => &self.unprocessed_cognition,
        }
    }

    pub fn unprocessed_mut(&mut self, kind: AnalysisKind) -> &mut Vec<Message> {
        match kind {
            AnalysisKind::Memory => &mut self.unprocessed_memory,
            AnalysisKind::Cognition => &mut self.unprocessed_cognition,
        }
    }
}

/// Everything the driver, timers and analysis continuations share.
pub struct MetaCore {
    pub task: TaskState,
    pub pending: MetaProcessingState,
    /// Cognition results waiting for the driver to apply them.
    pub outcomes: Vec<CognitionOutcome>,
    pub active_model: String,
    /// Set once the task shuts down; no launch or timer is accepted after.
    pub stopped: bool,
}

/// Lock around [`MetaCore`]. Never held across an await.
pub struct SharedState {
    inner: Mutex<MetaCore>,
}

impl SharedState {
    pub fn new(task: TaskState, active_model: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(MetaCore {
                task,
                pending: MetaProcessingState::default(),
                outcomes: Vec::new(),
                active_model: active_model.into(),
                stopped: false,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, MetaCore> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Meta-processing for one task invocation: shared state, trigger timers,
/// supervised launches and the event queue.
#[derive(Clone)]
pub struct MetaProcessor {
    shared: Arc<SharedState>,
    queue: Arc<EventQueue>,
    supervisor: Supervisor,
    scheduler: Arc<TriggerScheduler>,
    stuck_threshold: chrono::Duration,
    shutdown_wait: Duration,
}

impl MetaProcessor {
    pub fn new(
        config: &MetaConfig,
        state: TaskState,
        agent: AgentProfile,
        tagger: Arc<dyn MemoryTagger>,
        analyzer: Arc<dyn CognitiveAnalyzer>,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(SharedState::new(state, agent.model.clone()));
        let queue = Arc::new(EventQueue::new());
        let supervisor = Supervisor::new(
            shared.clone(),
            queue.clone(),
            cancel.clone(),
            config,
            agent,
            tagger,
            analyzer,
        );
        let scheduler = Arc::new(TriggerScheduler::new(
            config,
            shared.clone(),
            supervisor.clone(),
            cancel,
        ));
        Self {
            shared,
            queue,
            supervisor,
            scheduler,
            stuck_threshold: config.stuck_threshold(),
            shutdown_wait: config.shutdown_wait(),
        }
    }

    /// Force-reset any analysis left processing past the stuck threshold.
    pub fn recover(&self) -> Vec<AnalysisKind> {
        let mut core = self.shared.lock();
        recovery::recover_task(&mut core.task, Utc::now(), self.stuck_threshold)
    }

    pub fn start_timers(&self) {
        self.scheduler.start();
    }

    pub fn stop_timers(&self) {
        self.scheduler.stop();
    }

    pub fn on_new_message(&self, message: &Message) {
        self.scheduler.on_new_message(message);
    }

    pub fn try_launch(&self, kind: AnalysisKind) -> bool {
        self.supervisor.try_launch(kind)
    }

    pub fn drain_events(&self) -> Vec<MetaEvent> {
        self.queue.drain_all()
    }

    /// Apply parked cognition outcomes to the task state and return the
    /// messages they asked to inject. Invalid injections are dropped.
    pub fn take_injections(&self) -> Vec<Message> {
        let mut core = self.shared.lock();
        let outcomes = std::mem::take(&mut core.outcomes);
        let mut injected = Vec::new();
        for outcome in outcomes {
            let cognition = &mut core.task.cognition;
            match outcome.frequency {
                Some(0) => warn!("ignoring cognition frequency override of 0"),
                Some(frequency) => cognition.frequency = frequency,
                None => {}
            }
            cognition.disabled_models.extend(outcome.disabled_models);
            cognition.model_scores.extend(outcome.model_scores);
            for message in outcome.injected_messages {
                match message.validate_external() {
                    Ok(()) => injected.push(message),
                    Err(e) => warn!("dropping injected message: {}", e),
                }
            }
        }
        injected
    }

    pub fn append_message(&self, message: Message) {
        self.shared.lock().task.messages.push(message);
    }

    pub fn history(&self) -> Vec<Message> {
        self.shared.lock().task.messages.clone()
    }

    pub fn replace_history(&self, messages: Vec<Message>) {
        self.shared.lock().task.messages = messages;
    }

    /// Count a new model request and pick the model for it.
    pub fn begin_request(&self, agent: &AgentProfile) -> (u32, String) {
        let mut core = self.shared.lock();
        core.task.request_count = core.task.request_count.saturating_add(1);
        let model = core.task.cognition.select_model(agent).to_string();
        if model != core.active_model {
            info!("Switching model from {} to {}", core.active_model, model);
            core.active_model.clone_from(&model);
        }
        (core.task.request_count, model)
    }

    pub fn is_enabled(&self, kind: AnalysisKind) -> bool {
        self.shared.lock().task.is_enabled(kind)
    }

    pub fn run_indefinitely(&self) -> bool {
        self.shared.lock().task.run_indefinitely
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.shared.lock().task.to_snapshot()
    }

    /// Analyses still in flight.
    pub fn pending(&self) -> usize {
        self.supervisor.pending()
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Stop triggers, wait (bounded) for in-flight analyses and return every
    /// event they left behind.
    pub async fn shutdown(&self) -> Vec<MetaEvent> {
        self.scheduler.stop();
        let abandoned = self.supervisor.wait_pending(self.shutdown_wait).await;
        if abandoned > 0 {
            warn!(
                "Abandoned {} analysis run(s) after waiting {:?}",
                abandoned, self.shutdown_wait
            );
        }
        self.queue.drain_all()
    }
}

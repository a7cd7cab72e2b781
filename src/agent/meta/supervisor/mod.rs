use super::events::{AnalysisKind, MetaEvent};
use super::queue::EventQueue;
use super::recovery;
use super::SharedState;
use crate::agent::cognitive::{CognitionContext, CognitionOutcome, CognitiveAnalyzer};
use crate::agent::memory::{MemoryTagger, TaggingResult};
use crate::config::MetaConfig;
use crate::errors::MetaloopError;
use crate::providers::base::{AgentProfile, Message};
use crate::utils::task_tracker::TaskTracker;
use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

enum Job {
    Memory {
        history: Vec<Message>,
        batch: Vec<Message>,
    },
    Cognition(Box<CognitionContext>),
}

enum Finished {
    Memory { result: TaggingResult, state: Value },
    Cognition(CognitionOutcome),
}

/// Launches background analyses: one in flight per kind, each raced against a
/// hard timeout and the task's cancellation token.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<SharedState>,
    queue: Arc<EventQueue>,
    tracker: Arc<TaskTracker>,
    cancel: CancellationToken,
    agent: Arc<AgentProfile>,
    tagger: Arc<dyn MemoryTagger>,
    analyzer: Arc<dyn CognitiveAnalyzer>,
    timeout: Duration,
    stuck_threshold: chrono::Duration,
}

impl Supervisor {
    pub fn new(
        shared: Arc<SharedState>,
        queue: Arc<EventQueue>,
        cancel: CancellationToken,
        config: &MetaConfig,
        agent: AgentProfile,
        tagger: Arc<dyn MemoryTagger>,
        analyzer: Arc<dyn CognitiveAnalyzer>,
    ) -> Self {
        Self {
            shared,
            queue,
            tracker: Arc::new(TaskTracker::new()),
            cancel,
            agent: Arc::new(agent),
            tagger,
            analyzer,
            timeout: config.analysis_timeout(),
            stuck_threshold: config.stuck_threshold(),
        }
    }

    /// Try to start an analysis of `kind`. Never blocks.
    ///
    /// Returns false without side effects beyond a stuck-flag reset when the
    /// task is stopped, the kind is disabled, a healthy run is already in
    /// flight, or nothing is waiting to be processed.
    pub fn try_launch(&self, kind: AnalysisKind) -> bool {
        let (id, run_id, job, batch_len) = {
            let mut core = self.shared.lock();
            if core.stopped || self.cancel.is_cancelled() || !core.task.is_enabled(kind) {
                return false;
            }

            let now = Utc::now();
            let status = core.task.status_mut(kind);
            if status.is_processing()
                && recovery::recover_stuck(kind, status, now, self.stuck_threshold).is_none()
            {
                debug!("{} analysis already running, deferring launch", kind);
                return false;
            }

            if core.pending.unprocessed(kind).is_empty() {
                return false;
            }
            let batch = std::mem::take(core.pending.unprocessed_mut(kind));
            let batch_len = batch.len();
            let run_id = core.task.status_mut(kind).begin(now);

            let job = match kind {
                AnalysisKind::Memory => Job::Memory {
                    history: core.task.messages.clone(),
                    batch,
                },
                AnalysisKind::Cognition => Job::Cognition(Box::new(CognitionContext {
                    agent: (*self.agent).clone(),
                    active_model: core.active_model.clone(),
                    history: core.task.messages.clone(),
                    new_messages: batch,
                    task_started_at: core.task.started_at,
                    request_count: core.task.request_count,
                    state: core.task.cognition.clone(),
                })),
            };
            (Uuid::new_v4(), run_id, job, batch_len)
        };

        debug!(
            "Launching {} analysis {} over {} message(s)",
            kind, id, batch_len
        );
        self.queue
            .push(MetaEvent::start(id, kind, json!({ "messageCount": batch_len })));

        let supervisor = self.clone();
        self.tracker
            .spawn_auto_cleanup(format!("{kind}-{id}"), async move {
                supervisor.run(kind, id, run_id, job).await;
            });
        true
    }

    async fn run(&self, kind: AnalysisKind, id: Uuid, run_id: Uuid, job: Job) {
        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(MetaloopError::Analysis {
                kind,
                message: "task cancelled".into(),
            }),
            result = tokio::time::timeout(self.timeout, self.execute(job)) => match result {
                Ok(Ok(done)) => Ok(done),
                Ok(Err(e)) => Err(MetaloopError::Analysis {
                    kind,
                    message: format!("{e:#}"),
                }),
                Err(_) => Err(MetaloopError::Timeout {
                    kind,
                    after_secs: self.timeout.as_secs(),
                }),
            },
        };

        let mut core = self.shared.lock();
        if !core.task.status_mut(kind).finish(run_id) {
            debug!("{} analysis {} finished after its flag was reset", kind, id);
        }
        let payload = match outcome {
            Ok(Finished::Memory { result, state }) => {
                core.task.memory.topic_state = state.clone();
                json!({ "result": result, "state": state })
            }
            Ok(Finished::Cognition(outcome)) => {
                let payload = json!({
                    "result": outcome.result,
                    "injectedMessages": outcome.injected_messages.len(),
                    "frequency": outcome.frequency,
                    "disabledModels": outcome.disabled_models,
                });
                core.outcomes.push(outcome);
                payload
            }
            Err(e) => {
                drop(core);
                warn!("{} analysis {}: {}", kind, id, e);
                return;
            }
        };
        drop(core);

        self.queue.push(MetaEvent::complete(id, kind, payload));
        debug!("{} analysis {} complete", kind, id);
    }

    async fn execute(&self, job: Job) -> Result<Finished> {
        match job {
            Job::Memory { history, batch } => {
                let result = self.tagger.process_messages(&history, &batch).await?;
                Ok(Finished::Memory {
                    result,
                    state: self.tagger.state(),
                })
            }
            Job::Cognition(ctx) => Ok(Finished::Cognition(self.analyzer.analyze(*ctx).await?)),
        }
    }

    /// Analyses spawned and not yet finished.
    pub fn pending(&self) -> usize {
        self.tracker.pending()
    }

    /// Wait up to `limit` for in-flight analyses; returns how many were abandoned.
    pub async fn wait_pending(&self, limit: Duration) -> usize {
        self.tracker.wait_all(limit).await
    }
}

#[cfg(test)]
mod tests;

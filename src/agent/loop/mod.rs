use crate::agent::cognitive::CognitiveAnalyzer;
use crate::agent::memory::MemoryTagger;
use crate::agent::meta::MetaProcessor;
use crate::agent::meta::events::{AnalysisKind, MetaEvent};
use crate::agent::task::{TaskSnapshot, TaskState};
use crate::config::{Config, MetaConfig, TaskConfig};
use crate::errors::MetaloopError;
use crate::providers::base::{
    AgentProfile, Message, ModelEvent, ModelRequest, ModelRequestService,
};
use crate::session::SnapshotStore;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a task stopped requesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tool", rename_all = "snake_case")]
pub enum CompletionReason {
    /// A completion tool returned a result.
    CompletionTool(String),
    MaxRequests,
    Aborted,
    /// The loop was torn down before reaching any terminal state.
    EndedWithoutCompletion,
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CompletionTool(name) => write!(f, "completion tool '{}'", name),
            Self::MaxRequests => f.write_str("request limit reached"),
            Self::Aborted => f.write_str("aborted"),
            Self::EndedWithoutCompletion => f.write_str("ended without explicit completion"),
        }
    }
}

/// Everything a caller observes from a running task, in delivery order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        task_id: String,
        resumed: bool,
    },
    Model(ModelEvent),
    Meta(MetaEvent),
    Completed {
        reason: CompletionReason,
        snapshot: TaskSnapshot,
    },
    Failed {
        error: String,
        snapshot: TaskSnapshot,
    },
}

impl TaskEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    pub fn snapshot(&self) -> Option<&TaskSnapshot> {
        match self {
            Self::Completed { snapshot, .. } | Self::Failed { snapshot, .. } => Some(snapshot),
            _ => None,
        }
    }
}

/// Caller's side of a running task.
pub struct TaskHandle {
    task_id: String,
    events: mpsc::Receiver<TaskEvent>,
    inbox: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Queue a message for the task. It is appended to history before the next
    /// model request.
    pub fn add_message(&self, message: Message) -> Result<(), MetaloopError> {
        message.validate_external()?;
        self.inbox.send(message).map_err(|_| {
            MetaloopError::InvalidInput(format!("task {} has already finished", self.task_id))
        })
    }

    /// Ask the task to stop. It still drains and reports a terminal event.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        self.events.recv().await
    }

    /// Wait for the task to end, returning every event not consumed yet.
    pub async fn join(mut self) -> Vec<TaskEvent> {
        let mut remaining = Vec::new();
        while let Some(event) = self.events.recv().await {
            remaining.push(event);
        }
        if let Err(e) = self.driver.await {
            warn!("Task {} driver ended abnormally: {}", self.task_id, e);
        }
        remaining
    }

    /// Stop listening and wait for the task to clean up.
    pub async fn close(self) {
        let Self {
            task_id,
            events,
            driver,
            ..
        } = self;
        drop(events);
        if let Err(e) = driver.await {
            warn!("Task {} driver ended abnormally: {}", task_id, e);
        }
    }
}

type TaggerFactory = Arc<dyn Fn() -> Arc<dyn MemoryTagger> + Send + Sync>;
type AnalyzerFactory = Arc<dyn Fn() -> Arc<dyn CognitiveAnalyzer> + Send + Sync>;

/// Starts and resumes tasks against a model service and the two analyzers.
///
/// Every task gets a tagger and an analyzer of its own, built by the factories
/// passed to [`TaskRunner::new`].
pub struct TaskRunner {
    meta_config: MetaConfig,
    task_config: TaskConfig,
    service: Arc<dyn ModelRequestService>,
    new_tagger: TaggerFactory,
    new_analyzer: AnalyzerFactory,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl TaskRunner {
    pub fn new<T, A>(
        config: &Config,
        service: Arc<dyn ModelRequestService>,
        tagger: impl Fn() -> T + Send + Sync + 'static,
        analyzer: impl Fn() -> A + Send + Sync + 'static,
    ) -> Self
    where
        T: MemoryTagger + 'static,
        A: CognitiveAnalyzer + 'static,
    {
        Self {
            meta_config: config.meta.clone(),
            task_config: config.task.clone(),
            service,
            new_tagger: Arc::new(move || Arc::new(tagger()) as Arc<dyn MemoryTagger>),
            new_analyzer: Arc::new(move || Arc::new(analyzer()) as Arc<dyn CognitiveAnalyzer>),
            store: None,
        }
    }

    /// Persist the final snapshot of every task to `store`.
    #[must_use]
    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Start a fresh task. Must be called inside a tokio runtime.
    pub fn start(
        &self,
        agent: AgentProfile,
        initial_messages: Vec<Message>,
    ) -> Result<TaskHandle, MetaloopError> {
        agent.validate()?;
        if initial_messages.is_empty() {
            return Err(MetaloopError::InvalidInput(
                "a task needs at least one initial message".into(),
            ));
        }
        for message in &initial_messages {
            message.validate_external()?;
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let state = TaskState::new(task_id, &self.task_config, initial_messages);
        Ok(self.launch(agent, state, (self.new_tagger)(), false))
    }

    /// Resume a task from a snapshot. Must be called inside a tokio runtime.
    pub fn resume(
        &self,
        agent: AgentProfile,
        snapshot: TaskSnapshot,
    ) -> Result<TaskHandle, MetaloopError> {
        agent.validate()?;
        if snapshot.task_id.trim().is_empty() {
            return Err(MetaloopError::InvalidInput(
                "snapshot has an empty task id".into(),
            ));
        }
        let tagger = (self.new_tagger)();
        tagger
            .restore_state(snapshot.memory.topic_state.clone())
            .map_err(|e| {
                MetaloopError::InvalidInput(format!("snapshot memory state rejected: {e:#}"))
            })?;

        let state = TaskState::from_snapshot(snapshot);
        Ok(self.launch(agent, state, tagger, true))
    }

    fn launch(
        &self,
        agent: AgentProfile,
        state: TaskState,
        tagger: Arc<dyn MemoryTagger>,
        resumed: bool,
    ) -> TaskHandle {
        let task_id = state.task_id.clone();
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(self.task_config.event_buffer.max(1));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let meta = MetaProcessor::new(
            &self.meta_config,
            state,
            agent.clone(),
            tagger.clone(),
            (self.new_analyzer)(),
            cancel.clone(),
        );
        let driver = TaskDriver {
            task_id: task_id.clone(),
            agent,
            config: self.task_config.clone(),
            service: self.service.clone(),
            tagger,
            meta,
            inbox: inbox_rx,
            events: event_tx,
            cancel: cancel.clone(),
            store: self.store.clone(),
            resumed,
        };

        TaskHandle {
            task_id,
            events: event_rx,
            inbox: inbox_tx,
            cancel,
            driver: tokio::spawn(driver.run()),
        }
    }
}

/// The consumer dropped its [`TaskHandle`] receiver.
struct Abandoned;

enum LoopExit {
    Finished(CompletionReason),
    Failed(String),
    Abandoned,
}

impl From<Abandoned> for LoopExit {
    fn from(_: Abandoned) -> Self {
        Self::Abandoned
    }
}

/// Runs on every exit path of the driver, including panics: stops triggers,
/// cancels the task token and reports a terminal event if none was sent.
struct CleanupGuard {
    task_id: String,
    meta: MetaProcessor,
    cancel: CancellationToken,
    events: mpsc::Sender<TaskEvent>,
    started: bool,
    terminal_sent: bool,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.meta.stop_timers();
        self.cancel.cancel();
        if self.started && !self.terminal_sent {
            warn!(
                "Task {} ended without explicit completion",
                self.task_id
            );
            let event = TaskEvent::Completed {
                reason: CompletionReason::EndedWithoutCompletion,
                snapshot: self.meta.snapshot(),
            };
            if self.events.try_send(event).is_err() {
                debug!("Task {} consumer gone, terminal event dropped", self.task_id);
            }
        }
    }
}

struct TaskDriver {
    task_id: String,
    agent: AgentProfile,
    config: TaskConfig,
    service: Arc<dyn ModelRequestService>,
    tagger: Arc<dyn MemoryTagger>,
    meta: MetaProcessor,
    inbox: mpsc::UnboundedReceiver<Message>,
    events: mpsc::Sender<TaskEvent>,
    cancel: CancellationToken,
    store: Option<Arc<dyn SnapshotStore>>,
    resumed: bool,
}

impl TaskDriver {
    async fn run(mut self) {
        let mut guard = CleanupGuard {
            task_id: self.task_id.clone(),
            meta: self.meta.clone(),
            cancel: self.cancel.clone(),
            events: self.events.clone(),
            started: false,
            terminal_sent: false,
        };

        let recovered = self.meta.recover();
        info!(
            "Task {} {} with agent {} ({} message(s) in history)",
            self.task_id,
            if self.resumed { "resumed" } else { "started" },
            self.agent.name,
            self.meta.history().len()
        );
        if !recovered.is_empty() {
            info!(
                "Task {} recovered stuck analyses: {:?}",
                self.task_id, recovered
            );
        }
        self.meta.start_timers();

        let started = TaskEvent::Started {
            task_id: self.task_id.clone(),
            resumed: self.resumed,
        };
        let exit = if self.emit(started).await.is_ok() {
            guard.started = true;
            self.request_loop().await
        } else {
            LoopExit::Abandoned
        };

        let leftovers = self.meta.shutdown().await;
        let mut consumer_gone = matches!(exit, LoopExit::Abandoned);
        if !consumer_gone {
            self.apply_injections();
            for event in leftovers {
                if self.emit(TaskEvent::Meta(event)).await.is_err() {
                    consumer_gone = true;
                    break;
                }
            }
        }

        let snapshot = self.meta.snapshot();
        self.persist(&snapshot).await;
        let terminal = match exit {
            LoopExit::Finished(reason) => {
                info!("Task {} completed: {}", self.task_id, reason);
                TaskEvent::Completed { reason, snapshot }
            }
            LoopExit::Failed(error) => {
                warn!("Task {} failed: {}", self.task_id, error);
                TaskEvent::Failed { error, snapshot }
            }
            LoopExit::Abandoned => {
                info!("Task {} abandoned by its consumer", self.task_id);
                TaskEvent::Completed {
                    reason: CompletionReason::EndedWithoutCompletion,
                    snapshot,
                }
            }
        };
        if guard.started && !consumer_gone && self.emit(terminal).await.is_err() {
            debug!("Task {} consumer gone before terminal event", self.task_id);
        }
        guard.terminal_sent = true;
    }

    async fn request_loop(&mut self) -> LoopExit {
        loop {
            self.accept_inbox();
            if let Err(abandoned) = self.flush().await {
                return abandoned.into();
            }
            self.maybe_compact().await;

            let (request_number, model) = self.meta.begin_request(&self.agent);
            let request = ModelRequest {
                messages: self.meta.history(),
                agent: self.agent.clone(),
                model,
                request_number,
            };
            debug!(
                "Task {} request {} with {} message(s)",
                self.task_id,
                request_number,
                request.messages.len()
            );

            let mut stream = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return LoopExit::Finished(CompletionReason::Aborted),
                opened = self.service.request_with_retry(request, None) => match opened {
                    Ok(stream) => stream,
                    Err(e) => return LoopExit::Failed(format!("{e:#}")),
                },
            };

            let mut completed_by: Option<String> = None;
            loop {
                let next = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return LoopExit::Finished(CompletionReason::Aborted),
                    next = stream.next() => next,
                };
                let event = match next {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => return LoopExit::Failed(format!("{e:#}")),
                    None => break,
                };

                if let Err(abandoned) = self.flush().await {
                    return abandoned.into();
                }
                if let Some(message) = event.to_history_message() {
                    self.record(message);
                }
                if let ModelEvent::ToolResult { tool_name, .. } = &event
                    && self.config.is_completion_tool(tool_name)
                    && !self.meta.run_indefinitely()
                {
                    completed_by = Some(tool_name.clone());
                }
                let done = matches!(event, ModelEvent::Completed);
                if let Err(abandoned) = self.emit(TaskEvent::Model(event)).await {
                    return abandoned.into();
                }
                if let Err(abandoned) = self.flush().await {
                    return abandoned.into();
                }
                if done {
                    break;
                }
            }

            if let Some(tool) = completed_by {
                return LoopExit::Finished(CompletionReason::CompletionTool(tool));
            }
            if request_number >= self.config.max_requests {
                return LoopExit::Finished(CompletionReason::MaxRequests);
            }

            let delay = self.config.thought_delay();
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return LoopExit::Finished(CompletionReason::Aborted),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    /// Append a message to history and report it to the trigger scheduler.
    fn record(&self, message: Message) {
        self.meta.append_message(message.clone());
        self.meta.on_new_message(&message);
    }

    fn accept_inbox(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            debug!("Task {} accepted injected {} message", self.task_id, message.role);
            self.record(message);
        }
    }

    /// Apply parked cognition outcomes, appending the messages they inject.
    fn apply_injections(&self) {
        for message in self.meta.take_injections() {
            self.record(message);
        }
    }

    /// Deliver everything background analyses queued since the last flush.
    async fn flush(&self) -> Result<(), Abandoned> {
        self.apply_injections();
        for event in self.meta.drain_events() {
            self.emit(TaskEvent::Meta(event)).await?;
        }
        Ok(())
    }

    async fn emit(&self, event: TaskEvent) -> Result<(), Abandoned> {
        self.events.send(event).await.map_err(|_| Abandoned)
    }

    async fn maybe_compact(&self) {
        if !self.meta.is_enabled(AnalysisKind::Memory) {
            return;
        }
        let history = self.meta.history();
        if !self.tagger.check_compact(&history) {
            return;
        }
        match self.tagger.compact(&history).await {
            Ok(compacted) => {
                info!(
                    "Task {} compacted history: {} -> {} messages",
                    self.task_id,
                    history.len(),
                    compacted.len()
                );
                self.meta.replace_history(compacted);
            }
            Err(e) => warn!("Task {} history compaction failed: {}", self.task_id, e),
        }
    }

    async fn persist(&self, snapshot: &TaskSnapshot) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(snapshot).await {
            warn!("Task {} snapshot not saved: {}", self.task_id, e);
        }
    }
}

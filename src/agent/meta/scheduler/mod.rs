use super::SharedState;
use super::events::AnalysisKind;
use super::supervisor::Supervisor;
use crate::config::MetaConfig;
use crate::providers::base::Message;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct Timers {
    memory_debounce: Option<JoinHandle<()>>,
    cognition_debounce: Option<JoinHandle<()>>,
    cognition_periodic: Option<JoinHandle<()>>,
}

impl Timers {
    fn all(&self) -> impl Iterator<Item = &JoinHandle<()>> {
        [
            &self.memory_debounce,
            &self.cognition_debounce,
            &self.cognition_periodic,
        ]
        .into_iter()
        .flatten()
    }
}

enum MemoryTrigger {
    None,
    Debounce,
    Now,
}

/// Decides when each analysis launches.
///
/// Memory runs after a quiet period following the last message, or at once
/// when the batch threshold is reached. Cognition runs a debounce after every
/// `frequency` messages, and on a fixed period whenever messages are waiting.
/// Every path goes through [`Supervisor::try_launch`], which keeps launches
/// single-flight.
pub struct TriggerScheduler {
    shared: Arc<SharedState>,
    supervisor: Supervisor,
    cancel: CancellationToken,
    memory_debounce: Duration,
    memory_batch_threshold: usize,
    cognition_debounce: Duration,
    cognition_periodic: Duration,
    timers: Mutex<Timers>,
}

impl TriggerScheduler {
    pub fn new(
        config: &MetaConfig,
        shared: Arc<SharedState>,
        supervisor: Supervisor,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            supervisor,
            cancel,
            memory_debounce: config.memory_debounce(),
            memory_batch_threshold: config.memory_batch_threshold,
            cognition_debounce: config.cognition_debounce(),
            cognition_periodic: config.cognition_periodic(),
            timers: Mutex::new(Timers::default()),
        }
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start the periodic cognition timer. Idempotent.
    pub fn start(&self) {
        let mut timers = self.timers();
        if timers.cognition_periodic.is_some() {
            return;
        }
        {
            let core = self.shared.lock();
            if core.stopped || !core.task.cognition.enabled {
                return;
            }
        }

        let supervisor = self.supervisor.clone();
        let cancel = self.cancel.clone();
        let period = self.cognition_periodic;
        timers.cognition_periodic = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        supervisor.try_launch(AnalysisKind::Cognition);
                    }
                }
            }
        }));
        debug!("cognition periodic timer started ({:?})", period);
    }

    /// Record a newly produced message and arm or fire triggers. Never blocks.
    pub fn on_new_message(&self, message: &Message) {
        let (memory, cognition) = {
            let mut core = self.shared.lock();
            if core.stopped {
                return;
            }

            let mut memory = MemoryTrigger::None;
            if core.task.memory.enabled {
                core.pending.unprocessed_memory.push(message.clone());
                memory = if core.pending.unprocessed_memory.len() >= self.memory_batch_threshold {
                    MemoryTrigger::Now
                } else {
                    MemoryTrigger::Debounce
                };
            }

            let mut cognition = false;
            if core.task.cognition.enabled {
                core.pending.unprocessed_cognition.push(message.clone());
                core.pending.messages_since_last_cognition += 1;
                if core.pending.messages_since_last_cognition >= core.task.cognition.frequency {
                    core.pending.messages_since_last_cognition = 0;
                    cognition = true;
                }
            }
            (memory, cognition)
        };

        match memory {
            MemoryTrigger::Now => {
                if let Some(timer) = self.timers().memory_debounce.take() {
                    timer.abort();
                }
                debug!("memory batch threshold reached, launching without debounce");
                self.supervisor.try_launch(AnalysisKind::Memory);
            }
            MemoryTrigger::Debounce => {
                self.arm(AnalysisKind::Memory, self.memory_debounce);
            }
            MemoryTrigger::None => {}
        }
        if cognition {
            debug!("cognition frequency reached, arming debounce");
            self.arm(AnalysisKind::Cognition, self.cognition_debounce);
        }
    }

    /// Replace the debounce timer for `kind` with a fresh one.
    fn arm(&self, kind: AnalysisKind, delay: Duration) {
        let mut timers = self.timers();
        if self.shared.lock().stopped {
            return;
        }
        let supervisor = self.supervisor.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.try_launch(kind);
        });
        let slot = match kind {
            AnalysisKind::Memory => &mut timers.memory_debounce,
            AnalysisKind::Cognition => &mut timers.cognition_debounce,
        };
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Stop accepting messages and cancel every timer.
    pub fn stop(&self) {
        self.shared.lock().stopped = true;
        let mut timers = self.timers();
        let taken = [
            timers.memory_debounce.take(),
            timers.cognition_debounce.take(),
            timers.cognition_periodic.take(),
        ];
        let mut cleared = 0;
        for timer in taken.into_iter().flatten() {
            timer.abort();
            cleared += 1;
        }
        if cleared > 0 {
            debug!("cleared {} trigger timer(s)", cleared);
        }
    }

    /// Timers that are armed and have not fired yet.
    pub fn armed_timers(&self) -> usize {
        self.timers().all().filter(|t| !t.is_finished()).count()
    }
}

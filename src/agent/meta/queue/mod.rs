use super::events::MetaEvent;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    events: VecDeque<MetaEvent>,
    last_timestamp: Option<DateTime<Utc>>,
}

/// FIFO buffer between background analyses and the task driver.
///
/// Analyses push from their own tasks, possibly after the driver has moved on;
/// the driver drains everything at its flush points. Timestamps are stamped on
/// push and never go backwards, even if the wall clock does.
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<Inner>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn push(&self, mut event: MetaEvent) {
        let mut inner = self.lock();
        let now = Utc::now();
        let stamp = match inner.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        event.timestamp = stamp;
        inner.last_timestamp = Some(stamp);
        inner.events.push_back(event);
    }

    /// Take every queued event, oldest first.
    pub fn drain_all(&self) -> Vec<MetaEvent> {
        self.lock().events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }
}

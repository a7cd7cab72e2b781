use super::events::AnalysisKind;
use crate::agent::task::{ProcessingStatus, TaskState};
use chrono::{DateTime, Utc};
use tracing::warn;

/// An analysis is stuck when its flag has been set for longer than `threshold`.
pub fn is_stuck(status: &ProcessingStatus, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
    status.elapsed(now).is_some_and(|elapsed| elapsed > threshold)
}

/// Force-clear `status` if it is stuck, returning how long it had been
/// running when it was reset.
///
/// The analysis itself keeps running; if it finishes later its completion no
/// longer owns the flag and leaves it alone.
pub fn recover_stuck(
    kind: AnalysisKind,
    status: &mut ProcessingStatus,
    now: DateTime<Utc>,
    threshold: chrono::Duration,
) -> Option<chrono::Duration> {
    let elapsed = status.elapsed(now).filter(|elapsed| *elapsed > threshold)?;
    warn!(
        "{} analysis stuck for {:.1}s (threshold {}s), forcing reset",
        kind,
        elapsed.num_milliseconds() as f64 / 1000.0,
        threshold.num_seconds()
    );
    status.clear();
    Some(elapsed)
}

/// Run the reset check for every analysis kind. Called once before a task's
/// first trigger so a snapshot saved mid-analysis cannot block it forever.
pub fn recover_task(
    state: &mut TaskState,
    now: DateTime<Utc>,
    threshold: chrono::Duration,
) -> Vec<AnalysisKind> {
    AnalysisKind::ALL
        .into_iter()
        .filter(|kind| recover_stuck(*kind, state.status_mut(*kind), now, threshold).is_some())
        .collect()
}

#[cfg(test)]
mod tests;

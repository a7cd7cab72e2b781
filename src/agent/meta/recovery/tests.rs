use super::*;
use crate::config::TaskConfig;
use proptest::prelude::*;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// In-memory log sink for asserting on warnings.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn threshold() -> chrono::Duration {
    chrono::Duration::seconds(120)
}

#[test]
fn idle_status_is_never_stuck() {
    let status = ProcessingStatus::default();
    assert!(!is_stuck(&status, Utc::now(), threshold()));
}

#[test]
fn old_flag_is_reset() {
    let now = Utc::now();
    let mut status = ProcessingStatus::default();
    status.begin(now - chrono::Duration::seconds(121));

    assert_eq!(
        recover_stuck(AnalysisKind::Memory, &mut status, now, threshold()),
        Some(chrono::Duration::seconds(121))
    );
    assert!(!status.is_processing());
    assert!(status.started_at().is_none());
}

#[test]
fn flag_at_exact_threshold_is_kept() {
    let now = Utc::now();
    let mut status = ProcessingStatus::default();
    status.begin(now - threshold());

    assert!(recover_stuck(AnalysisKind::Memory, &mut status, now, threshold()).is_none());
    assert!(status.is_processing());
}

#[test]
fn reset_warning_reports_measured_elapsed_time() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();

    let now = Utc::now();
    let mut status = ProcessingStatus::default();
    status.begin(now - chrono::Duration::minutes(10));
    let elapsed = tracing::subscriber::with_default(subscriber, || {
        recover_stuck(AnalysisKind::Cognition, &mut status, now, threshold())
    });

    assert_eq!(elapsed, Some(chrono::Duration::minutes(10)));
    let output = logs.contents();
    assert!(output.contains("WARN"), "no warning logged: {output}");
    assert!(
        output.contains("cognition analysis stuck for 600.0s (threshold 120s)"),
        "unexpected warning: {output}"
    );
}

#[test]
fn young_flag_logs_nothing() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .finish();

    let now = Utc::now();
    let mut status = ProcessingStatus::default();
    status.begin(now - chrono::Duration::seconds(30));
    tracing::subscriber::with_default(subscriber, || {
        recover_stuck(AnalysisKind::Memory, &mut status, now, threshold())
    });

    assert!(logs.contents().is_empty());
}

#[test]
fn recover_task_resets_only_stuck_kinds() {
    let now = Utc::now();
    let mut state = TaskState::new("t", &TaskConfig::default(), Vec::new());
    state.memory.status.begin(now - chrono::Duration::minutes(10));
    state.cognition.status.begin(now - chrono::Duration::seconds(5));

    let reset = recover_task(&mut state, now, threshold());
    assert_eq!(reset, vec![AnalysisKind::Memory]);
    assert!(!state.memory.status.is_processing());
    assert!(state.cognition.status.is_processing());
}

proptest! {
    #[test]
    fn young_flags_survive_and_old_flags_clear(age_ms in 0i64..600_000, threshold_ms in 1i64..300_000) {
        let now = Utc::now();
        let threshold = chrono::Duration::milliseconds(threshold_ms);
        let mut status = ProcessingStatus::default();
        status.begin(now - chrono::Duration::milliseconds(age_ms));

        let reset = recover_stuck(AnalysisKind::Cognition, &mut status, now, threshold);
        prop_assert_eq!(reset.is_some(), age_ms > threshold_ms);
        if let Some(elapsed) = reset {
            prop_assert_eq!(elapsed.num_milliseconds(), age_ms);
        }
        prop_assert_eq!(status.is_processing(), age_ms <= threshold_ms);
        prop_assert_eq!(status.is_processing(), status.started_at().is_some());
    }
}

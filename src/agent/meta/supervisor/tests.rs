use crate::agent::cognitive::CognitionOutcome;
use crate::agent::meta::events::{AnalysisKind, AnalysisPhase};
use crate::agent::meta::test_support::{
    RecordingAnalyzer, RecordingTagger, fixture, fixture_with, msg, settle,
};
use crate::config::{MetaConfig, TaskConfig};
use crate::providers::base::Message;
use chrono::Utc;
use proptest::prelude::*;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn queue_memory(f: &crate::agent::meta::test_support::Fixture, n: usize) {
    let mut core = f.meta.shared().lock();
    for i in 0..n {
        core.pending.unprocessed_memory.push(msg(i));
    }
}

#[tokio::test(start_paused = true)]
async fn launch_emits_start_and_complete_with_shared_id() {
    let f = fixture();
    queue_memory(&f, 3);

    assert!(f.meta.try_launch(AnalysisKind::Memory));
    {
        let core = f.meta.shared().lock();
        assert!(core.task.memory.status.is_processing());
        assert!(core.task.memory.status.started_at().is_some());
        assert!(core.pending.unprocessed_memory.is_empty());
    }
    settle().await;

    let events = f.meta.drain_events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].phase, AnalysisPhase::Start);
    assert_eq!(events[0].payload["messageCount"], 3);
    assert_eq!(events[1].phase, AnalysisPhase::Complete);
    assert_eq!(events[0].id, events[1].id);
    assert_eq!(f.tagger.calls(), vec![3]);

    let core = f.meta.shared().lock();
    assert!(!core.task.memory.status.is_processing());
    assert_eq!(core.task.memory.topic_state["calls"], 1);
}

#[tokio::test(start_paused = true)]
async fn memory_tagger_receives_full_history_and_new_batch() {
    let f = fixture();
    for i in 0..4 {
        f.meta.append_message(msg(i));
    }
    queue_memory(&f, 2);

    assert!(f.meta.try_launch(AnalysisKind::Memory));
    settle().await;

    // "begin" plus four replies, of which two are unprocessed.
    assert_eq!(f.tagger.history_lens(), vec![5]);
    assert_eq!(f.tagger.calls(), vec![2]);
}

#[tokio::test(start_paused = true)]
async fn empty_queue_does_not_launch() {
    let f = fixture();
    assert!(!f.meta.try_launch(AnalysisKind::Memory));
    assert!(!f.meta.try_launch(AnalysisKind::Cognition));
    assert!(f.meta.drain_events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_launch_waits_for_first_to_finish() {
    let f = fixture_with(
        &MetaConfig::default(),
        &TaskConfig::default(),
        RecordingTagger::with_delays([Duration::from_secs(10)]),
        RecordingAnalyzer::default(),
    );
    queue_memory(&f, 1);
    assert!(f.meta.try_launch(AnalysisKind::Memory));

    queue_memory(&f, 2);
    assert!(!f.meta.try_launch(AnalysisKind::Memory));
    assert_eq!(f.meta.shared().lock().pending.unprocessed_memory.len(), 2);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(f.meta.try_launch(AnalysisKind::Memory));
    settle().await;
    assert_eq!(f.tagger.calls(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn failure_suppresses_complete_and_clears_flag() {
    let f = fixture();
    f.tagger.fail.store(true, Ordering::SeqCst);
    queue_memory(&f, 1);
    assert!(f.meta.try_launch(AnalysisKind::Memory));
    settle().await;

    let events = f.meta.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].phase, AnalysisPhase::Start);
    assert!(!f.meta.shared().lock().task.memory.status.is_processing());

    f.tagger.fail.store(false, Ordering::SeqCst);
    queue_memory(&f, 1);
    assert!(f.meta.try_launch(AnalysisKind::Memory));
    settle().await;
    assert_eq!(f.meta.drain_events().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_clears_flag_without_complete() {
    let f = fixture_with(
        &MetaConfig::default(),
        &TaskConfig::default(),
        RecordingTagger::default(),
        RecordingAnalyzer::with_delays([Duration::from_secs(400)]),
    );
    f.meta
        .shared()
        .lock()
        .pending
        .unprocessed_cognition
        .push(msg(1));
    assert!(f.meta.try_launch(AnalysisKind::Cognition));

    tokio::time::sleep(Duration::from_secs(179)).await;
    assert!(f.meta.shared().lock().task.cognition.status.is_processing());

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert!(!f.meta.shared().lock().task.cognition.status.is_processing());
    let events = f.meta.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].phase, AnalysisPhase::Start);
    assert_eq!(f.meta.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn stuck_flag_is_reset_on_launch_attempt() {
    let f = fixture();
    {
        let mut core = f.meta.shared().lock();
        core.task
            .memory
            .status
            .begin(Utc::now() - chrono::Duration::minutes(10));
        core.pending.unprocessed_memory.push(msg(1));
    }
    assert!(f.meta.try_launch(AnalysisKind::Memory));
    settle().await;
    assert_eq!(f.tagger.calls(), vec![1]);
    assert!(!f.meta.shared().lock().task.memory.status.is_processing());
}

#[tokio::test(start_paused = true)]
async fn young_flag_blocks_launch() {
    let f = fixture();
    {
        let mut core = f.meta.shared().lock();
        core.task
            .memory
            .status
            .begin(Utc::now() - chrono::Duration::seconds(30));
        core.pending.unprocessed_memory.push(msg(1));
    }
    assert!(!f.meta.try_launch(AnalysisKind::Memory));
    assert!(f.tagger.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn late_completion_does_not_clear_newer_run() {
    let f = fixture_with(
        &MetaConfig::default(),
        &TaskConfig::default(),
        RecordingTagger::with_delays([Duration::from_secs(10), Duration::from_secs(30)]),
        RecordingAnalyzer::default(),
    );
    queue_memory(&f, 1);
    assert!(f.meta.try_launch(AnalysisKind::Memory));

    // Age the in-flight flag past the stuck threshold.
    {
        let mut core = f.meta.shared().lock();
        core.task.memory.status.clear();
        core.task
            .memory
            .status
            .begin(Utc::now() - chrono::Duration::minutes(10));
        core.pending.unprocessed_memory.push(msg(2));
    }
    assert!(f.meta.try_launch(AnalysisKind::Memory));
    let newer = f.meta.shared().lock().task.memory.status.run_id();

    tokio::time::sleep(Duration::from_secs(11)).await;
    {
        let core = f.meta.shared().lock();
        assert!(core.task.memory.status.is_processing());
        assert_eq!(core.task.memory.status.run_id(), newer);
    }

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!f.meta.shared().lock().task.memory.status.is_processing());
    let completes = f
        .meta
        .drain_events()
        .into_iter()
        .filter(|e| e.phase == AnalysisPhase::Complete)
        .count();
    assert_eq!(completes, 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_rejects_in_flight_runs() {
    let f = fixture_with(
        &MetaConfig::default(),
        &TaskConfig::default(),
        RecordingTagger::with_delays([Duration::from_secs(60)]),
        RecordingAnalyzer::default(),
    );
    queue_memory(&f, 1);
    assert!(f.meta.try_launch(AnalysisKind::Memory));
    settle().await;

    f.cancel.cancel();
    settle().await;
    assert!(!f.meta.shared().lock().task.memory.status.is_processing());
    assert_eq!(f.meta.drain_events().len(), 1);

    queue_memory(&f, 1);
    assert!(!f.meta.try_launch(AnalysisKind::Memory));
}

#[tokio::test(start_paused = true)]
async fn cognition_outcome_is_parked_until_taken() {
    let f = fixture();
    *f.analyzer.outcome.lock().unwrap() = CognitionOutcome {
        injected_messages: vec![
            Message::system("checkpoint please"),
            Message::assistant("not allowed", None),
        ],
        frequency: Some(3),
        disabled_models: vec!["primary".into()],
        ..CognitionOutcome::default()
    };
    f.meta
        .shared()
        .lock()
        .pending
        .unprocessed_cognition
        .push(msg(1));
    assert!(f.meta.try_launch(AnalysisKind::Cognition));
    settle().await;

    assert_eq!(f.meta.shared().lock().task.cognition.frequency, 5);
    let complete = f.meta.drain_events().pop().unwrap();
    assert_eq!(complete.payload["injectedMessages"], 2);

    let injected = f.meta.take_injections();
    assert_eq!(injected.len(), 1);
    assert_eq!(injected[0].content, "checkpoint please");
    let core = f.meta.shared().lock();
    assert_eq!(core.task.cognition.frequency, 3);
    assert!(core.task.cognition.disabled_models.contains("primary"));
}

#[tokio::test(start_paused = true)]
async fn disabled_kind_never_launches() {
    let task = TaskConfig {
        memory_enabled: false,
        ..TaskConfig::default()
    };
    let f = fixture_with(
        &MetaConfig::default(),
        &task,
        RecordingTagger::default(),
        RecordingAnalyzer::default(),
    );
    queue_memory(&f, 1);
    assert!(!f.meta.try_launch(AnalysisKind::Memory));
}

#[derive(Debug, Clone)]
enum Op {
    Message,
    Launch(AnalysisKind),
    Advance(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Message),
        Just(Op::Launch(AnalysisKind::Memory)),
        Just(Op::Launch(AnalysisKind::Cognition)),
        (0u64..5_000).prop_map(Op::Advance),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn at_most_one_run_per_kind(
        ops in prop::collection::vec(op(), 1..60),
        delays in prop::collection::vec(0u64..4_000, 0..30),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        let (memory_max, cognition_max) = rt.block_on(async {
            let millis = || delays.iter().map(|d| Duration::from_millis(*d));
            let task = TaskConfig {
                cognition_frequency: 2,
                ..TaskConfig::default()
            };
            let config = MetaConfig {
                memory_batch_threshold: 3,
                cognition_periodic_secs: 2,
                ..MetaConfig::default()
            };
            let f = fixture_with(
                &config,
                &task,
                RecordingTagger::with_delays(millis()),
                RecordingAnalyzer::with_delays(millis()),
            );
            f.meta.start_timers();
            for (i, op) in ops.iter().enumerate() {
                match op {
                    Op::Message => f.meta.on_new_message(&msg(i)),
                    Op::Launch(kind) => {
                        f.meta.try_launch(*kind);
                    }
                    Op::Advance(ms) => tokio::time::sleep(Duration::from_millis(*ms)).await,
                }
                for kind in AnalysisKind::ALL {
                    let core = f.meta.shared().lock();
                    let status = core.task.status(kind);
                    assert_eq!(status.is_processing(), status.started_at().is_some());
                }
            }
            f.meta.shutdown().await;
            (f.tagger.concurrency.max(), f.analyzer.concurrency.max())
        });
        prop_assert!(memory_max <= 1);
        prop_assert!(cognition_max <= 1);
    }
}

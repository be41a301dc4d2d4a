#![allow(clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use leselern_bandits::{BanditConfig, BanditError, MemoryBackend, ModelBackend, SqliteBackend};
use leselern_core::{ArmSet, Clock, Context, EngineEvent, FixedClock, Observer};
use leselern_feedback::{
    Action, ActionType, CreditStatus, EngineConfig, FeedbackError, Impression, MemorySignalLog,
    RecommendationEngine, SignalLog, SqliteSignalLog,
};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

const START: OffsetDateTime = datetime!(2024-06-03 19:30 UTC);

#[derive(Debug, Default)]
struct Recorder(Mutex<Vec<EngineEvent>>);

impl Recorder {
    fn count(&self, pred: impl Fn(&EngineEvent) -> bool) -> usize {
        self.0.lock().expect("lock").iter().filter(|e| pred(e)).count()
    }
}

impl Observer for Recorder {
    fn on_event(&self, event: &EngineEvent) {
        self.0.lock().expect("lock").push(event.clone());
    }
}

/// Delegates to a memory backend but refuses writes for one arm.
#[derive(Debug, Default)]
struct ReadOnlyArm {
    inner: MemoryBackend,
    arm: String,
}

impl ModelBackend for ReadOnlyArm {
    fn get(&self, identity: &str, arm_id: &str) -> leselern_bandits::Result<Option<String>> {
        self.inner.get(identity, arm_id)
    }
    fn upsert(&self, identity: &str, arm_id: &str, record: &str) -> leselern_bandits::Result<()> {
        if arm_id == self.arm {
            return Err(BanditError::Persistence("read-only".into()));
        }
        self.inner.upsert(identity, arm_id, record)
    }
    fn arms_for(&self, identity: &str) -> leselern_bandits::Result<Vec<String>> {
        self.inner.arms_for(identity)
    }
    fn delete(&self, identity: &str, arm_id: Option<&str>) -> leselern_bandits::Result<usize> {
        self.inner.delete(identity, arm_id)
    }
}

/// Delegates to a memory log but fails the next `failures` reward writes.
#[derive(Debug, Default)]
struct FlakyRewards {
    inner: MemorySignalLog,
    failures: AtomicUsize,
}

impl FlakyRewards {
    fn failing(failures: usize) -> Self {
        Self {
            inner: MemorySignalLog::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

impl SignalLog for FlakyRewards {
    fn append_impression(&self, impression: &Impression) -> leselern_feedback::Result<()> {
        self.inner.append_impression(impression)
    }
    fn append_action(&self, action: &Action) -> leselern_feedback::Result<()> {
        self.inner.append_action(action)
    }
    fn impression(&self, id: &str) -> leselern_feedback::Result<Option<Impression>> {
        self.inner.impression(id)
    }
    fn impressions_for(
        &self,
        identity: &str,
        book_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> leselern_feedback::Result<Vec<Impression>> {
        self.inner.impressions_for(identity, book_id, from, to)
    }
    fn set_reward(
        &self,
        impression_id: &str,
        reward: f64,
        at: OffsetDateTime,
    ) -> leselern_feedback::Result<()> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(FeedbackError::Log("database is locked".into()));
        }
        self.inner.set_reward(impression_id, reward, at)
    }
    fn clear_reward(&self, impression_id: &str) -> leselern_feedback::Result<()> {
        self.inner.clear_reward(impression_id)
    }
    fn actions_between(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> leselern_feedback::Result<Vec<Action>> {
        self.inner.actions_between(from, to)
    }
    fn rename_identity(&self, from: &str, to: &str) -> leselern_feedback::Result<usize> {
        self.inner.rename_identity(from, to)
    }
}

struct Harness {
    engine: RecommendationEngine,
    clock: Arc<FixedClock>,
    recorder: Arc<Recorder>,
    signals: Arc<MemorySignalLog>,
}

fn harness_with(config: EngineConfig, backend: Arc<dyn ModelBackend>) -> Harness {
    let clock = Arc::new(FixedClock::new(START));
    let recorder = Arc::new(Recorder::default());
    let signals = Arc::new(MemorySignalLog::new());
    let engine = RecommendationEngine::builder(config)
        .clock(clock.clone())
        .observer(recorder.clone())
        .build(backend, signals.clone())
        .expect("engine");
    Harness {
        engine,
        clock,
        recorder,
        signals,
    }
}

fn three_arms() -> EngineConfig {
    EngineConfig {
        bandit: BanditConfig {
            arms: ArmSet::from_ids(["A", "B", "C"]),
            ..BanditConfig::default()
        },
        ..EngineConfig::default()
    }
}

#[test]
fn click_ten_minutes_after_impression_trains_selected_arm() {
    let h = harness_with(three_arms(), Arc::new(MemoryBackend::new()));
    let ctx = Context::with_mood("curious");

    let choice = h.engine.select_strategy(&ctx, "reader-1");
    assert_eq!(choice.arm_id, "A");
    assert_eq!(choice.confidence, 0.0);
    assert!(choice.explanation.contains("mood=curious"));

    h.engine
        .record_impression("reader-1", "B1", &ctx, &choice.arm_id, 1, 0.5)
        .expect("impression");
    h.clock.advance(Duration::minutes(10));
    let report = h
        .engine
        .record_action("reader-1", "B1", ActionType::Click, None)
        .expect("action");

    assert_eq!(report.applied(), 1);
    assert_eq!(
        h.recorder
            .count(|e| matches!(e, EngineEvent::ModelUpdated { arm_id, .. } if arm_id == "A")),
        1
    );
    let stats = h.engine.get_stats("reader-1");
    let a = &stats.per_arm[0];
    assert_eq!(a.arm_id, "A");
    assert_eq!(a.interactions, 1);
    assert!((a.average_reward - 0.997).abs() < 1e-3);
    assert_eq!(stats.total_interactions, 1);
    assert_eq!(stats.best_arm.as_deref(), Some("A"));
}

#[test]
fn reward_decays_with_delay_and_expires_after_lookback() {
    let h = harness_with(three_arms(), Arc::new(MemoryBackend::new()));
    let ctx = Context::with_mood("calm");
    h.engine
        .record_impression("r", "B7", &ctx, "B", 2, 0.3)
        .expect("impression");

    h.clock.advance(Duration::hours(1));
    let report = h
        .engine
        .record_action("r", "B7", ActionType::Click, None)
        .expect("action");
    assert!((report.outcomes[0].reward - (-1.0f64 / 48.0).exp()).abs() < 1e-9);

    h.clock.advance(Duration::days(30));
    let late = h
        .engine
        .record_action("r", "B7", ActionType::Click, None)
        .expect("action");
    assert!(late.outcomes.is_empty());
    assert_eq!(
        h.recorder
            .count(|e| matches!(e, EngineEvent::AttributionMiss { .. })),
        1
    );
}

#[test]
fn negative_actions_drive_average_below_zero() {
    let h = harness_with(three_arms(), Arc::new(MemoryBackend::new()));
    let ctx = Context::with_mood("bored");
    for book in ["B1", "B2", "B3"] {
        h.engine
            .record_impression("r", book, &ctx, "C", 1, 0.1)
            .expect("impression");
    }
    h.clock.advance(Duration::minutes(5));
    h.engine
        .record_action("r", "B1", ActionType::Dismiss, None)
        .expect("dismiss");
    h.engine
        .record_action("r", "B2", ActionType::Unsave, None)
        .expect("unsave");
    h.engine
        .record_action("r", "B3", ActionType::Dismiss, None)
        .expect("dismiss");
    let stats = h.engine.get_stats("r");
    let c = stats.per_arm.iter().find(|a| a.arm_id == "C").expect("arm C");
    assert_eq!(c.interactions, 3);
    assert!(c.average_reward < 0.0);
}

#[test]
fn failed_write_for_one_arm_does_not_block_the_others() {
    let backend = Arc::new(ReadOnlyArm {
        inner: MemoryBackend::new(),
        arm: "B".into(),
    });
    let h = harness_with(three_arms(), backend);
    let ctx = Context::with_mood("happy");
    let imp_b = h
        .engine
        .record_impression("r", "B1", &ctx, "B", 1, 0.9)
        .expect("impression");
    h.clock.advance(Duration::minutes(1));
    h.engine
        .record_impression("r", "B1", &ctx, "A", 3, 0.4)
        .expect("impression");
    h.clock.advance(Duration::minutes(1));

    let report = h
        .engine
        .record_action("r", "B1", ActionType::Save, None)
        .expect("attribution continues");
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.applied(), 1);
    assert_eq!(report.failed(), 1);
    let failed = report
        .outcomes
        .iter()
        .find(|o| matches!(o.status, CreditStatus::Failed { .. }))
        .expect("failed outcome");
    assert_eq!(failed.arm_id, "B");
    // The reward of the failed impression is rolled back so reprocessing can retry it.
    let stored = h.signals.impression(&imp_b).expect("read").expect("present");
    assert_eq!(stored.reward, None);
    assert_eq!(stored.attributed_at, None);
    assert!(h.engine.update_model("B", &ctx, 1.0, "r").is_err());
    assert_eq!(
        h.recorder
            .count(|e| matches!(e, EngineEvent::PersistenceFailed { .. })),
        2
    );

    // Selection still answers.
    let choice = h.engine.select_strategy(&ctx, "r");
    assert!(["A", "B", "C"].contains(&choice.arm_id.as_str()));
}

#[test]
fn legacy_arm_ids_are_translated_and_unknown_ones_skipped() {
    let h = harness_with(EngineConfig::default(), Arc::new(MemoryBackend::new()));
    let ctx = Context::default();
    h.engine
        .record_impression("r", "B1", &ctx, "popular", 1, 0.5)
        .expect("impression");
    h.engine
        .record_impression("r", "B2", &ctx, "retired_strategy", 1, 0.5)
        .expect("impression");
    h.clock.advance(Duration::minutes(1));

    let report = h
        .engine
        .record_action("r", "B1", ActionType::Share, None)
        .expect("action");
    assert_eq!(report.outcomes[0].arm_id, "trending");
    assert_eq!(report.applied(), 1);

    let report = h
        .engine
        .record_action("r", "B2", ActionType::Click, None)
        .expect("action");
    assert_eq!(report.outcomes[0].status, CreditStatus::UnknownArm);
    assert_eq!(h.engine.get_stats("r").total_interactions, 1);
}

#[test]
fn reprocess_only_credits_unattributed_impressions() {
    let h = harness_with(three_arms(), Arc::new(MemoryBackend::new()));
    let ctx = Context::with_mood("curious");
    let imp = h
        .engine
        .record_impression("r", "B1", &ctx, "A", 1, 0.5)
        .expect("impression");
    h.clock.advance(Duration::minutes(30));
    h.signals
        .append_action(&Action {
            id: "late-import".into(),
            identity: "r".into(),
            book_id: "B1".into(),
            action_type: ActionType::Save,
            value: None,
            timestamp: h.clock.now(),
            context: None,
        })
        .expect("append");

    let window = (START, START + Duration::days(1));
    let first = h.engine.reprocess(window.0, window.1).expect("reprocess");
    assert_eq!(first.actions, 1);
    assert_eq!(first.applied, 1);
    let second = h.engine.reprocess(window.0, window.1).expect("reprocess");
    assert_eq!(second.applied, 0);
    assert_eq!(h.engine.get_stats("r").total_interactions, 1);
    let stored = h.signals.impression(&imp).expect("read").expect("present");
    assert!(stored.reward.is_some());
    assert!(stored.attributed_at.is_some());
}

fn engine_on(signals: Arc<dyn SignalLog>) -> (RecommendationEngine, Arc<FixedClock>) {
    let clock = Arc::new(FixedClock::new(START));
    let engine = RecommendationEngine::builder(three_arms())
        .clock(clock.clone())
        .build(Arc::new(MemoryBackend::new()), signals)
        .expect("engine");
    (engine, clock)
}

#[test]
fn failed_reward_write_is_retried_once_by_reprocess() {
    let signals = Arc::new(FlakyRewards::failing(1));
    let (engine, clock) = engine_on(signals.clone());
    let ctx = Context::with_mood("curious");
    let imp = engine
        .record_impression("r", "B1", &ctx, "A", 1, 0.5)
        .expect("impression");
    clock.advance(Duration::minutes(10));

    let live = engine
        .record_action("r", "B1", ActionType::Click, None)
        .expect("action");
    assert_eq!(live.applied(), 0);
    assert_eq!(live.failed(), 1);
    // Nothing was learned from an impression that is still unattributed.
    assert_eq!(engine.get_stats("r").total_interactions, 0);

    let window = (START, START + Duration::days(1));
    let first = engine.reprocess(window.0, window.1).expect("reprocess");
    assert_eq!(first.applied, 1);
    assert_eq!(engine.get_stats("r").total_interactions, 1);

    let second = engine.reprocess(window.0, window.1).expect("reprocess");
    assert_eq!(second.applied, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(engine.get_stats("r").total_interactions, 1);
    let stored = signals.impression(&imp).expect("read").expect("present");
    assert!(stored.reward.is_some());
}

#[test]
fn retried_impression_keeps_its_share_of_the_action() {
    // Same two impressions and save; the flaky log loses the first reward write.
    let run = |signals: Arc<dyn SignalLog>| {
        let (engine, clock) = engine_on(Arc::clone(&signals));
        let ctx = Context::with_mood("curious");
        let first = engine
            .record_impression("r", "B1", &ctx, "A", 1, 0.5)
            .expect("impression");
        clock.advance(Duration::hours(1));
        let second = engine
            .record_impression("r", "B1", &ctx, "B", 1, 0.5)
            .expect("impression");
        clock.advance(Duration::minutes(5));
        engine
            .record_action("r", "B1", ActionType::Save, None)
            .expect("action");
        engine
            .reprocess(START, START + Duration::days(1))
            .expect("reprocess");

        let reward = |id: &str| {
            signals
                .impression(id)
                .expect("read")
                .expect("present")
                .reward
                .expect("attributed")
        };
        let stats = engine.get_stats("r");
        let learned: f64 = stats
            .per_arm
            .iter()
            .map(|a| a.average_reward * a.interactions as f64)
            .sum();
        (reward(&first), reward(&second), stats.total_interactions, learned)
    };

    let plain: Arc<dyn SignalLog> = Arc::new(MemorySignalLog::new());
    let flaky: Arc<dyn SignalLog> = Arc::new(FlakyRewards::failing(1));
    let (a, b, n, learned) = run(plain);
    let (a_retry, b_retry, n_retry, learned_retry) = run(flaky);

    assert_eq!(n, 2);
    assert_eq!(n_retry, 2);
    assert!((a_retry - a).abs() < 1e-12, "retried share {a_retry} vs {a}");
    assert!((b_retry - b).abs() < 1e-12);
    assert!((learned_retry - learned).abs() < 1e-9);
    // One save never credits more than its base reward in total.
    assert!(a_retry + b_retry <= ActionType::Save.base_reward(None) + 1e-12);
}

#[test]
fn migration_merges_models_and_moves_signals() {
    let h = harness_with(three_arms(), Arc::new(MemoryBackend::new()));
    let ctx = Context::with_mood("curious");
    h.engine.update_model("A", &ctx, 1.0, "user").expect("update");
    let imp = h
        .engine
        .record_impression("anon", "B1", &ctx, "A", 1, 0.5)
        .expect("impression");
    h.clock.advance(Duration::minutes(2));
    h.engine
        .record_action("anon", "B1", ActionType::Click, None)
        .expect("action");

    let report = h.engine.migrate_identity("anon", "user").expect("migrate");
    assert_eq!(report.models, 1);
    assert_eq!(report.signals, 2);
    assert_eq!(h.engine.get_stats("user").per_arm[0].interactions, 2);
    assert_eq!(h.engine.get_stats("anon").total_interactions, 0);
    let moved = h.signals.impression(&imp).expect("read").expect("present");
    assert_eq!(moved.identity, "user");
}

#[test]
fn reset_and_unknown_arm_errors() {
    let h = harness_with(three_arms(), Arc::new(MemoryBackend::new()));
    let ctx = Context::with_mood("curious");
    h.engine.update_model("B", &ctx, 2.0, "r").expect("update");
    assert!(h.engine.update_model("Z", &ctx, 1.0, "r").is_err());
    assert!(h.engine.reset("r", Some("Z")).is_err());
    assert_eq!(h.engine.reset("r", None).expect("reset"), 1);
    assert_eq!(h.engine.get_stats("r").total_interactions, 0);
}

#[test]
fn sqlite_state_survives_restart() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db = dir.path().join("leselern.db");
    let ctx = Context::with_mood("adventurous");
    let clock = Arc::new(FixedClock::new(START));
    let build = || {
        RecommendationEngine::builder(three_arms())
            .clock(clock.clone())
            .build(
                Arc::new(SqliteBackend::open(&db).expect("models")),
                Arc::new(SqliteSignalLog::open(&db).expect("signals")),
            )
            .expect("engine")
    };

    {
        let engine = build();
        engine
            .record_impression("r", "B1", &ctx, "C", 1, 0.5)
            .expect("impression");
        clock.advance(Duration::minutes(3));
        let report = engine
            .record_action("r", "B1", ActionType::Rate, Some(4.0))
            .expect("action");
        assert_eq!(report.applied(), 1);
    }

    let engine = build();
    let stats = engine.get_stats("r");
    assert_eq!(stats.best_arm.as_deref(), Some("C"));
    assert!(stats.per_arm[2].average_reward > 3.9);
}

//! End-to-end tests for the recording, training, and retraining pipeline
//!
//! These tests go through the public API only, with a real SQLite file in a
//! temporary directory where durability matters.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use foresight_core::engine::Engine;
use foresight_core::journal::RetrainingJournal;
use foresight_core::scheduler::{
    Fitted, RetrainPolicy, RetrainScheduler, TrainingLock, TrainingTarget,
};
use foresight_core::{Config, Database, Error, Foresight, Result};
use foresight_core::{ModelKind, RetrainStatus, RetrainingRecord, SystemMetric, Trigger, UserAction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn config() -> Config {
    let mut config = Config::default();
    config.models.holdout_fraction = 0.0;
    config.scheduler.min_new_samples = 1;
    config
}

fn open(dir: &TempDir, config: Config) -> Foresight {
    Foresight::open_at(
        config,
        &dir.path().join("foresight.db"),
        &dir.path().join("state"),
    )
    .expect("open pipeline")
}

fn action(minute: i64, action_type: &str, application: &str) -> UserAction {
    UserAction {
        action_type: action_type.to_string(),
        application: application.to_string(),
        timestamp: Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap()
            + ChronoDuration::minutes(minute),
        duration_seconds: 1.5,
        success: minute % 3 != 0,
    }
}

/// Wraps the real engine with a slow, cancellable fit.
struct SlowEngine {
    engine: Arc<Engine>,
    delay: Duration,
}

impl TrainingTarget for SlowEngine {
    type Candidate = <Engine as TrainingTarget>::Candidate;

    fn training_lock(&self) -> &TrainingLock {
        self.engine.training_lock()
    }

    fn new_samples(&self) -> usize {
        self.engine.new_samples()
    }

    fn fit(&self, cancel: &CancellationToken) -> Result<Fitted<Self::Candidate>> {
        let deadline = Instant::now() + self.delay;
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.engine.fit(cancel)
    }

    fn commit(&self, candidate: Self::Candidate) -> Result<()> {
        self.engine.commit(candidate)
    }

    fn journal(&self, record: &RetrainingRecord) {
        self.engine.journal(record)
    }
}

fn slow_scheduler(foresight: &Foresight, delay_ms: u64, timeout_ms: u64) -> RetrainScheduler<SlowEngine> {
    let target = SlowEngine {
        engine: foresight.engine().clone(),
        delay: Duration::from_millis(delay_ms),
    };
    RetrainScheduler::with_policy(
        Arc::new(target),
        RetrainPolicy {
            interval: Duration::from_secs(3600),
            min_new_samples: 1,
            training_timeout: Duration::from_millis(timeout_ms),
            shutdown_timeout: Duration::from_millis(timeout_ms),
        },
    )
}

// ============================================
// Durability
// ============================================

#[test]
fn test_events_survive_restart_in_order() {
    let dir = TempDir::new().unwrap();
    let recorded: Vec<UserAction> = (0..6)
        .map(|i| action(i, if i % 2 == 0 { "open" } else { "save" }, "editor"))
        .collect();

    {
        let foresight = open(&dir, config());
        for a in &recorded {
            assert!(foresight.engine().record_action(a.clone()).unwrap().is_persisted());
        }
        foresight
            .engine()
            .record_metric(SystemMetric::new(20.0, 40.0, 60.0, 120))
            .unwrap();
    }

    let reopened = open(&dir, config());
    assert_eq!(reopened.engine().store().recent_actions(6), recorded);
    assert_eq!(reopened.engine().store().metric_count(), 1);

    let db = Database::open(&dir.path().join("foresight.db")).unwrap();
    assert_eq!(db.load_recent_actions(3).unwrap(), recorded[3..].to_vec());

    let stats = reopened.get_ml_stats().unwrap();
    assert_eq!(stats.stored_actions, 6);
    assert_eq!(stats.persistence_failures, 0);
}

#[test]
fn test_buffer_is_bounded_but_storage_is_not() {
    let dir = TempDir::new().unwrap();
    let mut config = config();
    config.buffers.action_capacity = 5;
    let foresight = open(&dir, config);

    let recorded: Vec<UserAction> = (0..8).map(|i| action(i, "click", "browser")).collect();
    for a in &recorded {
        foresight.engine().record_action(a.clone()).unwrap();
    }

    let store = foresight.engine().store();
    assert_eq!(store.action_count(), 5);
    assert_eq!(store.recent_actions(10), recorded[3..].to_vec());
    assert_eq!(foresight.get_ml_stats().unwrap().stored_actions, 8);
}

#[test]
fn test_out_of_range_metric_is_rejected_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let foresight = open(&dir, config());
    foresight
        .engine()
        .record_metric(SystemMetric::new(35.0, 50.0, 70.0, 90))
        .unwrap();

    let err = foresight
        .engine()
        .record_metric(SystemMetric::new(150.0, 50.0, 70.0, 90))
        .unwrap_err();
    assert!(matches!(err, Error::Validation { field: "cpu_usage", .. }));

    let stats = foresight.get_ml_stats().unwrap();
    assert_eq!(stats.buffered_metrics, 1);
    assert_eq!(stats.stored_metrics, 1);
    assert_eq!(stats.last_metric.unwrap().cpu_usage, 35.0);
}

#[test]
fn test_blank_action_type_is_rejected() {
    let foresight = Foresight::in_memory(config()).unwrap();
    assert!(matches!(
        foresight.record_user_action("   ", "editor", 1.0, true),
        Err(Error::Validation { .. })
    ));
    assert_eq!(foresight.get_ml_stats().unwrap().stored_actions, 0);
}

// ============================================
// Training
// ============================================

#[test]
fn test_behavior_model_needs_minimum_samples() {
    let foresight = Foresight::in_memory(config()).unwrap();
    for i in 0..9 {
        foresight
            .record_user_action(if i % 2 == 0 { "open" } else { "save" }, "editor", 1.0, true)
            .unwrap();
    }

    match foresight.train_behavior_model() {
        Err(Error::InsufficientData {
            required, available, ..
        }) => {
            assert_eq!(required, 10);
            assert_eq!(available, 9);
        }
        other => panic!("expected InsufficientData, got {:?}", other),
    }
    assert!(!foresight.get_ml_stats().unwrap().behavior_model.trained);

    foresight
        .record_user_action("open", "editor", 1.0, true)
        .unwrap();
    let result = foresight.train_behavior_model().unwrap();
    assert_eq!(result.samples, 10);
    assert_eq!(result.model, ModelKind::BehaviorPrediction);

    let prediction = foresight.predict_next_action().unwrap();
    assert!(prediction.confidence > 0.0 && prediction.confidence <= 1.0);
    let total: f64 = prediction.probabilities.iter().map(|(_, p)| p).sum();
    assert!((total - 1.0).abs() < 1e-9);
}

#[test]
fn test_trained_models_survive_restart() {
    let dir = TempDir::new().unwrap();
    let trained_at = {
        let foresight = open(&dir, config());
        for i in 0..12 {
            foresight
                .engine()
                .record_action(action(i, if i % 3 == 0 { "search" } else { "type" }, "browser"))
                .unwrap();
        }
        foresight.train_behavior_model().unwrap().trained_at
    };

    let reopened = open(&dir, config());
    let stats = reopened.get_ml_stats().unwrap();
    assert!(stats.behavior_model.trained);
    assert_eq!(stats.behavior_model.trained_at, Some(trained_at));
    assert_eq!(stats.behavior_model.sample_count, Some(12));
    assert!(!stats.optimizer_model.trained);
    assert!(reopened.predict_next_action().is_ok());
}

// ============================================
// Retraining
// ============================================

#[tokio::test]
async fn test_manual_retraining_writes_both_journals() {
    let dir = TempDir::new().unwrap();
    let foresight = open(&dir, config());
    for i in 0..10 {
        foresight
            .record_user_action(if i % 2 == 0 { "open" } else { "close" }, "files", 0.5, true)
            .unwrap();
    }

    let record = foresight.trigger_manual_retraining().await;
    assert_eq!(record.trigger, Trigger::Manual);
    assert_eq!(record.status, RetrainStatus::Completed);
    assert_eq!(record.models_trained, vec![ModelKind::BehaviorPrediction]);

    let journal = RetrainingJournal::new(&dir.path().join("state"), 10);
    assert!(journal.text_path().exists());
    let entries = journal.read_json();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].run_id, record.run_id);

    let history = foresight.engine().retraining_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].run_id, record.run_id);
    assert_eq!(history[0].status, RetrainStatus::Completed);
    assert_eq!(history[0].models_trained, record.models_trained);
}

#[tokio::test]
async fn test_concurrent_retraining_is_skipped() {
    let foresight = Foresight::in_memory(config()).unwrap();
    for i in 0..10 {
        foresight
            .record_user_action(if i % 2 == 0 { "open" } else { "save" }, "editor", 1.0, true)
            .unwrap();
    }
    let scheduler = slow_scheduler(&foresight, 200, 5_000);

    let (first, second) = tokio::join!(
        scheduler.maybe_retrain(Trigger::Manual),
        scheduler.maybe_retrain(Trigger::Scheduled)
    );

    assert_eq!(first.status, RetrainStatus::Completed);
    assert_eq!(second.status, RetrainStatus::SkippedConcurrent);
    assert!(foresight.engine().behavior().is_trained());

    // Only the run that trained is in the durable log
    let history = foresight.engine().retraining_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].run_id, first.run_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_direct_training_is_refused_during_retraining() {
    let foresight = Foresight::in_memory(config()).unwrap();
    for i in 0..10 {
        foresight
            .record_user_action(if i % 2 == 0 { "open" } else { "save" }, "editor", 1.0, true)
            .unwrap();
    }
    let scheduler = Arc::new(slow_scheduler(&foresight, 300, 5_000));

    let run = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.maybe_retrain(Trigger::Manual).await })
    };
    while !scheduler.is_running() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(matches!(
        foresight.train_behavior_model(),
        Err(Error::TrainingBusy)
    ));
    assert!(matches!(
        foresight.train_system_optimizer(),
        Err(Error::TrainingBusy)
    ));
    assert!(foresight.get_ml_stats().unwrap().retraining_running);
    // The pipeline's own scheduler shares the same lock
    assert_eq!(
        foresight.trigger_manual_retraining().await.status,
        RetrainStatus::SkippedConcurrent
    );

    let record = run.await.unwrap();
    assert_eq!(record.status, RetrainStatus::Completed);
    let committed = foresight.engine().behavior().snapshot().unwrap();
    assert_eq!(committed.sample_count, 10);

    assert_eq!(foresight.train_behavior_model().unwrap().samples, 10);
    assert!(!Arc::ptr_eq(
        &committed,
        &foresight.engine().behavior().snapshot().unwrap()
    ));
}

#[tokio::test]
async fn test_timed_out_retraining_keeps_previous_parameters() {
    let foresight = Foresight::in_memory(config()).unwrap();
    for i in 0..10 {
        foresight
            .record_user_action(if i % 2 == 0 { "open" } else { "save" }, "editor", 1.0, true)
            .unwrap();
    }
    foresight.train_behavior_model().unwrap();
    let before = foresight.engine().behavior().snapshot().unwrap();

    for _ in 0..5 {
        foresight
            .record_user_action("export", "editor", 3.0, true)
            .unwrap();
    }
    let scheduler = slow_scheduler(&foresight, 2_000, 50);

    let record = scheduler.maybe_retrain(Trigger::Scheduled).await;
    assert_eq!(record.status, RetrainStatus::timeout());
    assert!(record.models_trained.is_empty());

    scheduler.stop().await;
    assert!(!scheduler.is_running());

    let after = foresight.engine().behavior().snapshot().unwrap();
    assert!(Arc::ptr_eq(&before, &after));

    let history = foresight.engine().retraining_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status.to_string(), "failed: timeout");
}

#[tokio::test]
async fn test_shutdown_retrains_once_and_stops() {
    let foresight = Foresight::in_memory(config()).unwrap();
    let mut source = foresight_core::sampler::FixedSource::new(
        (0..12).map(|i| (10.0 + 2.0 * i as f64, 30.0 + i as f64, 55.0, 150 + i)),
    );
    for _ in 0..12 {
        foresight.record_system_metrics(&mut source).unwrap();
    }

    foresight.start();
    assert!(foresight.scheduler_status().scheduled);

    let record = foresight.shutdown().await;
    assert_eq!(record.trigger, Trigger::Shutdown);
    assert_eq!(record.status, RetrainStatus::Completed);
    assert_eq!(record.models_trained, vec![ModelKind::SystemOptimization]);

    let status = foresight.scheduler_status();
    assert!(!status.scheduled);
    assert!(!status.running);
    assert_eq!(status.last_record.unwrap().run_id, record.run_id);
    assert!(foresight.predict_system_load().is_ok());
}

#[test]
fn test_retention_trim_leaves_recent_events() {
    let foresight = Foresight::in_memory(config()).unwrap();
    for i in 0..4 {
        foresight
            .engine()
            .record_action(action(i * 60 * 24, "open", "editor"))
            .unwrap();
    }

    let cutoff = Utc.with_ymd_and_hms(2025, 3, 12, 0, 0, 0).unwrap();
    let trimmed = foresight.engine().trim_retention(cutoff).unwrap();
    assert_eq!(trimmed.actions, 2);
    assert_eq!(trimmed.metrics, 0);
    assert_eq!(foresight.get_ml_stats().unwrap().stored_actions, 2);
    // Buffers are untouched
    assert_eq!(foresight.engine().store().action_count(), 4);
}

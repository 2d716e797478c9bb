//! The pipeline context object
//!
//! [`Engine`] wires the event store, both models, and durable storage
//! together and is what the scheduler retrains. [`Foresight`] pairs an engine
//! with its [`RetrainScheduler`] and is constructed once per process.

use crate::config::Config;
use crate::db::{Database, TrimResult};
use crate::error::{Error, Result};
use crate::features::{behavior_examples, build_features, optimizer_examples, FeatureLayout};
use crate::insights::{self, BehaviorPatterns, Recommendation};
use crate::journal::RetrainingJournal;
use crate::models::{
    BehaviorParams, BehaviorPredictor, OptimizerParams, SystemOptimizer, Trained, TrainingResult,
};
use crate::sampler::MetricsSource;
use crate::scheduler::{Fitted, RetrainScheduler, SchedulerStatus, TrainingLock, TrainingTarget};
use crate::store::{Durability, EventSnapshot, EventStore};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Training state of one model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStats {
    pub trained: bool,
    pub trained_at: Option<DateTime<Utc>>,
    pub sample_count: Option<usize>,
}

impl ModelStats {
    fn of<P>(trained: Option<Arc<Trained<P>>>) -> Self {
        match trained {
            Some(t) => Self {
                trained: true,
                trained_at: Some(t.trained_at),
                sample_count: Some(t.sample_count),
            },
            None => Self {
                trained: false,
                trained_at: None,
                sample_count: None,
            },
        }
    }
}

/// Snapshot returned by `get_ml_stats`
#[derive(Debug, Clone, Serialize)]
pub struct MlStats {
    pub session_id: String,
    pub buffered_actions: usize,
    pub buffered_metrics: usize,
    pub stored_actions: i64,
    pub stored_metrics: i64,
    pub behavior_model: ModelStats,
    pub optimizer_model: ModelStats,
    pub last_action: Option<UserAction>,
    pub last_metric: Option<SystemMetric>,
    pub last_training: Option<DateTime<Utc>>,
    pub persistence_failures: u64,
    pub retraining_running: bool,
}

/// Parameters fitted by one retraining run, not yet installed
#[derive(Debug)]
pub struct TrainingCandidate {
    pub behavior: Option<Trained<BehaviorParams>>,
    pub optimizer: Option<Trained<OptimizerParams>>,
}

/// Event store, models, and durable storage of one process
pub struct Engine {
    config: Config,
    db: Arc<Database>,
    store: EventStore,
    behavior: BehaviorPredictor,
    optimizer: SystemOptimizer,
    journal: Option<RetrainingJournal>,
    training: TrainingLock,
    last_training: RwLock<Option<DateTime<Utc>>>,
}

impl Engine {
    /// Build an engine over an open database; restores buffers and models.
    pub fn new(config: Config, db: Arc<Database>, journal: Option<RetrainingJournal>) -> Result<Self> {
        config.validate()?;
        db.migrate()?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let store = EventStore::open(db.clone(), session_id, &config.buffers)?;
        let models = &config.models;

        let engine = Self {
            behavior: BehaviorPredictor::new(models.behavior_min_samples, models.holdout_fraction),
            optimizer: SystemOptimizer::new(
                models.optimizer_min_samples,
                models.ridge_penalty,
                models.forecast_horizon,
                models.holdout_fraction,
            ),
            config,
            db,
            store,
            journal,
            training: TrainingLock::default(),
            last_training: RwLock::new(None),
        };
        engine.restore_models()?;

        tracing::info!(
            session_id = %engine.store.session_id(),
            actions = engine.store.action_count(),
            metrics = engine.store.metric_count(),
            behavior_trained = engine.behavior.is_trained(),
            optimizer_trained = engine.optimizer.is_trained(),
            "Engine ready"
        );
        Ok(engine)
    }

    fn restore_models(&self) -> Result<()> {
        let width = FeatureLayout::new(&self.config.features).len();

        if let Some(stored) = self.db.load_model(ModelKind::BehaviorPrediction)? {
            match serde_json::from_str::<BehaviorParams>(&stored.params) {
                Ok(params) if params.scaler.width() == width => {
                    self.behavior.commit(Trained {
                        params,
                        trained_at: stored.trained_at,
                        sample_count: stored.sample_count,
                    });
                    self.note_training(stored.trained_at);
                }
                Ok(_) => tracing::warn!(model = %stored.kind, "Stored model has a different feature width; ignoring"),
                Err(e) => tracing::warn!(model = %stored.kind, error = %e, "Stored model is unreadable; ignoring"),
            }
        }

        if let Some(stored) = self.db.load_model(ModelKind::SystemOptimization)? {
            match serde_json::from_str::<OptimizerParams>(&stored.params) {
                Ok(params)
                    if params.scaler.width() == width
                        && params.horizon == self.optimizer.horizon() =>
                {
                    self.optimizer.commit(Trained {
                        params,
                        trained_at: stored.trained_at,
                        sample_count: stored.sample_count,
                    });
                    self.note_training(stored.trained_at);
                }
                Ok(_) => tracing::warn!(model = %stored.kind, "Stored model does not match the configured layout; ignoring"),
                Err(e) => tracing::warn!(model = %stored.kind, error = %e, "Stored model is unreadable; ignoring"),
            }
        }
        Ok(())
    }

    fn note_training(&self, at: DateTime<Utc>) {
        let mut last = self
            .last_training
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if last.map_or(true, |prev| at > prev) {
            *last = Some(at);
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn behavior(&self) -> &BehaviorPredictor {
        &self.behavior
    }

    pub fn optimizer(&self) -> &SystemOptimizer {
        &self.optimizer
    }

    /// Completion time of the most recent successful training, of either model.
    pub fn last_training(&self) -> Option<DateTime<Utc>> {
        *self
            .last_training
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ============================================
    // Recording
    // ============================================

    /// Record a user action stamped with the current time.
    pub fn record_user_action(
        &self,
        action_type: &str,
        application: &str,
        duration_seconds: f64,
        success: bool,
    ) -> Result<Durability> {
        self.store.record_action(UserAction::new(
            action_type,
            application,
            duration_seconds,
            success,
        ))
    }

    pub fn record_action(&self, action: UserAction) -> Result<Durability> {
        self.store.record_action(action)
    }

    pub fn record_metric(&self, metric: SystemMetric) -> Result<Durability> {
        self.store.record_metric(metric)
    }

    /// Pull one reading from `source` and record it.
    pub fn record_system_metrics(
        &self,
        source: &mut dyn MetricsSource,
    ) -> Result<(SystemMetric, Durability)> {
        let durability = self.store.record_metric(source.sample()?)?;
        let metric = self
            .store
            .last_metric()
            .ok_or_else(|| Error::Sampler("recorded metric missing from buffer".to_string()))?;
        Ok((metric, durability))
    }

    // ============================================
    // Training
    // ============================================

    fn fit_behavior(&self, snapshot: &EventSnapshot) -> Result<(Trained<BehaviorParams>, TrainingResult)> {
        let (features, labels) =
            behavior_examples(&self.config.features, &snapshot.actions, &snapshot.metrics);
        self.behavior.fit(&features, &labels)
    }

    fn fit_optimizer(&self, snapshot: &EventSnapshot) -> Result<(Trained<OptimizerParams>, TrainingResult)> {
        let (features, targets) = optimizer_examples(
            &self.config.features,
            self.optimizer.horizon(),
            &snapshot.actions,
            &snapshot.metrics,
        );
        self.optimizer.fit(&features, &targets)
    }

    fn install_behavior(&self, trained: Trained<BehaviorParams>) -> Result<()> {
        let params = serde_json::to_string(&trained.params)?;
        self.db.save_model(
            ModelKind::BehaviorPrediction,
            &params,
            trained.trained_at,
            trained.sample_count,
        )?;
        let at = trained.trained_at;
        self.behavior.commit(trained);
        self.note_training(at);
        Ok(())
    }

    fn install_optimizer(&self, trained: Trained<OptimizerParams>) -> Result<()> {
        let params = serde_json::to_string(&trained.params)?;
        self.db.save_model(
            ModelKind::SystemOptimization,
            &params,
            trained.trained_at,
            trained.sample_count,
        )?;
        let at = trained.trained_at;
        self.optimizer.commit(trained);
        self.note_training(at);
        Ok(())
    }

    /// Train the behavior predictor on the buffered events right now.
    ///
    /// Fails with [`Error::TrainingBusy`] while a retraining run holds the models.
    pub fn train_behavior_model(&self) -> Result<TrainingResult> {
        let _guard = self.training.try_acquire().ok_or(Error::TrainingBusy)?;
        let (trained, result) = self.fit_behavior(&self.store.snapshot())?;
        self.install_behavior(trained)?;
        tracing::info!(
            samples = result.samples,
            accuracy = result.training_score,
            holdout = ?result.holdout_score,
            "Behavior model trained"
        );
        Ok(result)
    }

    /// Train the system optimizer on the buffered events right now.
    pub fn train_system_optimizer(&self) -> Result<TrainingResult> {
        let _guard = self.training.try_acquire().ok_or(Error::TrainingBusy)?;
        let (trained, result) = self.fit_optimizer(&self.store.snapshot())?;
        self.install_optimizer(trained)?;
        tracing::info!(
            samples = result.samples,
            rmse = result.training_score,
            holdout = ?result.holdout_score,
            "System optimizer trained"
        );
        Ok(result)
    }

    // ============================================
    // Prediction
    // ============================================

    fn current_features(&self) -> Vec<f64> {
        let features = &self.config.features;
        build_features(
            features,
            &self.store.recent_actions(features.action_window),
            &self.store.recent_metrics(features.metric_window),
        )
    }

    /// Predict the next action from the most recent buffered events.
    pub fn predict_next_action(&self) -> Result<ActionPrediction> {
        self.behavior.predict(&self.current_features())
    }

    /// Predict what follows the action described by `context`.
    ///
    /// The context action is appended to the buffered window; an empty
    /// context predicts from the buffers alone.
    pub fn predict_next_action_in(&self, context: &PredictionContext) -> Result<ActionPrediction> {
        let features = &self.config.features;
        let mut actions = self.store.recent_actions(features.action_window);
        if let Some(current) = context.current_action(actions.last()) {
            actions.push(current);
        }
        let metrics = self.store.recent_metrics(features.metric_window);
        self.behavior
            .predict(&build_features(features, &actions, &metrics))
    }

    /// Buffered actions the behavior model finds surprising, most anomalous first.
    ///
    /// Each of the newest `models.anomaly_window` actions is scored against the
    /// context that preceded it. `threshold` defaults to `models.anomaly_threshold`.
    pub fn detect_anomalies(&self, threshold: Option<f64>) -> Result<Vec<Anomaly>> {
        let threshold = threshold.unwrap_or(self.config.models.anomaly_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::validation(
                "threshold",
                format!("{} is outside [0, 1]", threshold),
            ));
        }
        let snapshot = self.store.snapshot();
        let (features, _) =
            behavior_examples(&self.config.features, &snapshot.actions, &snapshot.metrics);

        let skip = features.len().saturating_sub(self.config.models.anomaly_window);
        let flagged = self.behavior.anomalies(&features[skip..], threshold)?;
        let anomalies: Vec<Anomaly> = flagged
            .into_iter()
            .map(|(i, anomaly_score, expected)| {
                let action = &snapshot.actions[skip + i];
                Anomaly {
                    timestamp: action.timestamp,
                    action_type: action.action_type.clone(),
                    application: action.application.clone(),
                    anomaly_score,
                    expected,
                }
            })
            .collect();

        tracing::debug!(
            examined = features.len() - skip,
            flagged = anomalies.len(),
            threshold,
            "Anomaly scan finished"
        );
        Ok(anomalies)
    }

    /// Forecast CPU and memory `forecast_horizon` samples ahead.
    pub fn predict_system_load(&self) -> Result<LoadForecast> {
        self.optimizer.predict(&self.current_features())
    }

    // ============================================
    // Reporting and maintenance
    // ============================================

    pub fn get_ml_stats(&self) -> Result<MlStats> {
        let counts = self.db.count_events()?;
        Ok(MlStats {
            session_id: self.store.session_id().to_string(),
            buffered_actions: self.store.action_count(),
            buffered_metrics: self.store.metric_count(),
            stored_actions: counts.actions,
            stored_metrics: counts.metrics,
            behavior_model: ModelStats::of(self.behavior.snapshot()),
            optimizer_model: ModelStats::of(self.optimizer.snapshot()),
            last_action: self.store.last_action(),
            last_metric: self.store.last_metric(),
            last_training: self.last_training(),
            persistence_failures: self.store.persistence_failures(),
            retraining_running: self.training.is_held(),
        })
    }

    pub fn behavior_patterns(&self) -> Result<BehaviorPatterns> {
        BehaviorPatterns::compute(&self.db)
    }

    pub fn recommendations(&self) -> Result<Vec<Recommendation>> {
        insights::recommendations(&self.db)
    }

    /// Newest-first retraining records from the durable log.
    pub fn retraining_history(&self, limit: usize) -> Result<Vec<RetrainingRecord>> {
        self.db.recent_retraining(limit)
    }

    /// Delete durable events older than `before`. Buffers are not touched.
    pub fn trim_retention(&self, before: DateTime<Utc>) -> Result<TrimResult> {
        self.db.trim_retention(before)
    }
}

impl TrainingTarget for Engine {
    type Candidate = TrainingCandidate;

    fn training_lock(&self) -> &TrainingLock {
        &self.training
    }

    fn new_samples(&self) -> usize {
        self.store.snapshot().count_since(self.last_training())
    }

    fn fit(&self, cancel: &CancellationToken) -> Result<Fitted<TrainingCandidate>> {
        let snapshot = self.store.snapshot();
        let mut candidate = TrainingCandidate {
            behavior: None,
            optimizer: None,
        };
        let mut models = Vec::new();
        let mut notes = Vec::new();
        let mut insufficient = None;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.fit_behavior(&snapshot) {
            Ok((trained, result)) => {
                notes.push(format!(
                    "{}: {} samples, accuracy {:.3}",
                    result.model, result.samples, result.training_score
                ));
                models.push(ModelKind::BehaviorPrediction);
                candidate.behavior = Some(trained);
            }
            Err(e @ Error::InsufficientData { .. }) => {
                notes.push(e.to_string());
                insufficient = Some(e);
            }
            Err(e) => return Err(e),
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.fit_optimizer(&snapshot) {
            Ok((trained, result)) => {
                notes.push(format!(
                    "{}: {} samples, rmse {:.3}",
                    result.model, result.samples, result.training_score
                ));
                models.push(ModelKind::SystemOptimization);
                candidate.optimizer = Some(trained);
            }
            Err(e @ Error::InsufficientData { .. }) => {
                notes.push(e.to_string());
                insufficient.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if models.is_empty() {
            if let Some(e) = insufficient {
                return Err(e);
            }
        }

        Ok(Fitted {
            candidate,
            models,
            message: Some(notes.join("; ")),
        })
    }

    fn commit(&self, candidate: TrainingCandidate) -> Result<()> {
        if let Some(trained) = candidate.behavior {
            self.install_behavior(trained)?;
        }
        if let Some(trained) = candidate.optimizer {
            self.install_optimizer(trained)?;
        }
        Ok(())
    }

    fn journal(&self, record: &RetrainingRecord) {
        if let Err(e) = self
            .db
            .append_retraining(record, self.config.scheduler.history_limit)
        {
            tracing::error!(run_id = %record.run_id, error = %e, "Failed to store retraining record");
        }
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(record) {
                tracing::error!(
                    run_id = %record.run_id,
                    path = %journal.json_path().display(),
                    error = %e,
                    "Failed to write retraining journal"
                );
            }
        }
    }
}

/// One pipeline per process: the engine and the scheduler that retrains it
pub struct Foresight {
    engine: Arc<Engine>,
    scheduler: RetrainScheduler<Engine>,
}

impl Foresight {
    /// Open the pipeline at the default XDG locations.
    pub fn open(config: Config) -> Result<Self> {
        Self::open_at(config, &Config::database_path(), &Config::state_dir())
    }

    /// Open the pipeline with an explicit database file and journal directory.
    pub fn open_at(config: Config, database_path: &Path, state_dir: &Path) -> Result<Self> {
        let db = Database::open(database_path)?
            .with_retry_policy((&config.persistence).into());
        let journal = RetrainingJournal::new(state_dir, config.scheduler.history_limit);
        Self::from_parts(config, Arc::new(db), Some(journal))
    }

    /// Pipeline over an in-memory database and no journal files.
    pub fn in_memory(config: Config) -> Result<Self> {
        let db = Database::open_in_memory()?.with_retry_policy((&config.persistence).into());
        Self::from_parts(config, Arc::new(db), None)
    }

    pub fn from_parts(
        config: Config,
        db: Arc<Database>,
        journal: Option<RetrainingJournal>,
    ) -> Result<Self> {
        let scheduler_config = config.scheduler.clone();
        let engine = Arc::new(Engine::new(config, db, journal)?);
        let scheduler = RetrainScheduler::new(engine.clone(), &scheduler_config);
        Ok(Self { engine, scheduler })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &RetrainScheduler<Engine> {
        &self.scheduler
    }

    pub fn record_user_action(
        &self,
        action_type: &str,
        application: &str,
        duration_seconds: f64,
        success: bool,
    ) -> Result<Durability> {
        self.engine
            .record_user_action(action_type, application, duration_seconds, success)
    }

    pub fn record_system_metrics(
        &self,
        source: &mut dyn MetricsSource,
    ) -> Result<(SystemMetric, Durability)> {
        self.engine.record_system_metrics(source)
    }

    pub fn train_behavior_model(&self) -> Result<TrainingResult> {
        self.engine.train_behavior_model()
    }

    pub fn train_system_optimizer(&self) -> Result<TrainingResult> {
        self.engine.train_system_optimizer()
    }

    pub fn predict_next_action(&self) -> Result<ActionPrediction> {
        self.engine.predict_next_action()
    }

    pub fn predict_next_action_in(&self, context: &PredictionContext) -> Result<ActionPrediction> {
        self.engine.predict_next_action_in(context)
    }

    pub fn detect_anomalies(&self, threshold: Option<f64>) -> Result<Vec<Anomaly>> {
        self.engine.detect_anomalies(threshold)
    }

    pub fn predict_system_load(&self) -> Result<LoadForecast> {
        self.engine.predict_system_load()
    }

    pub fn get_ml_stats(&self) -> Result<MlStats> {
        self.engine.get_ml_stats()
    }

    pub async fn trigger_manual_retraining(&self) -> RetrainingRecord {
        self.scheduler.trigger_manual_retraining().await
    }

    pub async fn maybe_retrain(&self, trigger: Trigger) -> RetrainingRecord {
        self.scheduler.maybe_retrain(trigger).await
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Start periodic retraining. Must be called inside a tokio runtime.
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Final retraining attempt bounded by the shutdown timeout, then stop.
    pub async fn shutdown(&self) -> RetrainingRecord {
        self.scheduler.shutdown().await
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }
}

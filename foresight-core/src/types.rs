//! Core domain types for foresight
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | A [`UserAction`] or [`SystemMetric`] record |
//! | **Trigger** | Why a retraining attempt started: scheduled, shutdown, or manual |
//! | **Readiness policy** | Rule deciding whether enough new data exists to retrain |
//! | **Retention horizon** | Age beyond which durable records may be purged |
//!
//! `action_type` and `application` are open string categories. Nothing in the
//! pipeline assumes a closed set; the feature builder hashes them into buckets.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Events
// ============================================

/// One observed user interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAction {
    /// Category label, e.g. "text_editing", "click", "app_switch"
    pub action_type: String,
    /// Foreground application at the time of the action
    pub application: String,
    /// When the action occurred
    pub timestamp: DateTime<Utc>,
    /// Non-negative; 0 when instantaneous
    pub duration_seconds: f64,
    /// Outcome flag
    pub success: bool,
}

impl UserAction {
    /// Create an action stamped with the current wall clock.
    pub fn new(
        action_type: impl Into<String>,
        application: impl Into<String>,
        duration_seconds: f64,
        success: bool,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            application: application.into(),
            timestamp: Utc::now(),
            duration_seconds,
            success,
        }
    }

    /// Trim the category fields and check every invariant.
    pub fn validated(mut self) -> Result<Self> {
        self.action_type = self.action_type.trim().to_string();
        self.application = self.application.trim().to_string();

        if self.action_type.is_empty() {
            return Err(Error::validation("action_type", "must not be empty"));
        }
        if self.application.is_empty() {
            return Err(Error::validation("application", "must not be empty"));
        }
        if !self.duration_seconds.is_finite() || self.duration_seconds < 0.0 {
            return Err(Error::validation(
                "duration_seconds",
                format!("{} is not a non-negative number", self.duration_seconds),
            ));
        }
        Ok(self)
    }
}

/// One sampled system-resource snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetric {
    pub timestamp: DateTime<Utc>,
    /// Percent, 0-100
    pub cpu_usage: f64,
    /// Percent, 0-100
    pub memory_usage: f64,
    /// Percent, 0-100
    pub disk_usage: f64,
    pub active_processes: u32,
}

impl SystemMetric {
    /// Create a metric stamped with the current wall clock.
    pub fn new(cpu_usage: f64, memory_usage: f64, disk_usage: f64, active_processes: u32) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_usage,
            memory_usage,
            disk_usage,
            active_processes,
        }
    }

    /// Check that every percentage lies in [0, 100].
    pub fn validated(self) -> Result<Self> {
        check_percentage("cpu_usage", self.cpu_usage)?;
        check_percentage("memory_usage", self.memory_usage)?;
        check_percentage("disk_usage", self.disk_usage)?;
        Ok(self)
    }
}

fn check_percentage(field: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::validation(
            field,
            format!("{} is outside [0, 100]", value),
        ))
    }
}

/// Which durable table a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Action,
    Metric,
}

impl EventKind {
    pub fn table(&self) -> &'static str {
        match self {
            EventKind::Action => "actions",
            EventKind::Metric => "metrics",
        }
    }
}

// ============================================
// Models
// ============================================

/// The two predictive models owned by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Next-action classifier
    BehaviorPrediction,
    /// CPU/memory forecaster
    SystemOptimization,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::BehaviorPrediction => "behavior_prediction",
            ModelKind::SystemOptimization => "system_optimization",
        }
    }
}

impl std::str::FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "behavior_prediction" => Ok(ModelKind::BehaviorPrediction),
            "system_optimization" => Ok(ModelKind::SystemOptimization),
            _ => Err(format!("unknown model: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicted next action with its posterior probability
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionPrediction {
    pub action_type: String,
    /// Always within [0, 1]
    pub confidence: f64,
    /// Posterior for every known label, sorted by probability descending
    pub probabilities: Vec<(String, f64)>,
}

/// What the user is doing now, for a context-conditioned prediction
///
/// The context becomes the newest action of the prediction window. Missing
/// fields are taken from the newest buffered action; `at` defaults to now.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionContext {
    pub action_type: Option<String>,
    pub application: Option<String>,
    pub at: Option<DateTime<Utc>>,
}

impl PredictionContext {
    pub fn is_empty(&self) -> bool {
        self.action_type.is_none() && self.application.is_none() && self.at.is_none()
    }

    /// The action in progress, or `None` when the context names nothing or
    /// there is no buffered action to fill in a missing category.
    pub fn current_action(&self, newest: Option<&UserAction>) -> Option<UserAction> {
        if self.is_empty() {
            return None;
        }
        let action_type = self
            .action_type
            .clone()
            .or_else(|| newest.map(|a| a.action_type.clone()))?;
        let application = self
            .application
            .clone()
            .or_else(|| newest.map(|a| a.application.clone()))?;
        Some(UserAction {
            action_type,
            application,
            timestamp: self.at.unwrap_or_else(Utc::now),
            duration_seconds: 0.0,
            success: true,
        })
    }
}

/// A buffered action the behavior model could not explain with confidence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub timestamp: DateTime<Utc>,
    pub action_type: String,
    pub application: String,
    /// `1 - confidence` of the best prediction for this action's context
    pub anomaly_score: f64,
    /// Label the model expected instead
    pub expected: String,
}

/// Forecast resource utilization, clamped to [0, 100]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadForecast {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    /// Metric samples ahead this forecast refers to
    pub horizon: usize,
}

// ============================================
// Retraining
// ============================================

/// Why a retraining attempt was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Shutdown,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Shutdown => "shutdown",
            Trigger::Manual => "manual",
        }
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Trigger::Scheduled),
            "shutdown" => Ok(Trigger::Shutdown),
            "manual" => Ok(Trigger::Manual),
            _ => Err(format!("unknown trigger: {}", s)),
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a retraining attempt.
///
/// Skips and failures are ordinary results, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum RetrainStatus {
    Completed,
    /// Carries the reason, e.g. "timeout"
    Failed(String),
    SkippedConcurrent,
    SkippedInsufficientData,
}

impl RetrainStatus {
    pub fn timeout() -> Self {
        RetrainStatus::Failed("timeout".to_string())
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RetrainStatus::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RetrainStatus::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            RetrainStatus::SkippedConcurrent | RetrainStatus::SkippedInsufficientData
        )
    }

    /// Parse status string from storage.
    pub fn from_storage(value: &str) -> Self {
        match value {
            "completed" => RetrainStatus::Completed,
            "skipped_concurrent" => RetrainStatus::SkippedConcurrent,
            "skipped_insufficient_data" => RetrainStatus::SkippedInsufficientData,
            other => RetrainStatus::Failed(
                other
                    .strip_prefix("failed: ")
                    .unwrap_or(other)
                    .to_string(),
            ),
        }
    }
}

impl std::fmt::Display for RetrainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrainStatus::Completed => f.write_str("completed"),
            RetrainStatus::Failed(reason) => write!(f, "failed: {}", reason),
            RetrainStatus::SkippedConcurrent => f.write_str("skipped_concurrent"),
            RetrainStatus::SkippedInsufficientData => f.write_str("skipped_insufficient_data"),
        }
    }
}

impl From<RetrainStatus> for String {
    fn from(status: RetrainStatus) -> Self {
        status.to_string()
    }
}

impl From<String> for RetrainStatus {
    fn from(value: String) -> Self {
        RetrainStatus::from_storage(&value)
    }
}

/// Audit entry for one retraining attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainingRecord {
    pub run_id: String,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: RetrainStatus,
    pub models_trained: Vec<ModelKind>,
    /// Human-readable detail (per-model outcome or failure reason)
    pub message: Option<String>,
}

impl RetrainingRecord {
    /// Record for an attempt that never started training.
    pub fn skipped(trigger: Trigger, status: RetrainStatus, message: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            trigger,
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            status,
            models_trained: Vec::new(),
            message,
        }
    }
}

//! Retraining scheduler
//!
//! State machine `idle → running → idle`, shared by every trigger:
//!
//! - A second attempt while one is running returns [`RetrainStatus::SkippedConcurrent`].
//! - The readiness policy (new samples since the last successful training)
//!   gates every run.
//! - Fitting happens on the blocking pool with a child [`CancellationToken`];
//!   the caller waits under a timeout. On timeout the token is cancelled and
//!   the candidate is discarded, so live parameters never change.
//! - The [`TrainingLock`] is released only after both the caller and the
//!   fitting worker are done. The target owns the lock, so direct training
//!   outside the scheduler contends for the same flag.

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::types::{ModelKind, RetrainStatus, RetrainingRecord, Trigger};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// A set of models the scheduler can retrain
pub trait TrainingTarget: Send + Sync + 'static {
    /// Fitted but not yet installed parameters
    type Candidate: Send + 'static;

    /// Exclusive right to fit or install parameters, shared with every
    /// other trainer of the same models.
    fn training_lock(&self) -> &TrainingLock;

    /// Events recorded since the last successful training.
    fn new_samples(&self) -> usize;

    /// Fit every model from a snapshot without touching live parameters.
    ///
    /// Returns [`Error::InsufficientData`] when no model had enough examples
    /// and should return [`Error::Cancelled`] soon after `cancel` fires.
    fn fit(&self, cancel: &CancellationToken) -> Result<Fitted<Self::Candidate>>;

    /// Install a candidate produced by [`TrainingTarget::fit`].
    fn commit(&self, candidate: Self::Candidate) -> Result<()>;

    /// Persist the audit record of a completed or failed attempt.
    fn journal(&self, record: &RetrainingRecord);
}

/// Output of a successful fit
#[derive(Debug)]
pub struct Fitted<C> {
    pub candidate: C,
    pub models: Vec<ModelKind>,
    pub message: Option<String>,
}

/// Timing and readiness policy
#[derive(Debug, Clone, Copy)]
pub struct RetrainPolicy {
    pub interval: Duration,
    pub min_new_samples: usize,
    pub training_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl From<&SchedulerConfig> for RetrainPolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            interval: config.interval(),
            min_new_samples: config.min_new_samples,
            training_timeout: config.training_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

impl RetrainPolicy {
    pub fn timeout_for(&self, trigger: Trigger) -> Duration {
        match trigger {
            Trigger::Shutdown => self.shutdown_timeout,
            Trigger::Scheduled | Trigger::Manual => self.training_timeout,
        }
    }
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    /// Some trainer holds the [`TrainingLock`], including an abandoned fit winding down
    pub running: bool,
    /// The periodic loop is active
    pub scheduled: bool,
    pub next_tick: Option<DateTime<Utc>>,
    pub last_record: Option<RetrainingRecord>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// At most one holder may fit or install model parameters at a time
#[derive(Debug, Clone, Default)]
pub struct TrainingLock {
    held: Arc<AtomicBool>,
}

impl TrainingLock {
    /// Take the lock, or `None` if a training run already holds it.
    pub fn try_acquire(&self) -> Option<TrainingGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(TrainingGuard {
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the [`TrainingLock`] when dropped
#[derive(Debug)]
pub struct TrainingGuard {
    held: Arc<AtomicBool>,
}

impl Drop for TrainingGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

type Worker<C> = JoinHandle<Result<Fitted<C>>>;

struct Inner<T: TrainingTarget> {
    target: Arc<T>,
    policy: RetrainPolicy,
    training_token: CancellationToken,
    last_record: Mutex<Option<RetrainingRecord>>,
    next_tick: Mutex<Option<DateTime<Utc>>>,
    abandoned: Mutex<Vec<Worker<T::Candidate>>>,
}

impl<T: TrainingTarget> Inner<T> {
    async fn maybe_retrain(&self, trigger: Trigger) -> RetrainingRecord {
        let Some(guard) = self.target.training_lock().try_acquire() else {
            tracing::debug!(%trigger, "Training already running; skipping");
            return self.remember(RetrainingRecord::skipped(
                trigger,
                RetrainStatus::SkippedConcurrent,
                None,
            ));
        };
        let guard = Arc::new(guard);

        let new_samples = self.target.new_samples();
        if new_samples < self.policy.min_new_samples {
            tracing::debug!(
                %trigger,
                new_samples,
                required = self.policy.min_new_samples,
                "Not enough new data; skipping"
            );
            return self.remember(RetrainingRecord::skipped(
                trigger,
                RetrainStatus::SkippedInsufficientData,
                Some(format!(
                    "{} new samples, need {}",
                    new_samples, self.policy.min_new_samples
                )),
            ));
        }

        let timeout = self.policy.timeout_for(trigger);
        let started_at = Utc::now();
        let clock = Instant::now();
        tracing::info!(%trigger, new_samples, timeout_ms = timeout.as_millis() as u64, "Retraining started");

        let cancel = self.training_token.child_token();
        let mut worker = {
            let target = self.target.clone();
            let cancel = cancel.clone();
            let guard = guard.clone();
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                target.fit(&cancel)
            })
        };

        let outcome = tokio::time::timeout(timeout, &mut worker).await;
        let (status, models_trained, message) = match outcome {
            Ok(Ok(Ok(fitted))) if cancel.is_cancelled() => {
                drop(fitted);
                (RetrainStatus::Failed("cancelled".to_string()), Vec::new(), None)
            }
            Ok(Ok(Ok(fitted))) => match self.target.commit(fitted.candidate) {
                Ok(()) => (RetrainStatus::Completed, fitted.models, fitted.message),
                Err(e) => (
                    RetrainStatus::Failed(format!("commit: {}", e)),
                    Vec::new(),
                    fitted.message,
                ),
            },
            Ok(Ok(Err(e @ Error::InsufficientData { .. }))) => (
                RetrainStatus::SkippedInsufficientData,
                Vec::new(),
                Some(e.to_string()),
            ),
            Ok(Ok(Err(Error::Cancelled))) => {
                (RetrainStatus::Failed("cancelled".to_string()), Vec::new(), None)
            }
            Ok(Ok(Err(e))) => (RetrainStatus::Failed(e.to_string()), Vec::new(), None),
            Ok(Err(join_error)) => (
                RetrainStatus::Failed(format!("training worker died: {}", join_error)),
                Vec::new(),
                None,
            ),
            Err(_) => {
                cancel.cancel();
                lock(&self.abandoned).push(worker);
                (
                    RetrainStatus::timeout(),
                    Vec::new(),
                    Some(format!("abandoned after {} ms", timeout.as_millis())),
                )
            }
        };

        let record = RetrainingRecord {
            run_id: uuid::Uuid::new_v4().to_string(),
            trigger,
            started_at,
            ended_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as i64,
            status,
            models_trained,
            message,
        };

        if record.status.is_skipped() {
            tracing::debug!(%trigger, status = %record.status, "Retraining skipped");
        } else {
            if record.status.is_completed() {
                tracing::info!(
                    %trigger,
                    duration_ms = record.duration_ms,
                    models = record.models_trained.len(),
                    "Retraining completed"
                );
            } else {
                tracing::warn!(
                    %trigger,
                    status = %record.status,
                    duration_ms = record.duration_ms,
                    "Retraining failed"
                );
            }
            self.target.journal(&record);
        }

        drop(guard);
        self.remember(record)
    }

    fn remember(&self, record: RetrainingRecord) -> RetrainingRecord {
        *lock(&self.last_record) = Some(record.clone());
        record
    }

    /// Wait for every abandoned worker to exit.
    async fn join_abandoned(&self) {
        let workers: Vec<_> = lock(&self.abandoned).drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Abandoned training worker ended abnormally");
            }
        }
    }

    fn prune_abandoned(&self) {
        lock(&self.abandoned).retain(|worker| !worker.is_finished());
    }
}

/// Serializes retraining of a [`TrainingTarget`] and runs it on a timer
pub struct RetrainScheduler<T: TrainingTarget> {
    inner: Arc<Inner<T>>,
    loop_token: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: TrainingTarget> RetrainScheduler<T> {
    pub fn new(target: Arc<T>, config: &SchedulerConfig) -> Self {
        Self::with_policy(target, RetrainPolicy::from(config))
    }

    pub fn with_policy(target: Arc<T>, policy: RetrainPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                target,
                policy,
                training_token: CancellationToken::new(),
                last_record: Mutex::new(None),
                next_tick: Mutex::new(None),
                abandoned: Mutex::new(Vec::new()),
            }),
            loop_token: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &RetrainPolicy {
        &self.inner.policy
    }

    pub fn target(&self) -> &Arc<T> {
        &self.inner.target
    }

    /// Attempt one retraining run. Never runs two fits at once.
    pub async fn maybe_retrain(&self, trigger: Trigger) -> RetrainingRecord {
        self.inner.prune_abandoned();
        self.inner.maybe_retrain(trigger).await
    }

    pub async fn trigger_manual_retraining(&self) -> RetrainingRecord {
        self.maybe_retrain(Trigger::Manual).await
    }

    /// Spawn the periodic loop. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut handle = lock(&self.loop_handle);
        if handle.is_some() {
            return;
        }
        if self.loop_token.is_cancelled() {
            tracing::warn!("Scheduler was stopped; not restarting");
            return;
        }

        let inner = self.inner.clone();
        let token = self.loop_token.clone();
        let period = inner.policy.interval;
        set_next_tick(&inner, period);

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_secs = period.as_secs(), "Retraining loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.prune_abandoned();
                        let record = inner.maybe_retrain(Trigger::Scheduled).await;
                        tracing::debug!(status = %record.status, "Scheduled retraining attempt finished");
                        set_next_tick(&inner, period);
                    }
                    _ = token.cancelled() => {
                        tracing::info!("Retraining loop shutting down");
                        break;
                    }
                }
            }
            *lock(&inner.next_tick) = None;
        }));
    }

    async fn stop_loop(&self) {
        self.loop_token.cancel();
        let handle = lock(&self.loop_handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Retraining loop ended abnormally");
            }
        }
    }

    /// Stop the loop, make the final shutdown attempt, then stop everything.
    ///
    /// Bounded by the training timeout (for a scheduled run already in
    /// progress) plus the shutdown timeout.
    pub async fn shutdown(&self) -> RetrainingRecord {
        self.stop_loop().await;
        self.inner.join_abandoned().await;
        let record = self.inner.maybe_retrain(Trigger::Shutdown).await;
        self.stop().await;
        record
    }

    /// Cancel the loop and any in-flight fit, and join them before returning.
    pub async fn stop(&self) {
        self.stop_loop().await;
        self.inner.training_token.cancel();
        self.inner.join_abandoned().await;
    }

    pub fn is_running(&self) -> bool {
        self.inner.target.training_lock().is_held()
    }

    pub fn status(&self) -> SchedulerStatus {
        let scheduled = lock(&self.loop_handle)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        SchedulerStatus {
            running: self.is_running(),
            scheduled,
            next_tick: *lock(&self.inner.next_tick),
            last_record: lock(&self.inner.last_record).clone(),
        }
    }
}

fn set_next_tick<T: TrainingTarget>(inner: &Inner<T>, period: Duration) {
    let next = chrono::Duration::from_std(period)
        .ok()
        .and_then(|period| Utc::now().checked_add_signed(period));
    *lock(&inner.next_tick) = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeTarget {
        lock: TrainingLock,
        delay: Duration,
        new_samples: usize,
        outcome: Option<fn() -> Error>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        fits: AtomicUsize,
        committed: Mutex<Vec<usize>>,
        journaled: Mutex<Vec<RetrainingRecord>>,
    }

    impl FakeTarget {
        fn new(delay_ms: u64) -> Self {
            Self {
                delay: Duration::from_millis(delay_ms),
                new_samples: 100,
                ..Default::default()
            }
        }
    }

    impl TrainingTarget for FakeTarget {
        type Candidate = usize;

        fn training_lock(&self) -> &TrainingLock {
            &self.lock
        }

        fn new_samples(&self) -> usize {
            self.new_samples
        }

        fn fit(&self, cancel: &CancellationToken) -> Result<Fitted<usize>> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            let run = self.fits.fetch_add(1, Ordering::SeqCst) + 1;

            let deadline = Instant::now() + self.delay;
            let result = loop {
                if cancel.is_cancelled() {
                    break Err(Error::Cancelled);
                }
                if Instant::now() >= deadline {
                    break match self.outcome {
                        Some(make_error) => Err(make_error()),
                        None => Ok(Fitted {
                            candidate: run,
                            models: vec![ModelKind::BehaviorPrediction],
                            message: None,
                        }),
                    };
                }
                std::thread::sleep(Duration::from_millis(2));
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn commit(&self, candidate: usize) -> Result<()> {
            lock(&self.committed).push(candidate);
            Ok(())
        }

        fn journal(&self, record: &RetrainingRecord) {
            lock(&self.journaled).push(record.clone());
        }
    }

    fn policy(timeout_ms: u64) -> RetrainPolicy {
        RetrainPolicy {
            interval: Duration::from_millis(40),
            min_new_samples: 5,
            training_timeout: Duration::from_millis(timeout_ms),
            shutdown_timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn test_completed_run_commits_and_journals() {
        let target = Arc::new(FakeTarget::new(5));
        let scheduler = RetrainScheduler::with_policy(target.clone(), policy(1000));

        let record = scheduler.trigger_manual_retraining().await;
        assert_eq!(record.status, RetrainStatus::Completed);
        assert_eq!(record.trigger, Trigger::Manual);
        assert_eq!(record.models_trained, vec![ModelKind::BehaviorPrediction]);
        assert_eq!(*lock(&target.committed), vec![1]);
        assert_eq!(lock(&target.journaled).len(), 1);
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.status().last_record, Some(record));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_attempts_are_skipped() {
        let target = Arc::new(FakeTarget::new(200));
        let scheduler = Arc::new(RetrainScheduler::with_policy(target.clone(), policy(5000)));

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.maybe_retrain(Trigger::Scheduled).await })
        };
        while !scheduler.is_running() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for trigger in [Trigger::Manual, Trigger::Scheduled, Trigger::Shutdown] {
            let record = scheduler.maybe_retrain(trigger).await;
            assert_eq!(record.status, RetrainStatus::SkippedConcurrent);
        }

        // Other trainers of the same target are shut out too
        assert!(target.training_lock().try_acquire().is_none());

        let record = first.await.unwrap();
        assert_eq!(record.status, RetrainStatus::Completed);
        assert_eq!(target.fits.load(Ordering::SeqCst), 1);
        assert_eq!(target.max_active.load(Ordering::SeqCst), 1);
        // Skips are not journaled
        assert_eq!(lock(&target.journaled).len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_discards_candidate() {
        crate::logging::init_test();
        let target = Arc::new(FakeTarget::new(2000));
        let scheduler = RetrainScheduler::with_policy(target.clone(), policy(30));

        let record = scheduler.maybe_retrain(Trigger::Manual).await;
        assert_eq!(record.status, RetrainStatus::timeout());
        assert_eq!(record.status.to_string(), "failed: timeout");
        assert!(record.models_trained.is_empty());
        assert!(lock(&target.committed).is_empty());
        assert_eq!(lock(&target.journaled)[0].status, RetrainStatus::timeout());

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        assert_eq!(target.active.load(Ordering::SeqCst), 0);
        assert!(lock(&target.committed).is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_worker_blocks_next_run_until_it_exits() {
        let target = Arc::new(FakeTarget::new(2000));
        let scheduler = RetrainScheduler::with_policy(target.clone(), policy(20));

        let first = scheduler.maybe_retrain(Trigger::Manual).await;
        assert_eq!(first.status, RetrainStatus::timeout());

        // The worker sees cancellation within a few milliseconds
        for _ in 0..500 {
            if !scheduler.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(!scheduler.is_running());
        assert_eq!(target.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_is_skipped_while_lock_is_held_elsewhere() {
        let target = Arc::new(FakeTarget::new(0));
        let scheduler = RetrainScheduler::with_policy(target.clone(), policy(1000));

        let held = target.training_lock().try_acquire().unwrap();
        assert!(scheduler.is_running());
        let record = scheduler.trigger_manual_retraining().await;
        assert_eq!(record.status, RetrainStatus::SkippedConcurrent);
        assert_eq!(target.fits.load(Ordering::SeqCst), 0);

        drop(held);
        assert!(!scheduler.is_running());
        let record = scheduler.trigger_manual_retraining().await;
        assert_eq!(record.status, RetrainStatus::Completed);
    }

    #[tokio::test]
    async fn test_readiness_policy() {
        let target = Arc::new(FakeTarget {
            new_samples: 4,
            ..FakeTarget::new(0)
        });
        let scheduler = RetrainScheduler::with_policy(target.clone(), policy(1000));

        let record = scheduler.maybe_retrain(Trigger::Shutdown).await;
        assert_eq!(record.status, RetrainStatus::SkippedInsufficientData);
        assert_eq!(target.fits.load(Ordering::SeqCst), 0);
        assert!(lock(&target.journaled).is_empty());
    }

    #[tokio::test]
    async fn test_model_level_insufficient_data_is_a_skip() {
        let target = Arc::new(FakeTarget {
            outcome: Some(|| Error::InsufficientData {
                model: "behavior_prediction",
                required: 10,
                available: 3,
            }),
            ..FakeTarget::new(0)
        });
        let scheduler = RetrainScheduler::with_policy(target.clone(), policy(1000));

        let record = scheduler.maybe_retrain(Trigger::Manual).await;
        assert_eq!(record.status, RetrainStatus::SkippedInsufficientData);
        assert!(lock(&target.journaled).is_empty());
    }

    #[tokio::test]
    async fn test_fit_error_is_recorded_as_failure() {
        let target = Arc::new(FakeTarget {
            outcome: Some(|| Error::Config("boom".to_string())),
            ..FakeTarget::new(0)
        });
        let scheduler = RetrainScheduler::with_policy(target.clone(), policy(1000));

        let record = scheduler.maybe_retrain(Trigger::Scheduled).await;
        assert!(record.status.is_failed());
        assert_eq!(lock(&target.journaled).len(), 1);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_loop_runs_until_stopped() {
        let target = Arc::new(FakeTarget::new(0));
        let scheduler = RetrainScheduler::with_policy(target.clone(), policy(1000));

        scheduler.start();
        assert!(scheduler.status().scheduled);
        assert!(scheduler.status().next_tick.is_some());
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.stop().await;

        let fits = target.fits.load(Ordering::SeqCst);
        assert!(fits >= 1);
        let status = scheduler.status();
        assert!(!status.scheduled);
        assert!(!status.running);
        assert!(status.next_tick.is_none());
        assert!(lock(&target.journaled)
            .iter()
            .all(|r| r.trigger == Trigger::Scheduled));

        // A stopped scheduler stays stopped
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(target.fits.load(Ordering::SeqCst), fits);
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded() {
        let target = Arc::new(FakeTarget::new(5000));
        let scheduler = RetrainScheduler::with_policy(target.clone(), policy(50));
        scheduler.start();

        let clock = Instant::now();
        let record = scheduler.shutdown().await;
        assert_eq!(record.trigger, Trigger::Shutdown);
        assert_eq!(record.status, RetrainStatus::timeout());
        assert!(clock.elapsed() < Duration::from_secs(2));
        assert_eq!(target.active.load(Ordering::SeqCst), 0);
    }
}

//! Event store: bounded in-memory buffers backed by the durable log
//!
//! Each event kind has its own FIFO buffer. Recording validates first, then
//! appends to the buffer, then forwards to the [`Database`]. Reads are served
//! from memory only.

use crate::config::BufferConfig;
use crate::db::Database;
use crate::error::Result;
use crate::types::{SystemMetric, UserAction};
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Whether a recorded event also reached durable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    Persisted,
    /// Durable append failed after retries; the event lives only in memory
    MemoryOnly,
}

impl Durability {
    pub fn is_persisted(&self) -> bool {
        matches!(self, Durability::Persisted)
    }
}

/// Consistent copy of both buffers, taken at one instant
#[derive(Debug, Clone, Default)]
pub struct EventSnapshot {
    /// Oldest first
    pub actions: Vec<UserAction>,
    /// Oldest first
    pub metrics: Vec<SystemMetric>,
}

impl EventSnapshot {
    /// Events strictly newer than `since` (all events when `None`).
    pub fn count_since(&self, since: Option<DateTime<Utc>>) -> usize {
        match since {
            None => self.actions.len() + self.metrics.len(),
            Some(since) => {
                self.actions.iter().filter(|a| a.timestamp > since).count()
                    + self.metrics.iter().filter(|m| m.timestamp > since).count()
            }
        }
    }
}

/// A FIFO buffer with a fixed bound.
#[derive(Debug)]
struct Ring<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, item: T) {
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    fn recent(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }
}

/// Move `ts` to one microsecond past `last` when it does not come after it.
fn monotonic(ts: DateTime<Utc>, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match last {
        Some(last) if ts <= last => last + Duration::microseconds(1),
        _ => ts,
    }
}

/// Bounded in-memory + durable log of user actions and system metrics
pub struct EventStore {
    db: Arc<Database>,
    session_id: String,
    actions: Mutex<Ring<UserAction>>,
    metrics: Mutex<Ring<SystemMetric>>,
    // Held across buffer push and durable append so both see the same order.
    action_writer: Mutex<()>,
    metric_writer: Mutex<()>,
    persistence_failures: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventStore {
    /// Create an empty store for one collection session.
    pub fn new(db: Arc<Database>, session_id: impl Into<String>, config: &BufferConfig) -> Self {
        Self {
            db,
            session_id: session_id.into(),
            actions: Mutex::new(Ring::new(config.action_capacity)),
            metrics: Mutex::new(Ring::new(config.metric_capacity)),
            action_writer: Mutex::new(()),
            metric_writer: Mutex::new(()),
            persistence_failures: AtomicU64::new(0),
        }
    }

    /// Create a store and fill its buffers from durable storage.
    pub fn open(db: Arc<Database>, session_id: impl Into<String>, config: &BufferConfig) -> Result<Self> {
        let store = Self::new(db, session_id, config);
        store.warm()?;
        Ok(store)
    }

    /// Reload the most recent durable events into the buffers.
    pub fn warm(&self) -> Result<()> {
        let mut actions = lock(&self.actions);
        let mut metrics = lock(&self.metrics);

        let stored_actions = self.db.load_recent_actions(actions.capacity)?;
        let stored_metrics = self.db.load_recent_metrics(metrics.capacity)?;

        tracing::debug!(
            actions = stored_actions.len(),
            metrics = stored_metrics.len(),
            "Warming event buffers"
        );

        actions.items.clear();
        metrics.items.clear();
        stored_actions.into_iter().for_each(|a| actions.push(a));
        stored_metrics.into_iter().for_each(|m| metrics.push(m));
        Ok(())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Validate, buffer, and durably append one action.
    ///
    /// Validation failures leave the store untouched. A durable write failure
    /// is logged and counted; the event stays in the buffer.
    pub fn record_action(&self, action: UserAction) -> Result<Durability> {
        let mut action = action.validated()?;

        let _writer = lock(&self.action_writer);
        {
            let mut buffer = lock(&self.actions);
            action.timestamp = monotonic(action.timestamp, buffer.items.back().map(|a| a.timestamp));
            buffer.push(action.clone());
        }

        Ok(self.durable(self.db.append_action(&self.session_id, &action), "action"))
    }

    /// Validate, buffer, and durably append one metric sample.
    pub fn record_metric(&self, metric: SystemMetric) -> Result<Durability> {
        let mut metric = metric.validated()?;

        let _writer = lock(&self.metric_writer);
        {
            let mut buffer = lock(&self.metrics);
            metric.timestamp = monotonic(metric.timestamp, buffer.items.back().map(|m| m.timestamp));
            buffer.push(metric.clone());
        }

        Ok(self.durable(self.db.append_metric(&self.session_id, &metric), "metric"))
    }

    fn durable(&self, result: Result<i64>, kind: &'static str) -> Durability {
        match result {
            Ok(_) => Durability::Persisted,
            Err(e) => {
                let failures = self.persistence_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::error!(
                    kind,
                    session_id = %self.session_id,
                    failures,
                    error = %e,
                    "Event kept in memory only"
                );
                Durability::MemoryOnly
            }
        }
    }

    /// Up to `n` most recent actions, newest last.
    pub fn recent_actions(&self, n: usize) -> Vec<UserAction> {
        lock(&self.actions).recent(n)
    }

    /// Up to `n` most recent metric samples, newest last.
    pub fn recent_metrics(&self, n: usize) -> Vec<SystemMetric> {
        lock(&self.metrics).recent(n)
    }

    /// Copy both buffers under their locks.
    pub fn snapshot(&self) -> EventSnapshot {
        let actions = lock(&self.actions).recent(usize::MAX);
        let metrics = lock(&self.metrics).recent(usize::MAX);
        EventSnapshot { actions, metrics }
    }

    pub fn action_count(&self) -> usize {
        lock(&self.actions).items.len()
    }

    pub fn metric_count(&self) -> usize {
        lock(&self.metrics).items.len()
    }

    pub fn last_action(&self) -> Option<UserAction> {
        lock(&self.actions).items.back().cloned()
    }

    pub fn last_metric(&self) -> Option<SystemMetric> {
        lock(&self.metrics).items.back().cloned()
    }

    /// Durable appends that failed after exhausting retries.
    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::EventKind;
    use chrono::TimeZone;

    fn test_store(action_capacity: usize) -> EventStore {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let config = BufferConfig {
            action_capacity,
            metric_capacity: 3,
        };
        EventStore::new(Arc::new(db), "test-session", &config)
    }

    fn action(n: u32) -> UserAction {
        UserAction {
            action_type: format!("type{}", n),
            application: "editor".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, n).unwrap(),
            duration_seconds: 0.0,
            success: true,
        }
    }

    #[test]
    fn test_buffer_keeps_most_recent_in_arrival_order() {
        let store = test_store(5);
        for n in 0..12 {
            store.record_action(action(n)).unwrap();
            assert!(store.action_count() <= 5);
        }

        let types: Vec<_> = store
            .recent_actions(100)
            .into_iter()
            .map(|a| a.action_type)
            .collect();
        assert_eq!(types, ["type7", "type8", "type9", "type10", "type11"]);

        let last_two: Vec<_> = store
            .recent_actions(2)
            .into_iter()
            .map(|a| a.action_type)
            .collect();
        assert_eq!(last_two, ["type10", "type11"]);
    }

    #[test]
    fn test_durable_log_keeps_evicted_events() {
        let store = test_store(2);
        for n in 0..4 {
            assert!(store.record_action(action(n)).unwrap().is_persisted());
        }
        assert_eq!(store.action_count(), 2);
        assert_eq!(store.db.count(EventKind::Action).unwrap(), 4);
    }

    #[test]
    fn test_rejected_metric_leaves_store_unchanged() {
        let store = test_store(5);
        let err = store
            .record_metric(SystemMetric::new(150.0, 10.0, 10.0, 1))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "cpu_usage", .. }));
        assert_eq!(store.metric_count(), 0);
        assert_eq!(store.db.count(EventKind::Metric).unwrap(), 0);
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let store = test_store(5);
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        for _ in 0..3 {
            let mut a = action(0);
            a.timestamp = ts;
            store.record_action(a).unwrap();
        }

        let stamps: Vec<_> = store.recent_actions(3).iter().map(|a| a.timestamp).collect();
        assert_eq!(stamps[0], ts);
        assert_eq!(stamps[1], ts + Duration::microseconds(1));
        assert_eq!(stamps[2], ts + Duration::microseconds(2));
    }

    #[test]
    fn test_warm_restores_buffers() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        let config = BufferConfig {
            action_capacity: 3,
            metric_capacity: 3,
        };

        let first = EventStore::new(db.clone(), "s1", &config);
        for n in 0..5 {
            first.record_action(action(n)).unwrap();
        }

        let second = EventStore::open(db, "s2", &config).unwrap();
        assert_eq!(second.recent_actions(10), first.recent_actions(10));
    }

    #[test]
    fn test_persistence_failure_keeps_event_in_memory() {
        let store = test_store(5);
        store
            .db
            .connection()
            .execute_batch("DROP TABLE actions")
            .unwrap();

        let durability = store.record_action(action(1)).unwrap();
        assert_eq!(durability, Durability::MemoryOnly);
        assert_eq!(store.action_count(), 1);
        assert_eq!(store.persistence_failures(), 1);
    }

    #[test]
    fn test_snapshot_counts_new_events() {
        let store = test_store(10);
        for n in 0..4 {
            store.record_action(action(n)).unwrap();
        }
        let snapshot = store.snapshot();
        assert_eq!(snapshot.count_since(None), 4);
        let since = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap();
        assert_eq!(snapshot.count_since(Some(since)), 2);
    }
}

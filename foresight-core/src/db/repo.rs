//! Database repository layer
//!
//! Sole owner of durable storage. Every append goes through the retry policy;
//! reads run against the same WAL-mode connection.

use crate::error::Result;
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::retry::RetryPolicy;

/// Busy timeout handed to SQLite; contention beyond this goes to the retry loop.
const BUSY_TIMEOUT: Duration = Duration::from_millis(50);

/// Model parameters as stored in the `models` table.
#[derive(Debug, Clone)]
pub struct StoredModel {
    pub kind: ModelKind,
    /// JSON-encoded parameter set
    pub params: String,
    pub trained_at: DateTime<Utc>,
    pub sample_count: usize,
}

/// Row counts of the durable event tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TableCounts {
    pub actions: i64,
    pub metrics: i64,
}

/// Number of rows deleted by a retention trim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TrimResult {
    pub actions: usize,
    pub metrics: usize,
}

impl TrimResult {
    pub fn total(&self) -> usize {
        self.actions + self.metrics
    }
}

/// Database handle (single connection, serialized by a mutex)
pub struct Database {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

/// Format a timestamp the way every table stores it.
///
/// Fixed width with a `Z` suffix, so lexical order equals time order.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn digest(params: &str) -> String {
    hex::encode(Sha256::digest(params.as_bytes()))
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL lets readers proceed while a writer holds the lock
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            retry: RetryPolicy::default(),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry: RetryPolicy::default(),
        })
    }

    /// Replace the retry policy used for durable writes
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bring the schema up to date; safe to call on every startup
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.conn();
        super::schema::migrate(&mut conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============================================
    // Event log
    // ============================================

    /// Append one validated action. Returns its row id.
    pub fn append_action(&self, session_id: &str, action: &UserAction) -> Result<i64> {
        let timestamp = format_ts(&action.timestamp);
        self.retry.run("append_action", || {
            let conn = self.conn();
            conn.execute(
                r#"
                INSERT INTO actions (session_id, timestamp, action_type, application, duration_seconds, success)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    session_id,
                    timestamp,
                    action.action_type,
                    action.application,
                    action.duration_seconds,
                    action.success,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Append one validated metric sample. Returns its row id.
    pub fn append_metric(&self, session_id: &str, metric: &SystemMetric) -> Result<i64> {
        let timestamp = format_ts(&metric.timestamp);
        self.retry.run("append_metric", || {
            let conn = self.conn();
            conn.execute(
                r#"
                INSERT INTO metrics (session_id, timestamp, cpu_usage, memory_usage, disk_usage, active_processes)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    session_id,
                    timestamp,
                    metric.cpu_usage,
                    metric.memory_usage,
                    metric.disk_usage,
                    metric.active_processes,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// The `n` most recent actions, oldest first.
    pub fn load_recent_actions(&self, n: usize) -> Result<Vec<UserAction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM (
                SELECT * FROM actions ORDER BY id DESC LIMIT ?1
            ) ORDER BY id ASC
            "#,
        )?;
        let actions = stmt
            .query_map([n as i64], Self::row_to_action)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(actions)
    }

    /// The `n` most recent metric samples, oldest first.
    pub fn load_recent_metrics(&self, n: usize) -> Result<Vec<SystemMetric>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM (
                SELECT * FROM metrics ORDER BY id DESC LIMIT ?1
            ) ORDER BY id ASC
            "#,
        )?;
        let metrics = stmt
            .query_map([n as i64], Self::row_to_metric)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(metrics)
    }

    fn row_to_action(row: &Row) -> rusqlite::Result<UserAction> {
        Ok(UserAction {
            action_type: row.get("action_type")?,
            application: row.get("application")?,
            timestamp: parse_ts(row, "timestamp")?,
            duration_seconds: row.get("duration_seconds")?,
            success: row.get("success")?,
        })
    }

    fn row_to_metric(row: &Row) -> rusqlite::Result<SystemMetric> {
        Ok(SystemMetric {
            timestamp: parse_ts(row, "timestamp")?,
            cpu_usage: row.get("cpu_usage")?,
            memory_usage: row.get("memory_usage")?,
            disk_usage: row.get("disk_usage")?,
            active_processes: row.get("active_processes")?,
        })
    }

    /// Count durable rows of both event kinds.
    pub fn count_events(&self) -> Result<TableCounts> {
        let conn = self.conn();
        let actions = conn.query_row("SELECT COUNT(*) FROM actions", [], |r| r.get(0))?;
        let metrics = conn.query_row("SELECT COUNT(*) FROM metrics", [], |r| r.get(0))?;
        Ok(TableCounts { actions, metrics })
    }

    /// Count durable rows of one event kind.
    pub fn count(&self, kind: EventKind) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", kind.table()),
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Delete events older than `before`.
    ///
    /// Both deletes run in one transaction, so a concurrent append either lands
    /// before the trim (and may be removed if old) or after it.
    pub fn trim_retention(&self, before: DateTime<Utc>) -> Result<TrimResult> {
        let cutoff = format_ts(&before);
        let result = self.retry.run("trim_retention", || {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            let actions = tx.execute("DELETE FROM actions WHERE timestamp < ?1", [&cutoff])?;
            let metrics = tx.execute("DELETE FROM metrics WHERE timestamp < ?1", [&cutoff])?;
            tx.commit()?;
            Ok(TrimResult { actions, metrics })
        })?;

        tracing::info!(
            before = %cutoff,
            actions = result.actions,
            metrics = result.metrics,
            "Trimmed retention"
        );
        Ok(result)
    }

    // ============================================
    // Retraining log
    // ============================================

    /// Append a retraining record, keeping only the newest `limit` rows.
    pub fn append_retraining(&self, record: &RetrainingRecord, limit: usize) -> Result<()> {
        let models = serde_json::to_string(
            &record
                .models_trained
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>(),
        )?;
        let started_at = format_ts(&record.started_at);
        let ended_at = format_ts(&record.ended_at);
        let status = record.status.to_string();

        self.retry.run("append_retraining", || {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO retraining_log (run_id, trigger, started_at, ended_at, duration_ms, status, models_trained, message)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    record.run_id,
                    record.trigger.as_str(),
                    started_at,
                    ended_at,
                    record.duration_ms,
                    status,
                    models,
                    record.message,
                ],
            )?;
            tx.execute(
                r#"
                DELETE FROM retraining_log
                WHERE id NOT IN (SELECT id FROM retraining_log ORDER BY id DESC LIMIT ?1)
                "#,
                [limit as i64],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Most recent retraining records, newest first.
    pub fn recent_retraining(&self, limit: usize) -> Result<Vec<RetrainingRecord>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM retraining_log ORDER BY id DESC LIMIT ?1")?;
        let records = stmt
            .query_map([limit as i64], Self::row_to_retraining)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn row_to_retraining(row: &Row) -> rusqlite::Result<RetrainingRecord> {
        let trigger_str: String = row.get("trigger")?;
        let status_str: String = row.get("status")?;
        let models_str: String = row.get("models_trained")?;

        let models: Vec<String> = serde_json::from_str(&models_str).unwrap_or_default();

        Ok(RetrainingRecord {
            run_id: row.get("run_id")?,
            trigger: trigger_str.parse().unwrap_or(Trigger::Manual),
            started_at: parse_ts(row, "started_at")?,
            ended_at: parse_ts(row, "ended_at")?,
            duration_ms: row.get("duration_ms")?,
            status: RetrainStatus::from_storage(&status_str),
            models_trained: models.iter().filter_map(|m| m.parse().ok()).collect(),
            message: row.get("message")?,
        })
    }

    // ============================================
    // Model parameters
    // ============================================

    /// Store (or replace) the parameter set of a model.
    pub fn save_model(
        &self,
        kind: ModelKind,
        params: &str,
        trained_at: DateTime<Utc>,
        sample_count: usize,
    ) -> Result<()> {
        let trained_at = format_ts(&trained_at);
        let digest = digest(params);
        self.retry.run("save_model", || {
            self.conn().execute(
                r#"
                INSERT INTO models (name, params, trained_at, sample_count, digest)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(name) DO UPDATE SET
                    params = excluded.params,
                    trained_at = excluded.trained_at,
                    sample_count = excluded.sample_count,
                    digest = excluded.digest
                "#,
                params![kind.as_str(), params, trained_at, sample_count as i64, digest],
            )?;
            Ok(())
        })
    }

    /// Load a model's parameters, ignoring rows whose digest does not match.
    pub fn load_model(&self, kind: ModelKind) -> Result<Option<StoredModel>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT * FROM models WHERE name = ?1",
                [kind.as_str()],
                |row| {
                    let params: String = row.get("params")?;
                    let stored_digest: String = row.get("digest")?;
                    let sample_count: i64 = row.get("sample_count")?;
                    Ok((params, stored_digest, parse_ts(row, "trained_at")?, sample_count))
                },
            )
            .optional()?;

        let Some((params, stored_digest, trained_at, sample_count)) = row else {
            return Ok(None);
        };

        if digest(&params) != stored_digest {
            tracing::warn!(model = %kind, "Stored model digest mismatch; ignoring parameters");
            return Ok(None);
        }

        Ok(Some(StoredModel {
            kind,
            params,
            trained_at,
            sample_count: sample_count.max(0) as usize,
        }))
    }

    // ============================================
    // Aggregates over the durable action log
    // ============================================

    fn grouped_counts(&self, sql: &str) -> Result<Vec<(String, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Action counts keyed by hour of day (0-23, UTC).
    pub fn action_counts_by_hour(&self) -> Result<Vec<(u32, i64)>> {
        let rows = self.grouped_counts(
            "SELECT strftime('%H', timestamp) AS bucket, COUNT(*) FROM actions GROUP BY bucket ORDER BY bucket",
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|(hour, count)| hour.parse().ok().map(|h| (h, count)))
            .collect())
    }

    /// Action counts keyed by weekday (0 = Monday, UTC).
    pub fn action_counts_by_weekday(&self) -> Result<Vec<(u32, i64)>> {
        // strftime('%w') counts from Sunday = 0
        let rows = self.grouped_counts(
            "SELECT strftime('%w', timestamp) AS bucket, COUNT(*) FROM actions GROUP BY bucket ORDER BY bucket",
        )?;
        let mut days: Vec<(u32, i64)> = rows
            .into_iter()
            .filter_map(|(day, count)| day.parse::<u32>().ok().map(|d| ((d + 6) % 7, count)))
            .collect();
        days.sort_unstable();
        Ok(days)
    }

    /// Action counts keyed by application, most used first.
    pub fn action_counts_by_application(&self) -> Result<Vec<(String, i64)>> {
        self.grouped_counts(
            "SELECT application, COUNT(*) AS n FROM actions GROUP BY application ORDER BY n DESC, application",
        )
    }

    /// Action counts keyed by action type, most frequent first.
    pub fn action_counts_by_type(&self) -> Result<Vec<(String, i64)>> {
        self.grouped_counts(
            "SELECT action_type, COUNT(*) AS n FROM actions GROUP BY action_type ORDER BY n DESC, action_type",
        )
    }

    /// `(action_type, application, count)`, most frequent first.
    pub fn action_pair_counts(&self) -> Result<Vec<(String, String, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT action_type, application, COUNT(*) AS n
            FROM actions
            GROUP BY action_type, application
            ORDER BY n DESC, action_type, application
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// `(hour, action_type, count)` for every hour with activity.
    pub fn hourly_action_type_counts(&self) -> Result<Vec<(u32, String, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT strftime('%H', timestamp) AS hour, action_type, COUNT(*) AS n
            FROM actions
            GROUP BY hour, action_type
            ORDER BY hour, n DESC, action_type
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                let hour: String = row.get(0)?;
                Ok((hour, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(hour, action, count)| hour.parse().ok().map(|h| (h, action, count)))
            .collect())
    }

    /// Share of successful actions, or `None` with no actions recorded.
    pub fn action_success_rate(&self) -> Result<Option<f64>> {
        let conn = self.conn();
        let rate = conn.query_row("SELECT AVG(success) FROM actions", [], |r| {
            r.get::<_, Option<f64>>(0)
        })?;
        Ok(rate)
    }
}

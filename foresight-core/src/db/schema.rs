//! Table definitions for events, retraining records, and model parameters
//!
//! Versioned through `PRAGMA user_version`. Every statement is
//! `IF NOT EXISTS`, so replaying a step is harmless.

use rusqlite::Connection;

pub const SCHEMA_VERSION: i32 = 2;

/// Step `i` brings the schema to version `i + 1`
const MIGRATIONS: &[&str] = &[
    // Version 1: event log and retraining audit
    r#"
    CREATE TABLE IF NOT EXISTS actions (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id       TEXT NOT NULL,
        timestamp        DATETIME NOT NULL,
        action_type      TEXT NOT NULL,
        application      TEXT NOT NULL,
        duration_seconds REAL NOT NULL,
        success          INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS metrics (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id       TEXT NOT NULL,
        timestamp        DATETIME NOT NULL,
        cpu_usage        REAL NOT NULL,
        memory_usage     REAL NOT NULL,
        disk_usage       REAL NOT NULL,
        active_processes INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS retraining_log (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id           TEXT NOT NULL,
        trigger          TEXT NOT NULL,     -- 'scheduled', 'shutdown', 'manual'
        started_at       DATETIME NOT NULL,
        ended_at         DATETIME NOT NULL,
        duration_ms      INTEGER NOT NULL,
        status           TEXT NOT NULL,     -- 'completed', 'failed: <reason>'
        models_trained   JSON NOT NULL,
        message          TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_actions_timestamp ON actions(timestamp);
    CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics(timestamp);
    CREATE INDEX IF NOT EXISTS idx_retraining_started ON retraining_log(started_at);
    "#,
    // Version 2: persisted model parameters
    r#"
    CREATE TABLE IF NOT EXISTS models (
        name             TEXT PRIMARY KEY,  -- 'behavior_prediction', 'system_optimization'
        params           JSON NOT NULL,
        trained_at       DATETIME NOT NULL,
        sample_count     INTEGER NOT NULL,
        digest           TEXT NOT NULL      -- sha256 of params, hex
    );
    "#,
];

/// Apply every migration newer than the stored `user_version`.
///
/// Each step runs in its own transaction together with its version bump.
pub fn migrate(conn: &mut Connection) -> crate::error::Result<()> {
    let from = schema_version(conn)?;
    if from >= SCHEMA_VERSION {
        tracing::debug!(version = from, "Schema up to date");
        return Ok(());
    }

    for (version, sql) in (1i32..).zip(MIGRATIONS.iter()).skip(from.max(0) as usize) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        tracing::info!(version, "Applied schema migration");
    }

    tracing::info!(from, to = SCHEMA_VERSION, "Schema migrated");
    Ok(())
}

/// Version recorded in `PRAGMA user_version`; 0 for a fresh file.
pub fn schema_version(conn: &Connection) -> crate::error::Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

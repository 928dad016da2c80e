//! Durable job queue
//!
//! Minimal SQLite-backed queue used for two things: requesting a
//! reference-data refresh from the backfill worker, and recording
//! incremental sync cycles so monitoring has real depth/throughput numbers.
//! A dedupe key collapses onto an existing waiting or active job.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::storage::SqliteStore;

pub const INCREMENTAL_QUEUE: &str = "telemetry-incremental";
pub const REFERENCE_QUEUE: &str = "reference-data";

pub const INCREMENTAL_SYNC_JOB: &str = "sync-telemetry";
pub const REFERENCE_SYNC_JOB: &str = "sync-reference-data";
pub const REFERENCE_SYNC_DEDUPE_KEY: &str = "reference-data-refresh";

const QUEUE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS queue_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    name TEXT NOT NULL,
    payload TEXT NOT NULL,
    dedupe_key TEXT,
    remove_on_complete INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_jobs_state
    ON queue_jobs(queue, state, id);

CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_jobs_dedupe
    ON queue_jobs(queue, dedupe_key)
    WHERE dedupe_key IS NOT NULL AND state IN ('waiting', 'active');
"#;

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub dedupe_key: Option<String>,
    /// Delete the row instead of keeping it as `completed`.
    pub remove_on_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(i64),
    /// An equivalent job is already waiting or active.
    Deduplicated(i64),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> i64 {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::Deduplicated(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: i64,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
}

pub trait JobQueue: Send + Sync {
    fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: &serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome>;

    fn counts(&self, queue: &str) -> Result<QueueCounts>;

    /// Jobs that reached `completed` at or after `since`.
    fn completed_since(&self, queue: &str, since: DateTime<Utc>) -> Result<u64>;

    /// Oldest waiting job, moved to `active`.
    fn claim_next(&self, queue: &str) -> Result<Option<QueuedJob>>;

    fn complete(&self, job_id: i64) -> Result<()>;

    fn fail(&self, job_id: i64, error: &str) -> Result<()>;
}

pub struct SqliteJobQueue {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobQueue {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        conn.lock().execute_batch(QUEUE_SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Queue tables live next to the telemetry tables.
    pub fn for_store(store: &SqliteStore) -> Result<Self> {
        Self::new(store.shared_connection())
    }
}

impl JobQueue for SqliteJobQueue {
    fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: &serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(key) = &options.dedupe_key {
            let existing: Option<i64> = tx
                .query_row(
                    r#"
                    SELECT id FROM queue_jobs
                    WHERE queue = ?1 AND dedupe_key = ?2 AND state IN ('waiting', 'active')
                    "#,
                    params![queue, key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                debug!(queue, name, dedupe_key = %key, id, "Job already queued");
                return Ok(EnqueueOutcome::Deduplicated(id));
            }
        }

        tx.execute(
            r#"
            INSERT INTO queue_jobs (
                queue, name, payload, dedupe_key, remove_on_complete, state, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'waiting', ?6, ?6)
            "#,
            params![
                queue,
                name,
                payload.to_string(),
                options.dedupe_key,
                options.remove_on_complete,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        info!(queue, name, id, "Job enqueued");
        Ok(EnqueueOutcome::Enqueued(id))
    }

    fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT state, COUNT(*) FROM queue_jobs WHERE queue = ?1 GROUP BY state",
        )?;
        let rows = stmt.query_map(params![queue], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let (state, n) = row?;
            match state.as_str() {
                "waiting" => counts.waiting = n,
                "active" => counts.active = n,
                "completed" => counts.completed = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    fn completed_since(&self, queue: &str, since: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue = ?1 AND state = 'completed' AND updated_at >= ?2",
            params![queue, since.timestamp()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    fn claim_next(&self, queue: &str) -> Result<Option<QueuedJob>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let next = tx
            .query_row(
                r#"
                SELECT id, name, payload FROM queue_jobs
                WHERE queue = ?1 AND state = 'waiting'
                ORDER BY id ASC LIMIT 1
                "#,
                params![queue],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, name, payload)) = next else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE queue_jobs SET state = 'active', updated_at = ?1 WHERE id = ?2",
            params![Utc::now().timestamp(), id],
        )?;
        tx.commit()?;

        Ok(Some(QueuedJob {
            id,
            queue: queue.to_string(),
            name,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        }))
    }

    fn complete(&self, job_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM queue_jobs WHERE id = ?1 AND state = 'active' AND remove_on_complete = 1",
            params![job_id],
        )?;
        if removed > 0 {
            return Ok(());
        }

        let changed = conn.execute(
            "UPDATE queue_jobs SET state = 'completed', updated_at = ?1 WHERE id = ?2 AND state = 'active'",
            params![Utc::now().timestamp(), job_id],
        )?;
        if changed == 0 {
            bail!("queue job {} is not active", job_id);
        }
        Ok(())
    }

    fn fail(&self, job_id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE queue_jobs SET state = 'failed', error = ?1, updated_at = ?2
            WHERE id = ?3 AND state IN ('waiting', 'active')
            "#,
            params![error, Utc::now().timestamp(), job_id],
        )?;
        if changed == 0 {
            bail!("queue job {} is already finished", job_id);
        }
        Ok(())
    }
}

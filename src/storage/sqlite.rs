//! SQLite-backed storage
//!
//! - WAL mode so monitoring reads don't block the writers
//! - `telemetry_events.external_id` UNIQUE: the idempotence anchor for every
//!   ingestion path (incremental, backfill, re-runs)
//! - all timestamps stored as UTC epoch seconds

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    BreakdownRow, Checkpoint, ControlStore, CredentialStore, EventStore, MetricsStore, TimeBucket,
};
use crate::models::{
    AccessCredential, EtlControl, HistoricalLoadControl, JobStatus, ReferenceIds, ReferenceKind,
    TelemetryEvent,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS telemetry_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    event_timestamp INTEGER NOT NULL,
    latitude REAL,
    longitude REAL,
    speed REAL,
    location_description TEXT,
    raw_payload TEXT NOT NULL,
    driver_external_id TEXT,
    vehicle_external_id TEXT,
    event_type_external_id TEXT,
    ingested_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_telemetry_events_ts
    ON telemetry_events(event_timestamp);

CREATE INDEX IF NOT EXISTS idx_telemetry_events_ingested
    ON telemetry_events(ingested_at);

CREATE INDEX IF NOT EXISTS idx_telemetry_events_driver
    ON telemetry_events(driver_external_id, event_timestamp);

CREATE INDEX IF NOT EXISTS idx_telemetry_events_vehicle
    ON telemetry_events(vehicle_external_id, event_timestamp);

CREATE INDEX IF NOT EXISTS idx_telemetry_events_type
    ON telemetry_events(event_type_external_id, event_timestamp);

-- Reference data (owned by the reference-data sync consumer)
CREATE TABLE IF NOT EXISTS drivers (
    external_id TEXT PRIMARY KEY,
    name TEXT,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS vehicles (
    external_id TEXT PRIMARY KEY,
    name TEXT,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS event_types (
    external_id TEXT PRIMARY KEY,
    name TEXT,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS historical_load_control (
    job_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    range_start INTEGER NOT NULL,
    range_end INTEGER NOT NULL,
    cursor INTEGER NOT NULL,
    hours_processed INTEGER NOT NULL DEFAULT 0,
    events_processed INTEGER NOT NULL DEFAULT 0,
    hours_failed INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_historical_load_control_status
    ON historical_load_control(status, updated_at);

CREATE TABLE IF NOT EXISTS etl_control (
    process_name TEXT PRIMARY KEY,
    last_successful_since_token TEXT,
    last_run_timestamp INTEGER
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS api_credential (
    id TEXT PRIMARY KEY,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    expires_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

const JOB_COLUMNS: &str = "job_id, status, range_start, range_end, cursor, hours_processed, \
     events_processed, hours_failed, error_message, created_at, updated_at";

fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<HistoricalLoadControl> {
    let status: String = row.get(1)?;
    let status = status.parse::<JobStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(HistoricalLoadControl {
        job_id: row.get(0)?,
        status,
        range_start: from_ts(row.get(2)?),
        range_end: from_ts(row.get(3)?),
        cursor: from_ts(row.get(4)?),
        hours_processed: row.get::<_, i64>(5)? as u64,
        events_processed: row.get::<_, i64>(6)? as u64,
        hours_failed: row.get::<_, i64>(7)? as u64,
        error_message: row.get(8)?,
        created_at: from_ts(row.get(9)?),
        updated_at: from_ts(row.get(10)?),
    })
}

/// Single-connection SQLite store implementing every storage trait.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `db_path`.
    pub fn open(db_path: &str) -> Result<Self> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let events: i64 = conn
            .query_row("SELECT COUNT(*) FROM telemetry_events", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = %db_path, events, "Telemetry store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Connection handle for collaborators that keep their own tables in
    /// the same database (the job queue).
    pub fn shared_connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

impl EventStore for SqliteStore {
    fn insert_events(&self, events: &[TelemetryEvent]) -> Result<Vec<usize>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let ingested_at = to_ts(Utc::now());
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut inserted = Vec::new();
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT OR IGNORE INTO telemetry_events (
                    external_id, event_timestamp, latitude, longitude, speed,
                    location_description, raw_payload, driver_external_id,
                    vehicle_external_id, event_type_external_id, ingested_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
            )?;

            for (position, event) in events.iter().enumerate() {
                let changed = stmt.execute(params![
                    event.external_id,
                    to_ts(event.event_timestamp),
                    event.latitude,
                    event.longitude,
                    event.speed,
                    event.location_description,
                    event.raw_payload,
                    event.driver_external_id,
                    event.vehicle_external_id,
                    event.event_type_external_id,
                    ingested_at,
                ])?;
                if changed > 0 {
                    inserted.push(position);
                }
            }
        }

        tx.commit().context("Failed to commit event batch")?;
        debug!(
            batch = events.len(),
            inserted = inserted.len(),
            ignored = events.len() - inserted.len(),
            "Stored telemetry batch"
        );
        Ok(inserted)
    }

    fn count_events(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM telemetry_events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn count_events_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM telemetry_events WHERE event_timestamp >= ?1 AND event_timestamp < ?2",
            params![to_ts(from), to_ts(to)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn unknown_references(&self, ids: &ReferenceIds) -> Result<ReferenceIds> {
        let conn = self.conn.lock();
        let mut unknown = ReferenceIds::default();

        let groups = [
            (ReferenceKind::Driver, &ids.drivers, &mut unknown.drivers),
            (ReferenceKind::Vehicle, &ids.vehicles, &mut unknown.vehicles),
            (ReferenceKind::EventType, &ids.event_types, &mut unknown.event_types),
        ];

        for (kind, wanted, missing) in groups {
            if wanted.is_empty() {
                continue;
            }
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE external_id = ?1)",
                kind.table()
            ))?;
            for id in wanted {
                let exists: bool = stmt.query_row(params![id], |row| row.get(0))?;
                if !exists {
                    missing.insert(id.clone());
                }
            }
        }

        Ok(unknown)
    }

    fn upsert_reference(
        &self,
        kind: ReferenceKind,
        external_id: &str,
        name: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                r#"
                INSERT INTO {} (external_id, name, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(external_id) DO UPDATE SET
                    name = COALESCE(excluded.name, name),
                    updated_at = excluded.updated_at
                "#,
                kind.table()
            ),
            params![external_id, name, to_ts(Utc::now())],
        )?;
        Ok(())
    }
}

impl ControlStore for SqliteStore {
    fn create_job(&self, job: &HistoricalLoadControl) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO historical_load_control ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                JOB_COLUMNS
            ),
            params![
                job.job_id,
                job.status.as_str(),
                to_ts(job.range_start),
                to_ts(job.range_end),
                to_ts(job.cursor),
                job.hours_processed as i64,
                job.events_processed as i64,
                job.hours_failed as i64,
                job.error_message,
                to_ts(job.created_at),
                to_ts(job.updated_at),
            ],
        )
        .with_context(|| format!("Failed to create backfill job {}", job.job_id))?;
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> Result<Option<HistoricalLoadControl>> {
        let conn = self.conn.lock();
        let job = conn
            .query_row(
                &format!(
                    "SELECT {} FROM historical_load_control WHERE job_id = ?1",
                    JOB_COLUMNS
                ),
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    fn transition_job(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        if !from.can_transition_to(to) {
            bail!("illegal job transition {} -> {} for {}", from, to, job_id);
        }

        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE historical_load_control
            SET status = ?1,
                error_message = COALESCE(?2, error_message),
                updated_at = ?3
            WHERE job_id = ?4 AND status = ?5
            "#,
            params![
                to.as_str(),
                error_message,
                to_ts(Utc::now()),
                job_id,
                from.as_str()
            ],
        )?;

        if changed == 0 {
            bail!("job {} is not {}, cannot move it to {}", job_id, from, to);
        }
        Ok(())
    }

    fn checkpoint_job(&self, job_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE historical_load_control
            SET cursor = MAX(cursor, ?1),
                hours_processed = ?2,
                events_processed = ?3,
                hours_failed = ?4,
                updated_at = ?5
            WHERE job_id = ?6 AND status = 'running'
            "#,
            params![
                to_ts(checkpoint.cursor),
                checkpoint.hours_processed as i64,
                checkpoint.events_processed as i64,
                checkpoint.hours_failed as i64,
                to_ts(Utc::now()),
                job_id,
            ],
        )?;

        if changed == 0 {
            bail!("cannot checkpoint job {}: not running", job_id);
        }
        Ok(())
    }

    fn recent_jobs(&self, limit: usize) -> Result<Vec<HistoricalLoadControl>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM historical_load_control ORDER BY created_at DESC, job_id LIMIT ?1",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![limit as i64], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn count_jobs(&self, status: JobStatus) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM historical_load_control WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn get_watermark(&self, process_name: &str) -> Result<Option<EtlControl>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                r#"
                SELECT process_name, last_successful_since_token, last_run_timestamp
                FROM etl_control WHERE process_name = ?1
                "#,
                params![process_name],
                |row| {
                    Ok(EtlControl {
                        process_name: row.get(0)?,
                        last_successful_since_token: row.get(1)?,
                        last_run_timestamp: row.get::<_, Option<i64>>(2)?.map(from_ts),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn advance_watermark(
        &self,
        process_name: &str,
        since_token: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO etl_control (process_name, last_successful_since_token, last_run_timestamp)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(process_name) DO UPDATE SET
                last_successful_since_token = excluded.last_successful_since_token,
                last_run_timestamp = excluded.last_run_timestamp
            "#,
            params![process_name, since_token, to_ts(run_at)],
        )?;
        Ok(())
    }

    fn touch_watermark(&self, process_name: &str, run_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO etl_control (process_name, last_successful_since_token, last_run_timestamp)
            VALUES (?1, NULL, ?2)
            ON CONFLICT(process_name) DO UPDATE SET
                last_run_timestamp = excluded.last_run_timestamp
            "#,
            params![process_name, to_ts(run_at)],
        )?;
        Ok(())
    }
}

impl CredentialStore for SqliteStore {
    fn load_credential(&self, id: &str) -> Result<Option<AccessCredential>> {
        let conn = self.conn.lock();
        let credential = conn
            .query_row(
                "SELECT id, access_token, refresh_token, expires_at FROM api_credential WHERE id = ?1",
                params![id],
                |row| {
                    Ok(AccessCredential {
                        id: row.get(0)?,
                        access_token: row.get(1)?,
                        refresh_token: row.get(2)?,
                        expires_at: from_ts(row.get(3)?),
                    })
                },
            )
            .optional()?;
        Ok(credential)
    }

    fn save_credential(&self, credential: &AccessCredential) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO api_credential (id, access_token, refresh_token, expires_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![
                credential.id,
                credential.access_token,
                credential.refresh_token,
                to_ts(credential.expires_at),
                to_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }
}

impl SqliteStore {
    fn bucket_counts(
        &self,
        width_secs: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeBucket>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT (event_timestamp / ?1) * ?1 AS bucket, COUNT(*)
            FROM telemetry_events
            WHERE event_timestamp >= ?2 AND event_timestamp < ?3
            GROUP BY bucket
            ORDER BY bucket ASC
            "#,
        )?;
        let buckets = stmt
            .query_map(params![width_secs, to_ts(from), to_ts(to)], |row| {
                Ok(TimeBucket {
                    bucket_start: from_ts(row.get(0)?),
                    count: row.get::<_, i64>(1)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(buckets)
    }
}

impl MetricsStore for SqliteStore {
    fn events_ingested_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM telemetry_events WHERE ingested_at >= ?1",
            params![to_ts(since)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn hourly_event_counts(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeBucket>> {
        self.bucket_counts(3600, from, to)
    }

    fn daily_event_counts(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeBucket>> {
        self.bucket_counts(86_400, from, to)
    }

    fn top_references(
        &self,
        kind: ReferenceKind,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BreakdownRow>> {
        let column = kind.event_column();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT e.{col}, r.name, COUNT(*) AS n
            FROM telemetry_events e
            LEFT JOIN {table} r ON r.external_id = e.{col}
            WHERE e.{col} IS NOT NULL AND e.event_timestamp >= ?1
            GROUP BY e.{col}
            ORDER BY n DESC, e.{col} ASC
            LIMIT ?2
            "#,
            col = column,
            table = kind.table()
        ))?;

        let rows = stmt
            .query_map(params![to_ts(since), limit as i64], |row| {
                Ok(BreakdownRow {
                    external_id: row.get(0)?,
                    name: row.get(1)?,
                    count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, h, 0, 0).unwrap()
    }

    fn make_event(id: &str, at: DateTime<Utc>) -> TelemetryEvent {
        TelemetryEvent {
            external_id: id.to_string(),
            event_timestamp: at,
            latitude: Some(40.1),
            longitude: Some(-74.2),
            speed: Some(71.0),
            location_description: Some("I-95 N".to_string()),
            raw_payload: format!(r#"{{"id":"{}"}}"#, id),
            driver_external_id: Some("d1".to_string()),
            vehicle_external_id: Some("v1".to_string()),
            event_type_external_id: Some("speeding".to_string()),
        }
    }

    fn make_job(id: &str) -> HistoricalLoadControl {
        HistoricalLoadControl {
            job_id: id.to_string(),
            status: JobStatus::Pending,
            range_start: ts(0),
            range_end: ts(10),
            cursor: ts(0),
            hours_processed: 0,
            events_processed: 0,
            hours_failed: 0,
            error_message: None,
            created_at: ts(0),
            updated_at: ts(0),
        }
    }

    #[test]
    fn test_duplicate_external_id_stored_once() {
        let store = SqliteStore::open_memory().unwrap();

        let first = store
            .insert_events(&[make_event("e1", ts(1)), make_event("e2", ts(1))])
            .unwrap();
        assert_eq!(first, vec![0, 1]);

        // Same ids again, plus one duplicate inside the batch itself.
        let second = store
            .insert_events(&[
                make_event("e1", ts(1)),
                make_event("e3", ts(2)),
                make_event("e3", ts(2)),
            ])
            .unwrap();
        // Only the first e3 is new.
        assert_eq!(second, vec![1]);
        assert_eq!(store.count_events().unwrap(), 3);
    }

    #[test]
    fn test_count_events_between_is_half_open() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .insert_events(&[
                make_event("a", ts(1)),
                make_event("b", ts(2)),
                make_event("c", ts(3)),
            ])
            .unwrap();
        assert_eq!(store.count_events_between(ts(1), ts(3)).unwrap(), 2);
    }

    #[test]
    fn test_job_lifecycle_and_monotonic_cursor() {
        let store = SqliteStore::open_memory().unwrap();
        store.create_job(&make_job("job-1")).unwrap();

        // Checkpoint requires running.
        let cp = Checkpoint {
            cursor: ts(1),
            hours_processed: 1,
            events_processed: 5,
            hours_failed: 0,
        };
        assert!(store.checkpoint_job("job-1", &cp).is_err());

        store
            .transition_job("job-1", JobStatus::Pending, JobStatus::Running, None)
            .unwrap();
        store.checkpoint_job("job-1", &cp).unwrap();
        store
            .checkpoint_job(
                "job-1",
                &Checkpoint {
                    cursor: ts(0),
                    hours_processed: 2,
                    events_processed: 6,
                    hours_failed: 1,
                },
            )
            .unwrap();

        let job = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(job.cursor, ts(1));
        assert_eq!(job.hours_processed, 2);
        assert_eq!(job.hours_failed, 1);

        // Wrong source state is rejected.
        assert!(store
            .transition_job("job-1", JobStatus::Pending, JobStatus::Running, None)
            .is_err());
        // Illegal edge is rejected before touching the row.
        assert!(store
            .transition_job("job-1", JobStatus::Running, JobStatus::Pending, None)
            .is_err());

        store
            .transition_job("job-1", JobStatus::Running, JobStatus::Failed, Some("boom"))
            .unwrap();
        let job = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert_eq!(store.count_jobs(JobStatus::Failed).unwrap(), 1);
        assert_eq!(store.recent_jobs(10).unwrap().len(), 1);
    }

    #[test]
    fn test_watermark_roundtrip() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(store.get_watermark("telemetry").unwrap().is_none());

        store.touch_watermark("telemetry", ts(1)).unwrap();
        let wm = store.get_watermark("telemetry").unwrap().unwrap();
        assert!(wm.last_successful_since_token.is_none());

        store
            .advance_watermark("telemetry", "20240315120000000", ts(2))
            .unwrap();
        store.touch_watermark("telemetry", ts(3)).unwrap();
        let wm = store.get_watermark("telemetry").unwrap().unwrap();
        assert_eq!(
            wm.last_successful_since_token.as_deref(),
            Some("20240315120000000")
        );
        assert_eq!(wm.last_run_timestamp, Some(ts(3)));
    }

    #[test]
    fn test_unknown_references() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .upsert_reference(ReferenceKind::Driver, "d1", Some("Dana"))
            .unwrap();
        store
            .upsert_reference(ReferenceKind::EventType, "speeding", None)
            .unwrap();

        let ids = ReferenceIds::from_events(&[
            make_event("a", ts(1)),
            TelemetryEvent {
                driver_external_id: Some("d2".to_string()),
                ..make_event("b", ts(1))
            },
        ]);
        let unknown = store.unknown_references(&ids).unwrap();
        assert_eq!(unknown.drivers.iter().collect::<Vec<_>>(), vec!["d2"]);
        assert_eq!(unknown.vehicles.iter().collect::<Vec<_>>(), vec!["v1"]);
        assert!(unknown.event_types.is_empty());
    }

    #[test]
    fn test_bucketed_counts_and_top_references() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .upsert_reference(ReferenceKind::Driver, "d2", Some("Sam"))
            .unwrap();
        store
            .insert_events(&[
                make_event("a", ts(1)),
                make_event("b", ts(1) + Duration::minutes(30)),
                make_event("c", ts(3)),
                TelemetryEvent {
                    driver_external_id: Some("d2".to_string()),
                    ..make_event("d", ts(3))
                },
            ])
            .unwrap();

        let hourly = store.hourly_event_counts(ts(0), ts(5)).unwrap();
        assert_eq!(
            hourly,
            vec![
                TimeBucket { bucket_start: ts(1), count: 2 },
                TimeBucket { bucket_start: ts(3), count: 2 },
            ]
        );

        let daily = store.daily_event_counts(ts(0), ts(0) + Duration::days(1)).unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].count, 4);

        let top = store
            .top_references(ReferenceKind::Driver, ts(0), 5)
            .unwrap();
        assert_eq!(top[0].external_id, "d1");
        assert_eq!(top[0].count, 3);
        assert_eq!(top[1].name.as_deref(), Some("Sam"));

        assert_eq!(store.events_ingested_since(ts(0)).unwrap(), 4);
    }

    #[test]
    fn test_credential_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("telemetry.db");
        let path = path.to_str().unwrap();

        let credential = AccessCredential {
            id: "default".to_string(),
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: ts(5),
        };
        {
            let store = SqliteStore::open(path).unwrap();
            store.save_credential(&credential).unwrap();
        }

        let store = SqliteStore::open(path).unwrap();
        assert_eq!(store.load_credential("default").unwrap(), Some(credential));
        assert!(store.load_credential("other").unwrap().is_none());
    }
}

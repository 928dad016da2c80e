//! Storage seams.
//!
//! Each collaborator sees only the narrow trait it needs. `SqliteStore`
//! implements all of them on one connection.

pub mod sqlite;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{
    AccessCredential, EtlControl, HistoricalLoadControl, JobStatus, ReferenceIds, ReferenceKind,
    TelemetryEvent,
};

pub use sqlite::SqliteStore;

/// Append-only telemetry event storage.
pub trait EventStore: Send + Sync {
    /// Insert-or-ignore on `external_id`. Returns the positions in `events`
    /// of the rows that were new.
    fn insert_events(&self, events: &[TelemetryEvent]) -> Result<Vec<usize>>;

    fn count_events(&self) -> Result<u64>;

    /// Events whose `event_timestamp` falls in `[from, to)`.
    fn count_events_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64>;

    /// Subset of `ids` that has no row in the local reference tables.
    fn unknown_references(&self, ids: &ReferenceIds) -> Result<ReferenceIds>;

    fn upsert_reference(
        &self,
        kind: ReferenceKind,
        external_id: &str,
        name: Option<&str>,
    ) -> Result<()>;
}

/// Progress written at each hour boundary of a backfill job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub cursor: DateTime<Utc>,
    pub hours_processed: u64,
    pub events_processed: u64,
    pub hours_failed: u64,
}

/// Job-control and watermark rows.
pub trait ControlStore: Send + Sync {
    fn create_job(&self, job: &HistoricalLoadControl) -> Result<()>;

    fn get_job(&self, job_id: &str) -> Result<Option<HistoricalLoadControl>>;

    /// Move `job_id` from `from` to `to`. Fails if the row is not in `from`
    /// or the edge is not allowed.
    fn transition_job(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// The stored cursor never moves backwards.
    fn checkpoint_job(&self, job_id: &str, checkpoint: &Checkpoint) -> Result<()>;

    fn recent_jobs(&self, limit: usize) -> Result<Vec<HistoricalLoadControl>>;

    fn count_jobs(&self, status: JobStatus) -> Result<u64>;

    fn get_watermark(&self, process_name: &str) -> Result<Option<EtlControl>>;

    fn advance_watermark(
        &self,
        process_name: &str,
        since_token: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Record a run that produced no new token.
    fn touch_watermark(&self, process_name: &str, run_at: DateTime<Utc>) -> Result<()>;
}

/// Persisted OAuth credential, one row per provider account.
pub trait CredentialStore: Send + Sync {
    fn load_credential(&self, id: &str) -> Result<Option<AccessCredential>>;

    fn save_credential(&self, credential: &AccessCredential) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeBucket {
    pub bucket_start: DateTime<Utc>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakdownRow {
    pub external_id: String,
    pub name: Option<String>,
    pub count: u64,
}

/// Read-only aggregate queries for monitoring.
pub trait MetricsStore: Send + Sync {
    /// Rows whose `ingested_at` is at or after `since`.
    fn events_ingested_since(&self, since: DateTime<Utc>) -> Result<u64>;

    /// Non-empty hourly buckets of `event_timestamp` in `[from, to)`.
    fn hourly_event_counts(&self, from: DateTime<Utc>, to: DateTime<Utc>)
        -> Result<Vec<TimeBucket>>;

    /// Non-empty daily (UTC) buckets of `event_timestamp` in `[from, to)`.
    fn daily_event_counts(&self, from: DateTime<Utc>, to: DateTime<Utc>)
        -> Result<Vec<TimeBucket>>;

    /// Most frequent reference ids among events since `since`.
    fn top_references(
        &self,
        kind: ReferenceKind,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BreakdownRow>>;
}

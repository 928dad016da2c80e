//! Historical Telemetry Backfill
//!
//! Walks a job's `[range_start, range_end)` one UTC hour at a time:
//! - fetch the hour window from the provider
//! - dedupe the page by external id, insert-or-ignore into the event store
//! - checkpoint the job row (cursor never moves backwards)
//! - sleep the configured interval before the next hour
//!
//! A failing hour is logged, counted and skipped. Only an authentication
//! failure (no token obtainable) or a storage failure fails the job.
//! Cancellation is observed at hour boundaries; the in-flight hour is always
//! checkpointed first. Failed and cancelled jobs stay where they stopped;
//! `resume_from` starts a new job over the remainder.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::env_or;
use crate::models::{HistoricalLoadControl, JobStatus, ReferenceIds, TelemetryEvent};
use crate::provider::timestamps::floor_hour;
use crate::provider::{ApiError, EventSource};
use crate::queue::{
    EnqueueOptions, EnqueueOutcome, JobQueue, REFERENCE_QUEUE, REFERENCE_SYNC_DEDUPE_KEY,
    REFERENCE_SYNC_JOB,
};
use crate::storage::{Checkpoint, ControlStore, EventStore};

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Pause between hours, keeps the worker under the provider's rate limit.
    pub hour_delay: Duration,
    /// Check collected reference ids every N processed hours.
    pub reference_check_every_hours: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            hour_delay: Duration::from_millis(1000),
            reference_check_every_hours: 10,
        }
    }
}

impl BackfillConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            hour_delay: Duration::from_millis(env_or(
                "BACKFILL_HOUR_DELAY_MS",
                d.hour_delay.as_millis() as u64,
            )),
            reference_check_every_hours: env_or(
                "BACKFILL_REFERENCE_CHECK_HOURS",
                d.reference_check_every_hours,
            )
            .max(1),
        }
    }
}

// =============================================================================
// RESULT
// =============================================================================

/// Summary of one `run` call.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub job_id: String,
    pub status: JobStatus,
    pub cursor: DateTime<Utc>,
    /// Hours handled by this run (a job row may carry more from before).
    pub hours_processed: u64,
    pub hours_failed: u64,
    pub events_fetched: u64,
    pub events_inserted: u64,
    /// Same id twice in one page.
    pub duplicates_in_page: u64,
    pub reference_jobs_enqueued: u64,
    pub duration_secs: f64,
}

impl BackfillReport {
    pub fn format_status(&self) -> String {
        format!(
            "[{}] {} hours ({} failed), {} fetched, {} inserted, {} page dupes",
            self.status,
            self.hours_processed,
            self.hours_failed,
            self.events_fetched,
            self.events_inserted,
            self.duplicates_in_page
        )
    }
}

/// Why an hour could not be stored.
enum HourError {
    /// Skip the hour, keep going.
    Fetch(ApiError),
    /// Fail the job.
    FatalAuth(ApiError),
    Storage(anyhow::Error),
}

struct HourOutcome {
    fetched: u64,
    inserted: u64,
    duplicates_in_page: u64,
    references: ReferenceIds,
}

/// Keep the first occurrence of each external id.
pub fn dedupe_page(events: Vec<TelemetryEvent>) -> (Vec<TelemetryEvent>, u64) {
    let mut seen = HashSet::with_capacity(events.len());
    let total = events.len();
    let unique: Vec<TelemetryEvent> = events
        .into_iter()
        .filter(|e| seen.insert(e.external_id.clone()))
        .collect();
    let dropped = (total - unique.len()) as u64;
    (unique, dropped)
}

// =============================================================================
// WORKER
// =============================================================================

pub struct HistoricalBackfillWorker {
    source: Arc<dyn EventSource>,
    events: Arc<dyn EventStore>,
    control: Arc<dyn ControlStore>,
    queue: Arc<dyn JobQueue>,
    config: BackfillConfig,
}

impl HistoricalBackfillWorker {
    pub fn new(
        source: Arc<dyn EventSource>,
        events: Arc<dyn EventStore>,
        control: Arc<dyn ControlStore>,
        queue: Arc<dyn JobQueue>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            source,
            events,
            control,
            queue,
            config,
        }
    }

    /// Persist a pending job over `[start, end)`, both floored to the hour.
    pub fn create_job(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HistoricalLoadControl> {
        let range_start = floor_hour(start);
        let range_end = floor_hour(end);
        if range_start >= range_end {
            bail!(
                "backfill range is empty after hour truncation: {} .. {}",
                range_start,
                range_end
            );
        }

        let now = Utc::now();
        let job = HistoricalLoadControl {
            job_id: uuid::Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            range_start,
            range_end,
            cursor: range_start,
            hours_processed: 0,
            events_processed: 0,
            hours_failed: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.control.create_job(&job)?;

        info!(
            job_id = %job.job_id,
            start = %range_start,
            end = %range_end,
            hours = job.total_hours(),
            "Backfill job created"
        );
        Ok(job)
    }

    /// New pending job covering what a failed or cancelled job left undone.
    pub fn resume_from(&self, job_id: &str) -> Result<HistoricalLoadControl> {
        let job = self
            .control
            .get_job(job_id)?
            .with_context(|| format!("backfill job {} not found", job_id))?;

        match job.status {
            JobStatus::Failed | JobStatus::Cancelled => {}
            other => bail!("job {} is {}; only failed or cancelled jobs can be resumed", job_id, other),
        }
        if job.cursor >= job.range_end {
            bail!("job {} has no hours left to process", job_id);
        }

        info!(job_id, cursor = %job.cursor, "Resuming backfill as a new job");
        self.create_job(job.cursor, job.range_end)
    }

    /// Run a pending job until it completes, fails, or `cancel` fires.
    pub async fn run(&self, job_id: &str, cancel: &CancellationToken) -> Result<BackfillReport> {
        let job = self
            .control
            .get_job(job_id)?
            .with_context(|| format!("backfill job {} not found", job_id))?;
        if job.status != JobStatus::Pending {
            bail!("job {} is {}, expected pending", job_id, job.status);
        }
        self.control
            .transition_job(job_id, JobStatus::Pending, JobStatus::Running, None)?;

        let started = Instant::now();
        info!(
            job_id,
            start = %job.range_start,
            end = %job.range_end,
            hours = job.total_hours(),
            "Backfill started"
        );

        let mut checkpoint = Checkpoint {
            cursor: job.cursor,
            hours_processed: job.hours_processed,
            events_processed: job.events_processed,
            hours_failed: job.hours_failed,
        };
        let mut report = BackfillReport {
            job_id: job_id.to_string(),
            status: JobStatus::Running,
            cursor: job.cursor,
            hours_processed: 0,
            hours_failed: 0,
            events_fetched: 0,
            events_inserted: 0,
            duplicates_in_page: 0,
            reference_jobs_enqueued: 0,
            duration_secs: 0.0,
        };
        let mut pending_refs = ReferenceIds::default();
        let mut hours_since_check = 0u64;

        while checkpoint.cursor < job.range_end {
            if cancel.is_cancelled() {
                if let Err(e) = self.control.transition_job(
                    job_id,
                    JobStatus::Running,
                    JobStatus::Cancelled,
                    None,
                ) {
                    let message = format!("could not record cancellation: {:#}", e);
                    return Err(self.fail_job(job_id, &message, e));
                }
                info!(job_id, cursor = %checkpoint.cursor, "Backfill cancelled");
                report.status = JobStatus::Cancelled;
                break;
            }

            let hour_start = checkpoint.cursor;
            let hour_end = (hour_start + chrono::Duration::hours(1)).min(job.range_end);

            match self.process_hour(hour_start, hour_end).await {
                Ok(outcome) => {
                    checkpoint.events_processed += outcome.inserted;
                    report.events_fetched += outcome.fetched;
                    report.events_inserted += outcome.inserted;
                    report.duplicates_in_page += outcome.duplicates_in_page;
                    pending_refs.merge(outcome.references);
                }
                Err(HourError::Fetch(e)) => {
                    warn!(job_id, hour = %hour_start, error = %e, "Hour fetch failed, skipping");
                    metrics::increment_counter!("backfill_hours_failed_total");
                    checkpoint.hours_failed += 1;
                    report.hours_failed += 1;
                }
                Err(HourError::FatalAuth(e)) => {
                    let message = format!("authentication failed at {}: {}", hour_start, e);
                    return Err(self.fail_job(job_id, &message, e.into()));
                }
                Err(HourError::Storage(e)) => {
                    let message = format!("storage failed at {}: {:#}", hour_start, e);
                    return Err(self.fail_job(job_id, &message, e));
                }
            }

            checkpoint.cursor = hour_end;
            checkpoint.hours_processed += 1;
            report.hours_processed += 1;
            report.cursor = hour_end;
            if let Err(e) = self.control.checkpoint_job(job_id, &checkpoint) {
                let message = format!("checkpoint failed at {}: {:#}", hour_start, e);
                return Err(self.fail_job(job_id, &message, e));
            }
            metrics::increment_counter!("backfill_hours_processed_total");

            hours_since_check += 1;
            if hours_since_check >= self.config.reference_check_every_hours {
                hours_since_check = 0;
                if self.check_references(&mut pending_refs) {
                    report.reference_jobs_enqueued += 1;
                }
            }

            if checkpoint.hours_processed % 24 == 0 {
                let total = job.total_hours();
                info!(
                    job_id,
                    cursor = %checkpoint.cursor,
                    hours = checkpoint.hours_processed,
                    total,
                    events = checkpoint.events_processed,
                    "Backfill progress"
                );
            }

            if checkpoint.cursor < job.range_end && !self.config.hour_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.hour_delay) => {}
                }
            }
        }

        if report.status == JobStatus::Running {
            if self.check_references(&mut pending_refs) {
                report.reference_jobs_enqueued += 1;
            }
            if let Err(e) = self.control.transition_job(
                job_id,
                JobStatus::Running,
                JobStatus::Completed,
                None,
            ) {
                let message = format!("could not record completion: {:#}", e);
                return Err(self.fail_job(job_id, &message, e));
            }
            report.status = JobStatus::Completed;
        }

        report.duration_secs = started.elapsed().as_secs_f64();
        info!(job_id, "Backfill finished: {}", report.format_status());
        Ok(report)
    }

    async fn process_hour(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> std::result::Result<HourOutcome, HourError> {
        let started = Instant::now();

        let page = match self.source.fetch_historical(from, to).await {
            Ok(page) => page,
            Err(e) if e.is_fatal_auth() => return Err(HourError::FatalAuth(e)),
            Err(e) => return Err(HourError::Fetch(e)),
        };

        let fetched = page.len() as u64;
        let (unique, duplicates_in_page) = dedupe_page(page);
        let new_rows = self
            .events
            .insert_events(&unique)
            .map_err(HourError::Storage)?;
        let references = ReferenceIds::from_events(new_rows.iter().map(|&i| &unique[i]));
        let inserted = new_rows.len() as u64;

        metrics::counter!("backfill_events_inserted_total", inserted);
        metrics::histogram!("backfill_hour_seconds", started.elapsed().as_secs_f64());
        debug!(
            hour = %from,
            fetched,
            inserted,
            duplicates_in_page,
            "Hour stored"
        );

        Ok(HourOutcome {
            fetched,
            inserted,
            duplicates_in_page,
            references,
        })
    }

    /// Enqueue one reference refresh if any collected id is unknown locally.
    /// Returns true when a new queue job was created.
    fn check_references(&self, pending: &mut ReferenceIds) -> bool {
        if pending.is_empty() {
            return false;
        }
        let checked = std::mem::take(pending);

        let unknown = match self.events.unknown_references(&checked) {
            Ok(unknown) => unknown,
            Err(e) => {
                warn!(error = %e, "Reference lookup failed, skipping check");
                return false;
            }
        };
        if unknown.is_empty() {
            return false;
        }

        let payload = serde_json::json!({
            "reason": "unknown_references",
            "drivers": unknown.drivers,
            "vehicles": unknown.vehicles,
            "event_types": unknown.event_types,
        });
        let options = EnqueueOptions {
            dedupe_key: Some(REFERENCE_SYNC_DEDUPE_KEY.to_string()),
            remove_on_complete: true,
        };

        match self
            .queue
            .enqueue(REFERENCE_QUEUE, REFERENCE_SYNC_JOB, &payload, options)
        {
            Ok(EnqueueOutcome::Enqueued(id)) => {
                info!(queue_job = id, unknown = unknown.len(), "Reference data refresh requested");
                true
            }
            Ok(EnqueueOutcome::Deduplicated(id)) => {
                debug!(queue_job = id, "Reference data refresh already pending");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to enqueue reference data refresh");
                false
            }
        }
    }

    fn fail_job(&self, job_id: &str, message: &str, cause: anyhow::Error) -> anyhow::Error {
        error!(job_id, error = %message, "Backfill job failed");
        if let Err(e) =
            self.control
                .transition_job(job_id, JobStatus::Running, JobStatus::Failed, Some(message))
        {
            error!(job_id, error = %e, "Failed to mark backfill job failed");
        }
        cause.context(format!("backfill job {} failed", job_id))
    }
}

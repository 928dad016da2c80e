//! Ingestion status for operators
//!
//! Read-only aggregation over the watermark, event volume, credential
//! health, queue counters and recent backfill jobs. Nothing is cached;
//! every call queries the stores.

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{JobStatus, ReferenceKind};
use crate::provider::timestamps::floor_hour;
use crate::provider::{SinceTokenAge, TokenManager};
use crate::queue::{JobQueue, QueueCounts, INCREMENTAL_QUEUE, REFERENCE_QUEUE};
use crate::storage::{BreakdownRow, ControlStore, MetricsStore, TimeBucket};

const RECENT_JOBS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Running,
    Error,
    Idle,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatermarkStatus {
    pub process_name: String,
    pub since_token: Option<String>,
    pub last_run: Option<DateTime<Utc>>,
    /// Seconds since `last_run`.
    pub last_run_age_seconds: Option<i64>,
    pub token_age: Option<SinceTokenAge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeStatus {
    /// Events whose timestamp is today (UTC).
    pub events_today: u64,
    /// Rows written today, by ingestion time.
    pub ingested_today: u64,
    pub ingested_per_hour: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub present: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub seconds_until_expiry: Option<i64>,
    pub expired: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue: String,
    #[serde(flatten)]
    pub counts: QueueCounts,
    pub completed_last_hour: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillJobStatus {
    pub job_id: String,
    pub status: JobStatus,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub cursor: DateTime<Utc>,
    pub progress_pct: f64,
    pub hours_processed: u64,
    pub hours_failed: u64,
    pub events_processed: u64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionSummary {
    pub generated_at: DateTime<Utc>,
    pub status: OverallStatus,
    pub watermark: WatermarkStatus,
    pub volume: VolumeStatus,
    pub credential: CredentialStatus,
    pub queues: Vec<QueueStatus>,
    pub backfill_jobs: Vec<BackfillJobStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Breakdown {
    pub since: DateTime<Utc>,
    pub event_types: Vec<BreakdownRow>,
    pub drivers: Vec<BreakdownRow>,
    pub vehicles: Vec<BreakdownRow>,
}

pub struct IngestionStatusService {
    control: Arc<dyn ControlStore>,
    metrics: Arc<dyn MetricsStore>,
    queue: Arc<dyn JobQueue>,
    tokens: Arc<TokenManager>,
    process_name: String,
}

impl IngestionStatusService {
    pub fn new(
        control: Arc<dyn ControlStore>,
        metrics: Arc<dyn MetricsStore>,
        queue: Arc<dyn JobQueue>,
        tokens: Arc<TokenManager>,
        process_name: impl Into<String>,
    ) -> Self {
        Self {
            control,
            metrics,
            queue,
            tokens,
            process_name: process_name.into(),
        }
    }

    pub fn summary(&self) -> Result<IngestionSummary> {
        self.summary_at(Utc::now())
    }

    pub fn summary_at(&self, now: DateTime<Utc>) -> Result<IngestionSummary> {
        let watermark = self.watermark_status(now)?;
        let volume = self.volume_status(now)?;
        let credential = self.credential_status(now);

        let queues = [INCREMENTAL_QUEUE, REFERENCE_QUEUE]
            .iter()
            .map(|queue| {
                Ok(QueueStatus {
                    queue: queue.to_string(),
                    counts: self.queue.counts(queue)?,
                    completed_last_hour: self
                        .queue
                        .completed_since(queue, now - Duration::hours(1))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let backfill_jobs: Vec<BackfillJobStatus> = self
            .control
            .recent_jobs(RECENT_JOBS)?
            .into_iter()
            .map(|job| BackfillJobStatus {
                progress_pct: job.progress_pct(),
                job_id: job.job_id,
                status: job.status,
                range_start: job.range_start,
                range_end: job.range_end,
                cursor: job.cursor,
                hours_processed: job.hours_processed,
                hours_failed: job.hours_failed,
                events_processed: job.events_processed,
                error_message: job.error_message,
            })
            .collect();

        let status = overall_status(&queues, &backfill_jobs);

        Ok(IngestionSummary {
            generated_at: now,
            status,
            watermark,
            volume,
            credential,
            queues,
            backfill_jobs,
        })
    }

    fn watermark_status(&self, now: DateTime<Utc>) -> Result<WatermarkStatus> {
        let row = self.control.get_watermark(&self.process_name)?;
        let since_token = row.as_ref().and_then(|r| r.last_successful_since_token.clone());
        let last_run = row.as_ref().and_then(|r| r.last_run_timestamp);

        Ok(WatermarkStatus {
            process_name: self.process_name.clone(),
            token_age: since_token
                .as_deref()
                .and_then(|t| SinceTokenAge::compute(t, now)),
            since_token,
            last_run,
            last_run_age_seconds: last_run.map(|t| (now - t).num_seconds()),
        })
    }

    fn volume_status(&self, now: DateTime<Utc>) -> Result<VolumeStatus> {
        let midnight = start_of_day(now);
        let events_today: u64 = self
            .metrics
            .daily_event_counts(midnight, midnight + Duration::days(1))?
            .iter()
            .map(|b| b.count)
            .sum();
        let ingested_today = self.metrics.events_ingested_since(midnight)?;

        let hours_elapsed = ((now - midnight).num_seconds() as f64 / 3600.0).max(1.0);
        Ok(VolumeStatus {
            events_today,
            ingested_today,
            ingested_per_hour: ingested_today as f64 / hours_elapsed,
        })
    }

    fn credential_status(&self, now: DateTime<Utc>) -> CredentialStatus {
        match self.tokens.credential_snapshot() {
            Some(cred) => CredentialStatus {
                present: true,
                expires_at: Some(cred.expires_at),
                seconds_until_expiry: Some(cred.seconds_until_expiry(now)),
                expired: cred.expires_at <= now,
            },
            None => CredentialStatus {
                present: false,
                expires_at: None,
                seconds_until_expiry: None,
                expired: true,
            },
        }
    }

    /// Event counts for the last 24 hours, one bucket per hour, oldest first.
    pub fn hourly_metrics(&self, now: DateTime<Utc>) -> Result<Vec<TimeBucket>> {
        let end = floor_hour(now) + Duration::hours(1);
        let start = end - Duration::hours(24);
        let buckets = self.metrics.hourly_event_counts(start, end)?;
        Ok(zero_fill(buckets, start, Duration::hours(1), 24))
    }

    /// Event counts for the last `days` UTC days including today.
    pub fn daily_metrics(&self, now: DateTime<Utc>, days: u32) -> Result<Vec<TimeBucket>> {
        let days = days.max(1);
        let end = start_of_day(now) + Duration::days(1);
        let start = end - Duration::days(days as i64);
        let buckets = self.metrics.daily_event_counts(start, end)?;
        Ok(zero_fill(buckets, start, Duration::days(1), days as usize))
    }

    /// Top `limit` event types, drivers and vehicles over the trailing window.
    pub fn breakdown(&self, now: DateTime<Utc>, window_days: u32, limit: usize) -> Result<Breakdown> {
        let since = now - Duration::days(window_days.max(1) as i64);
        Ok(Breakdown {
            since,
            event_types: self.metrics.top_references(ReferenceKind::EventType, since, limit)?,
            drivers: self.metrics.top_references(ReferenceKind::Driver, since, limit)?,
            vehicles: self.metrics.top_references(ReferenceKind::Vehicle, since, limit)?,
        })
    }
}

fn start_of_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(ts)
}

fn zero_fill(
    buckets: Vec<TimeBucket>,
    start: DateTime<Utc>,
    step: Duration,
    n: usize,
) -> Vec<TimeBucket> {
    let counts: HashMap<DateTime<Utc>, u64> = buckets
        .into_iter()
        .map(|b| (b.bucket_start, b.count))
        .collect();

    (0..n)
        .map(|i| {
            let bucket_start = start + step * i as i32;
            TimeBucket {
                bucket_start,
                count: counts.get(&bucket_start).copied().unwrap_or(0),
            }
        })
        .collect()
}

/// Running beats error beats idle.
fn overall_status(queues: &[QueueStatus], jobs: &[BackfillJobStatus]) -> OverallStatus {
    let running = queues.iter().any(|q| q.counts.active > 0)
        || jobs.iter().any(|j| j.status == JobStatus::Running);
    if running {
        return OverallStatus::Running;
    }

    let latest_job_failed = jobs
        .first()
        .map(|j| j.status == JobStatus::Failed)
        .unwrap_or(false);
    if queues.iter().any(|q| q.counts.failed > 0) || latest_job_failed {
        return OverallStatus::Error;
    }

    OverallStatus::Idle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccessCredential, HistoricalLoadControl, TelemetryEvent};
    use crate::provider::{ApiError, AuthProvider, TokenConfig, TokenResponse};
    use crate::queue::{EnqueueOptions, SqliteJobQueue};
    use crate::storage::{CredentialStore, EventStore, SqliteStore};
    use async_trait::async_trait;

    struct NoAuth;

    #[async_trait]
    impl AuthProvider for NoAuth {
        async fn password_grant(&self) -> std::result::Result<TokenResponse, ApiError> {
            Err(ApiError::Authentication("offline".into()))
        }

        async fn refresh_grant(&self, _: &str) -> std::result::Result<TokenResponse, ApiError> {
            Err(ApiError::Authentication("offline".into()))
        }
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        queue: Arc<SqliteJobQueue>,
        service: IngestionStatusService,
    }

    fn fixture(with_credential: bool) -> Fixture {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        if with_credential {
            store
                .save_credential(&AccessCredential {
                    id: "default".to_string(),
                    access_token: "t".to_string(),
                    refresh_token: None,
                    expires_at: Utc::now() + Duration::hours(2),
                })
                .unwrap();
        }
        let queue = Arc::new(SqliteJobQueue::for_store(&store).unwrap());
        let tokens = Arc::new(
            TokenManager::new(TokenConfig::default(), Arc::new(NoAuth), store.clone()).unwrap(),
        );
        let service = IngestionStatusService::new(
            store.clone(),
            store.clone(),
            queue.clone(),
            tokens,
            "telemetry-events",
        );
        Fixture {
            store,
            queue,
            service,
        }
    }

    fn event(id: &str, at: DateTime<Utc>, event_type: &str, driver: &str) -> TelemetryEvent {
        TelemetryEvent {
            external_id: id.to_string(),
            event_timestamp: at,
            latitude: None,
            longitude: None,
            speed: None,
            location_description: None,
            raw_payload: "{}".to_string(),
            driver_external_id: Some(driver.to_string()),
            vehicle_external_id: None,
            event_type_external_id: Some(event_type.to_string()),
        }
    }

    #[test]
    fn test_hourly_metrics_zero_filled() {
        let f = fixture(true);
        let now = Utc::now();
        f.store
            .insert_events(&[
                event("a", now, "speeding", "d1"),
                event("b", now - Duration::hours(2), "speeding", "d1"),
                event("c", now - Duration::hours(2), "harsh_brake", "d2"),
                event("old", now - Duration::hours(30), "speeding", "d1"),
            ])
            .unwrap();

        let hourly = f.service.hourly_metrics(now).unwrap();
        assert_eq!(hourly.len(), 24);
        assert_eq!(hourly[23].bucket_start, floor_hour(now));
        assert_eq!(hourly[23].count, 1);
        assert_eq!(hourly[21].count, 2);
        assert_eq!(hourly.iter().map(|b| b.count).sum::<u64>(), 3);
    }

    #[test]
    fn test_daily_metrics_and_breakdown() {
        let f = fixture(true);
        let now = Utc::now();
        f.store
            .insert_events(&[
                event("a", now, "speeding", "d1"),
                event("b", now - Duration::days(2), "speeding", "d2"),
                event("c", now - Duration::days(2), "harsh_brake", "d2"),
                event("d", now - Duration::days(10), "speeding", "d3"),
            ])
            .unwrap();

        let daily = f.service.daily_metrics(now, 7).unwrap();
        assert_eq!(daily.len(), 7);
        assert_eq!(daily[6].bucket_start, start_of_day(now));
        assert_eq!(daily[6].count, 1);
        assert_eq!(daily[4].count, 2);

        let breakdown = f.service.breakdown(now, 7, 5).unwrap();
        assert_eq!(breakdown.event_types[0].external_id, "speeding");
        assert_eq!(breakdown.event_types[0].count, 2);
        assert_eq!(breakdown.drivers[0].external_id, "d2");
        assert!(breakdown.drivers.iter().all(|r| r.external_id != "d3"));
        assert!(breakdown.vehicles.is_empty());
    }

    #[test]
    fn test_summary_reports_token_and_watermark() {
        let f = fixture(true);
        let now = Utc.with_ymd_and_hms(2024, 3, 17, 0, 0, 0).unwrap();
        f.store
            .advance_watermark("telemetry-events", "20240315120000000", now - Duration::minutes(5))
            .unwrap();

        let summary = f.service.summary_at(now).unwrap();
        assert_eq!(summary.status, OverallStatus::Idle);
        assert_eq!(summary.watermark.last_run_age_seconds, Some(300));
        let age = summary.watermark.token_age.unwrap();
        assert!((age.days_until_expiry - 5.5).abs() < 1e-9);
        assert!(summary.credential.present);
        assert_eq!(summary.queues.len(), 2);
        assert!(summary.backfill_jobs.is_empty());
    }

    #[test]
    fn test_overall_status_precedence() {
        let f = fixture(false);
        let summary = f.service.summary().unwrap();
        assert_eq!(summary.status, OverallStatus::Idle);
        assert!(!summary.credential.present);
        assert!(summary.credential.expired);

        let failed = f
            .queue
            .enqueue(INCREMENTAL_QUEUE, "sync-telemetry", &serde_json::json!({}), EnqueueOptions::default())
            .unwrap();
        f.queue.claim_next(INCREMENTAL_QUEUE).unwrap();
        f.queue.fail(failed.job_id(), "boom").unwrap();
        assert_eq!(f.service.summary().unwrap().status, OverallStatus::Error);

        let now = Utc::now();
        f.store
            .create_job(&HistoricalLoadControl {
                job_id: "job-1".to_string(),
                status: JobStatus::Pending,
                range_start: now - Duration::hours(4),
                range_end: now,
                cursor: now - Duration::hours(4),
                hours_processed: 0,
                events_processed: 0,
                hours_failed: 0,
                error_message: None,
                created_at: now,
                updated_at: now,
            })
            .unwrap();
        f.store
            .transition_job("job-1", JobStatus::Pending, JobStatus::Running, None)
            .unwrap();

        let summary = f.service.summary().unwrap();
        assert_eq!(summary.status, OverallStatus::Running);
        assert_eq!(summary.backfill_jobs[0].job_id, "job-1");
        assert_eq!(summary.backfill_jobs[0].progress_pct, 0.0);
    }
}

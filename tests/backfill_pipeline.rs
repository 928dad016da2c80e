//! End-to-end: backfill into an on-disk store, then read it back through the
//! status service, the way the CLI does.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use telemetry_ingest::ingest::{BackfillConfig, HistoricalBackfillWorker};
use telemetry_ingest::models::{AccessCredential, JobStatus, TelemetryEvent};
use telemetry_ingest::provider::events::parse_event_page;
use telemetry_ingest::provider::{
    ApiError, AuthProvider, EventSource, IncrementalBatch, TokenConfig, TokenManager,
    TokenResponse,
};
use telemetry_ingest::queue::{JobQueue, SqliteJobQueue, REFERENCE_QUEUE};
use telemetry_ingest::status::{IngestionStatusService, OverallStatus};
use telemetry_ingest::storage::{ControlStore, CredentialStore, EventStore, SqliteStore};

/// Serves canned provider JSON: three events per hour, hour 13 empty,
/// hour 4 failing with a 500 after retries.
struct ProviderReplay {
    start: DateTime<Utc>,
}

#[async_trait]
impl EventSource for ProviderReplay {
    async fn fetch_incremental(&self, _: Option<&str>) -> Result<IncrementalBatch, ApiError> {
        Ok(IncrementalBatch::default())
    }

    async fn fetch_historical(
        &self,
        from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<TelemetryEvent>, ApiError> {
        let hour = (from - self.start).num_hours();
        match hour {
            13 => return Ok(Vec::new()),
            4 => {
                return Err(ApiError::Exhausted {
                    attempts: 3,
                    last: Box::new(ApiError::Status {
                        status: 500,
                        body: "internal error".into(),
                    }),
                })
            }
            _ => {}
        }

        let ts = from.format("%Y-%m-%dT%H:%M:%SZ");
        // The last record repeats the first one within the page.
        let body = format!(
            r#"[
                {{"id": "{h}-1", "eventTimestamp": "{ts}", "driverId": "D1", "vehicleId": 7, "eventType": "speeding", "speed": 81.5}},
                {{"id": "{h}-2", "eventTimestamp": "{ts}", "driverId": "D2", "vehicleId": 7, "eventType": "harsh_brake"}},
                {{"id": "{h}-3", "eventTimestamp": "{ts}", "driverId": "D1", "vehicleId": 8, "eventType": "speeding"}},
                {{"id": "{h}-1", "eventTimestamp": "{ts}", "driverId": "D1", "vehicleId": 7, "eventType": "speeding", "speed": 81.5}}
            ]"#,
            h = hour,
            ts = ts
        );
        parse_event_page(&body)
    }
}

struct Offline;

#[async_trait]
impl AuthProvider for Offline {
    async fn password_grant(&self) -> Result<TokenResponse, ApiError> {
        Err(ApiError::Authentication("offline".into()))
    }

    async fn refresh_grant(&self, _: &str) -> Result<TokenResponse, ApiError> {
        Err(ApiError::Authentication("offline".into()))
    }
}

#[tokio::test]
async fn backfill_then_status() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("telemetry.db");
    let store = Arc::new(SqliteStore::open(db_path.to_str().unwrap()).unwrap());
    let queue = Arc::new(SqliteJobQueue::for_store(&store).unwrap());

    store
        .save_credential(&AccessCredential {
            id: "default".to_string(),
            access_token: "cached".to_string(),
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
        .unwrap();

    let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    let worker = HistoricalBackfillWorker::new(
        Arc::new(ProviderReplay { start }),
        store.clone(),
        store.clone(),
        queue.clone(),
        BackfillConfig {
            hour_delay: Duration::ZERO,
            reference_check_every_hours: 10,
        },
    );

    let job = worker
        .create_job(start, start + chrono::Duration::hours(25))
        .unwrap();
    let report = worker
        .run(&job.job_id, &CancellationToken::new())
        .await
        .unwrap();

    // 25 hours, one empty, one failed: 23 hours x 3 unique events.
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.hours_processed, 25);
    assert_eq!(report.hours_failed, 1);
    assert_eq!(report.events_inserted, 69);
    assert_eq!(report.duplicates_in_page, 23);
    assert_eq!(store.count_events().unwrap(), 69);

    // Unknown drivers/vehicles/types: one refresh request despite three checks.
    assert_eq!(queue.counts(REFERENCE_QUEUE).unwrap().waiting, 1);

    // Re-running the same range stores nothing new.
    let rerun = worker
        .create_job(start, start + chrono::Duration::hours(25))
        .unwrap();
    let report = worker
        .run(&rerun.job_id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.events_inserted, 0);
    assert_eq!(store.count_events().unwrap(), 69);

    let tokens = Arc::new(
        TokenManager::new(TokenConfig::default(), Arc::new(Offline), store.clone()).unwrap(),
    );
    let status = IngestionStatusService::new(
        store.clone(),
        store.clone(),
        queue.clone(),
        tokens.clone(),
        "telemetry-events",
    );

    let summary = status.summary().unwrap();
    assert_eq!(summary.status, OverallStatus::Idle);
    assert!(summary.credential.present);
    assert!(!summary.credential.expired);
    assert_eq!(summary.volume.ingested_today, 69);
    assert_eq!(summary.backfill_jobs.len(), 2);
    assert!(summary
        .backfill_jobs
        .iter()
        .all(|j| j.status == JobStatus::Completed && j.progress_pct == 100.0));

    let breakdown = status
        .breakdown(start + chrono::Duration::days(1), 7, 3)
        .unwrap();
    assert_eq!(breakdown.event_types[0].external_id, "speeding");
    assert_eq!(breakdown.event_types[0].count, 46);
    assert_eq!(breakdown.drivers[0].external_id, "D1");
    assert_eq!(breakdown.vehicles[0].external_id, "7");

    // The cached credential was served without touching the provider.
    assert_eq!(tokens.get_access_token().await.unwrap(), "cached");

    let row = store.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(row.cursor, start + chrono::Duration::hours(25));
    assert_eq!(row.events_processed, 69);
}

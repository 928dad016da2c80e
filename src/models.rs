use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// OAuth2 credential for one provider account.
///
/// Only the token manager writes this; everything else reads snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCredential {
    pub id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl AccessCredential {
    /// True when the token stays valid for at least `margin` past `now`.
    pub fn is_valid_for(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        now + margin < self.expires_at
    }

    pub fn seconds_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }
}

/// A single normalized telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub external_id: String,
    pub event_timestamp: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed: Option<f64>,
    pub location_description: Option<String>,
    /// Raw provider JSON (lossless)
    pub raw_payload: String,
    pub driver_external_id: Option<String>,
    pub vehicle_external_id: Option<String>,
    pub event_type_external_id: Option<String>,
}

/// Reference ids (drivers, vehicles, event types) seen on a set of events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceIds {
    pub drivers: BTreeSet<String>,
    pub vehicles: BTreeSet<String>,
    pub event_types: BTreeSet<String>,
}

impl ReferenceIds {
    pub fn record(&mut self, event: &TelemetryEvent) {
        if let Some(id) = &event.driver_external_id {
            self.drivers.insert(id.clone());
        }
        if let Some(id) = &event.vehicle_external_id {
            self.vehicles.insert(id.clone());
        }
        if let Some(id) = &event.event_type_external_id {
            self.event_types.insert(id.clone());
        }
    }

    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a TelemetryEvent>) -> Self {
        let mut ids = Self::default();
        for event in events {
            ids.record(event);
        }
        ids
    }

    pub fn merge(&mut self, other: ReferenceIds) {
        self.drivers.extend(other.drivers);
        self.vehicles.extend(other.vehicles);
        self.event_types.extend(other.event_types);
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty() && self.vehicles.is_empty() && self.event_types.is_empty()
    }

    pub fn len(&self) -> usize {
        self.drivers.len() + self.vehicles.len() + self.event_types.len()
    }
}

/// Reference table kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Driver,
    Vehicle,
    EventType,
}

impl ReferenceKind {
    pub fn table(&self) -> &'static str {
        match self {
            ReferenceKind::Driver => "drivers",
            ReferenceKind::Vehicle => "vehicles",
            ReferenceKind::EventType => "event_types",
        }
    }

    /// Column on `telemetry_events` that references this table.
    pub fn event_column(&self) -> &'static str {
        match self {
            ReferenceKind::Driver => "driver_external_id",
            ReferenceKind::Vehicle => "vehicle_external_id",
            ReferenceKind::EventType => "event_type_external_id",
        }
    }
}

/// Lifecycle of a historical backfill job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Allowed edges: pending -> running -> {completed, failed, cancelled}.
    /// A pending job may also fail (e.g. no token at startup).
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Failed) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (Pending, _) | (Running, _) => false,
            (Completed, _) | (Failed, _) | (Cancelled, _) => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown job status: {}", other)),
        }
    }
}

/// Control row for one historical backfill job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalLoadControl {
    pub job_id: String,
    pub status: JobStatus,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    /// Start of the next unprocessed hour.
    pub cursor: DateTime<Utc>,
    pub hours_processed: u64,
    pub events_processed: u64,
    pub hours_failed: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HistoricalLoadControl {
    pub fn total_hours(&self) -> u64 {
        (self.range_end - self.range_start).num_hours().max(0) as u64
    }

    pub fn progress_pct(&self) -> f64 {
        let total = self.total_hours();
        if total == 0 {
            return 100.0;
        }
        (self.hours_processed as f64 / total as f64 * 100.0).min(100.0)
    }
}

/// Watermark for a named incremental process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtlControl {
    pub process_name: String,
    pub last_successful_since_token: Option<String>,
    pub last_run_timestamp: Option<DateTime<Utc>>,
}

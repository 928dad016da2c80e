//! Raw provider JSON -> `TelemetryEvent`.
//!
//! The provider is not consistent about field casing or id types across
//! endpoints, so lookups try a list of aliases and accept numbers or
//! strings. Records without an id or a parseable timestamp are dropped.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::warn;

use super::error::ApiError;
use crate::models::TelemetryEvent;

const ID_KEYS: &[&str] = &["id", "externalId", "external_id", "eventId", "event_id"];
const TIMESTAMP_KEYS: &[&str] = &[
    "eventTimestamp",
    "event_timestamp",
    "timestamp",
    "eventTime",
    "dateTime",
];
const LATITUDE_KEYS: &[&str] = &["latitude", "lat"];
const LONGITUDE_KEYS: &[&str] = &["longitude", "lon", "lng"];
const SPEED_KEYS: &[&str] = &["speed", "speedKph", "speed_kph"];
const LOCATION_KEYS: &[&str] = &[
    "locationDescription",
    "location_description",
    "location",
    "address",
];
const DRIVER_KEYS: &[&str] = &["driverId", "driver_id", "driverExternalId", "driver"];
const VEHICLE_KEYS: &[&str] = &["vehicleId", "vehicle_id", "vehicleExternalId", "vehicle"];
const EVENT_TYPE_KEYS: &[&str] = &[
    "eventTypeId",
    "event_type_id",
    "eventTypeExternalId",
    "eventType",
    "event_type",
];

/// Decode a page body (JSON array) into events.
///
/// An empty body is an empty page.
pub fn parse_event_page(body: &str) -> Result<Vec<TelemetryEvent>, ApiError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let records = match serde_json::from_str::<Value>(body)? {
        Value::Array(records) => records,
        Value::Null => Vec::new(),
        other => {
            return Err(ApiError::Decode(format!(
                "expected a JSON array of events, got {}",
                json_kind(&other)
            )))
        }
    };

    let total = records.len();
    let events: Vec<TelemetryEvent> = records.iter().filter_map(normalize_event).collect();

    let dropped = total - events.len();
    if dropped > 0 {
        warn!(dropped, total, "Dropped provider records without id or timestamp");
        metrics::counter!("provider_events_dropped_total", dropped as u64);
    }

    Ok(events)
}

pub fn normalize_event(record: &Value) -> Option<TelemetryEvent> {
    let obj = record.as_object()?;
    let lookup = |keys: &[&str]| {
        keys.iter()
            .filter_map(|k| obj.get(*k))
            .find(|v| !v.is_null())
    };

    let external_id = lookup(ID_KEYS).and_then(id_string)?;
    let event_timestamp = lookup(TIMESTAMP_KEYS).and_then(parse_timestamp)?;

    Some(TelemetryEvent {
        external_id,
        event_timestamp,
        latitude: lookup(LATITUDE_KEYS).and_then(number),
        longitude: lookup(LONGITUDE_KEYS).and_then(number),
        speed: lookup(SPEED_KEYS).and_then(number),
        location_description: lookup(LOCATION_KEYS).and_then(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Object(o) => o
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }),
        raw_payload: record.to_string(),
        driver_external_id: lookup(DRIVER_KEYS).and_then(id_string),
        vehicle_external_id: lookup(VEHICLE_KEYS).and_then(id_string),
        event_type_external_id: lookup(EVENT_TYPE_KEYS).and_then(id_string),
    })
}

/// Ids come as strings, numbers, or `{ "id": .. }` objects.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Object(o) => o.get("id").and_then(id_string),
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    // Provider local format has no offset and is UTC.
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

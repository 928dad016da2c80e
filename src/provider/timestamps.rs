//! Provider timestamp conventions.
//!
//! Historical endpoints take `yyyyMMddHHmmss` UTC path segments, and
//! since-tokens carry the same 14 digits as a prefix. The prefix is only
//! used for monitoring (token age / expiry estimates).

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::Serialize;

const PATH_FORMAT: &str = "%Y%m%d%H%M%S";

/// Since-tokens are accepted by the provider for this long after issue.
pub const SINCE_TOKEN_LIFETIME_DAYS: f64 = 7.0;

pub fn format_path_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(PATH_FORMAT).to_string()
}

pub fn parse_path_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, PATH_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Decode the `YYYYMMDDHHMMSS` prefix of a since-token.
pub fn since_token_issued_at(token: &str) -> Option<DateTime<Utc>> {
    let prefix = token.get(..14)?;
    if !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    parse_path_timestamp(prefix)
}

/// Truncate to the start of the containing UTC hour.
pub fn floor_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

#[derive(Debug, Clone, Serialize)]
pub struct SinceTokenAge {
    pub issued_at: DateTime<Utc>,
    pub age_seconds: i64,
    pub age_hours: f64,
    pub days_until_expiry: f64,
}

impl SinceTokenAge {
    pub fn compute(token: &str, now: DateTime<Utc>) -> Option<Self> {
        let issued_at = since_token_issued_at(token)?;
        let age: Duration = now - issued_at;
        let age_hours = age.num_seconds() as f64 / 3600.0;
        Some(Self {
            issued_at,
            age_seconds: age.num_seconds(),
            age_hours,
            days_until_expiry: SINCE_TOKEN_LIFETIME_DAYS - age_hours / 24.0,
        })
    }

    pub fn is_expired(&self) -> bool {
        self.days_until_expiry <= 0.0
    }
}

//! Incremental (continuation-token) sync.
//!
//! One cycle reads the process watermark, pulls pages while the provider
//! reports more, and advances the watermark after each page is stored. A
//! page that fails to store leaves the watermark where it was, so the next
//! cycle asks for the same page again.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backfill::dedupe_page;
use crate::config::{env_or, env_string};
use crate::provider::EventSource;
use crate::storage::{ControlStore, EventStore};

#[derive(Debug, Clone)]
pub struct IncrementalConfig {
    /// `etl_control.process_name` for the watermark row.
    pub process_name: String,
    pub max_pages_per_run: u32,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            process_name: "telemetry-events".to_string(),
            max_pages_per_run: 50,
        }
    }
}

impl IncrementalConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            process_name: env_string("INCREMENTAL_PROCESS_NAME").unwrap_or(d.process_name),
            max_pages_per_run: env_or("INCREMENTAL_MAX_PAGES", d.max_pages_per_run).max(1),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub pages: u32,
    pub events_fetched: u64,
    pub events_inserted: u64,
    /// Watermark after the cycle.
    pub since_token: Option<String>,
    /// The page limit was hit while the provider still had items.
    pub has_more: bool,
}

pub struct IncrementalSync {
    source: Arc<dyn EventSource>,
    events: Arc<dyn EventStore>,
    control: Arc<dyn ControlStore>,
    config: IncrementalConfig,
}

impl IncrementalSync {
    pub fn new(
        source: Arc<dyn EventSource>,
        events: Arc<dyn EventStore>,
        control: Arc<dyn ControlStore>,
        config: IncrementalConfig,
    ) -> Self {
        Self {
            source,
            events,
            control,
            config,
        }
    }

    pub fn process_name(&self) -> &str {
        &self.config.process_name
    }

    pub async fn run_once(&self) -> Result<SyncReport> {
        let process = self.config.process_name.as_str();
        let mut token = self
            .control
            .get_watermark(process)?
            .and_then(|w| w.last_successful_since_token);
        let mut report = SyncReport {
            since_token: token.clone(),
            ..Default::default()
        };

        loop {
            if report.pages >= self.config.max_pages_per_run {
                info!(process, pages = report.pages, "Page limit reached, continuing next cycle");
                break;
            }

            let batch = self
                .source
                .fetch_incremental(token.as_deref())
                .await
                .with_context(|| format!("incremental fetch failed for {}", process))?;
            report.pages += 1;
            report.events_fetched += batch.events.len() as u64;

            let (unique, _) = dedupe_page(batch.events);
            let inserted = self
                .events
                .insert_events(&unique)
                .context("failed to store incremental page; watermark not advanced")?
                .len();
            report.events_inserted += inserted as u64;
            metrics::counter!("incremental_events_inserted_total", inserted as u64);

            let now = Utc::now();
            match batch.next_token {
                Some(next) if token.as_deref() != Some(next.as_str()) => {
                    self.control.advance_watermark(process, &next, now)?;
                    debug!(process, since_token = %next, inserted, "Watermark advanced");
                    token = Some(next);
                    report.since_token = token.clone();
                }
                Some(_) | None => {
                    self.control.touch_watermark(process, now)?;
                    if batch.has_more {
                        warn!(process, "Provider reported more items without a new token");
                    }
                    report.has_more = false;
                    break;
                }
            }

            report.has_more = batch.has_more;
            if !batch.has_more {
                break;
            }
        }

        info!(
            process,
            pages = report.pages,
            fetched = report.events_fetched,
            inserted = report.events_inserted,
            has_more = report.has_more,
            "Incremental sync cycle done"
        );
        Ok(report)
    }
}

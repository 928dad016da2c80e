//! Fleet telemetry ingestion
//!
//! Pulls telematics events from the provider API into SQLite through two
//! paths (incremental feed and hour-by-hour historical backfill) and exposes
//! a read-only status view for operators.

pub mod config;
pub mod context;
pub mod ingest;
pub mod models;
pub mod provider;
pub mod queue;
pub mod status;
pub mod storage;

pub use config::IngestConfig;
pub use context::IngestContext;

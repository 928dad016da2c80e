//! Ingestion workers.

pub mod backfill;
pub mod incremental;

pub use backfill::{BackfillConfig, BackfillReport, HistoricalBackfillWorker};
pub use incremental::{IncrementalConfig, IncrementalSync, SyncReport};

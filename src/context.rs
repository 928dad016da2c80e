//! Explicit service wiring.
//!
//! Everything shares one SQLite connection; the provider client shares one
//! token manager so refreshes stay single-flight across workers.

use anyhow::Result;
use std::sync::Arc;

use crate::config::IngestConfig;
use crate::ingest::{HistoricalBackfillWorker, IncrementalSync};
use crate::provider::{HttpAuthProvider, ProviderClient, RetryExecutor, TokenManager};
use crate::queue::SqliteJobQueue;
use crate::status::IngestionStatusService;
use crate::storage::SqliteStore;

pub struct IngestContext {
    pub config: IngestConfig,
    pub store: Arc<SqliteStore>,
    pub queue: Arc<SqliteJobQueue>,
    pub tokens: Arc<TokenManager>,
    pub client: Arc<ProviderClient>,
}

impl IngestContext {
    pub fn build(config: IngestConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.database_path)?);
        let queue = Arc::new(SqliteJobQueue::for_store(&store)?);

        let auth = Arc::new(HttpAuthProvider::new(&config.provider)?);
        let tokens = Arc::new(TokenManager::new(
            config.token.clone(),
            auth,
            store.clone(),
        )?);
        let client = Arc::new(ProviderClient::new(
            config.provider.clone(),
            tokens.clone(),
            RetryExecutor::new(config.retry.clone()),
        )?);

        Ok(Self {
            config,
            store,
            queue,
            tokens,
            client,
        })
    }

    pub fn backfill_worker(&self) -> HistoricalBackfillWorker {
        HistoricalBackfillWorker::new(
            self.client.clone(),
            self.store.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.config.backfill.clone(),
        )
    }

    pub fn incremental_sync(&self) -> IncrementalSync {
        IncrementalSync::new(
            self.client.clone(),
            self.store.clone(),
            self.store.clone(),
            self.config.incremental.clone(),
        )
    }

    pub fn status_service(&self) -> IngestionStatusService {
        IngestionStatusService::new(
            self.store.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.tokens.clone(),
            self.config.incremental.process_name.clone(),
        )
    }
}

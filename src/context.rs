//! Explicitly constructed pipeline context.
//!
//! Every component receives its collaborators from a [`PipelineContext`]
//! rather than reaching for globals. [`PipelineContext::open`] builds the
//! production wiring (SQLite queue and index over the configured database);
//! tests swap collaborators with the `with_*` builders.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::capture::ChangeCapture;
use crate::config::Config;
use crate::db;
use crate::extract::ExtractorSet;
use crate::extraction::{ExtractionStore, ExtractionWorker};
use crate::index::{SearchIndex, SqliteIndex};
use crate::indexer::Indexer;
use crate::ledger::Ledger;
use crate::locks::KeyedLocks;
use crate::migrate;
use crate::queue::{SqliteQueue, TaskQueue};
use crate::reconciler::Reconciler;
use crate::relay::Relay;
use crate::resolve::{DefaultResolver, SourceResolver};
use crate::workers::Workers;

#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub locks: KeyedLocks,
    pub queue: Arc<dyn TaskQueue>,
    pub index: Arc<dyn SearchIndex>,
    pub resolver: Arc<dyn SourceResolver>,
    pub extractors: Arc<ExtractorSet>,
}

impl PipelineContext {
    /// Connect, migrate and wire the SQLite-backed collaborators.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::migrate_pool(&pool).await?;
        let queue: Arc<dyn TaskQueue> = Arc::new(SqliteQueue::new(pool.clone(), &config.queue));
        let index: Arc<dyn SearchIndex> = Arc::new(SqliteIndex::new(pool.clone()));
        let resolver: Arc<dyn SourceResolver> = Arc::new(DefaultResolver::new(&config.extraction)?);
        Ok(Self {
            config: Arc::new(config),
            pool,
            locks: KeyedLocks::new(),
            queue,
            index,
            resolver,
            extractors: Arc::new(ExtractorSet::builtin()),
        })
    }

    pub fn with_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_index(mut self, index: Arc<dyn SearchIndex>) -> Self {
        self.index = index;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SourceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_extractors(mut self, extractors: ExtractorSet) -> Self {
        self.extractors = Arc::new(extractors);
        self
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::new(self.pool.clone())
    }

    pub fn extraction_store(&self) -> ExtractionStore {
        ExtractionStore::new(self.pool.clone())
    }

    pub fn capture(&self) -> ChangeCapture {
        ChangeCapture::new(self.pool.clone(), self.locks.clone())
    }

    pub fn relay(&self) -> Relay {
        Relay::new(self.pool.clone(), self.queue.clone(), self.config.relay.batch_size)
    }

    pub fn extraction_worker(&self) -> ExtractionWorker {
        ExtractionWorker::new(
            self.ledger(),
            self.extraction_store(),
            self.resolver.clone(),
            self.extractors.clone(),
            self.config.extraction.timeout(),
        )
    }

    pub fn indexer(&self) -> Indexer {
        Indexer::new(
            self.ledger(),
            self.extraction_store(),
            self.index.clone(),
            self.locks.clone(),
            self.config.indexer.timeout(),
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.ledger(),
            self.extraction_store(),
            self.index.clone(),
            self.queue.clone(),
            self.config.reconciler.batch_size,
        )
    }

    pub fn workers(&self) -> Workers {
        Workers::new(
            self.queue.clone(),
            Arc::new(self.extraction_worker()),
            Arc::new(self.indexer()),
            self.config.workers.clone(),
            self.config.queue.clone(),
        )
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

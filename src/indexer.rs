//! Indexer: applies `index` and `retract` work items to the search index.
//!
//! The version comparison here is what makes at-least-once, unordered
//! delivery safe. For one content identifier:
//!
//! - `index` v applies only if v is greater than the indexed version;
//!   otherwise the item is stale and discarded.
//! - `retract` v applies only if the indexed version is at most v; it leaves
//!   a tombstone at v so an older `index` arriving later is also stale.
//!
//! The read-compare-write runs under the identifier's lock, and the index
//! write is itself a conditional upsert, so two indexers for the same
//! identifier in different processes also converge on the higher version.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{PipelineError, PipelineResult};
use crate::extraction::ExtractionStore;
use crate::index::{suggest_inputs, ApplyOutcome, SearchIndex};
use crate::ledger::Ledger;
use crate::locks::KeyedLocks;
use crate::models::{
    ExtractionResult, IndexDocument, IndexedVersion, Operation, VersionEvent, WorkItem, WorkKind,
};
use crate::workers::Handler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Applied,
    Stale { indexed: i64 },
    /// No extraction result exists for this exact version yet.
    AwaitingExtraction,
}

pub struct Indexer {
    ledger: Ledger,
    extractions: ExtractionStore,
    index: Arc<dyn SearchIndex>,
    locks: KeyedLocks,
    timeout: Duration,
}

impl Indexer {
    pub fn new(
        ledger: Ledger,
        extractions: ExtractionStore,
        index: Arc<dyn SearchIndex>,
        locks: KeyedLocks,
        timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            extractions,
            index,
            locks,
            timeout,
        }
    }

    #[tracing::instrument(skip_all, fields(item = %item.id, content_id = %item.content_id, version = item.version))]
    pub async fn apply_index(&self, item: &WorkItem) -> PipelineResult<IndexOutcome> {
        let event = self.load_event(item).await?;
        if event.operation == Operation::Delete {
            return Err(PipelineError::invariant(format!(
                "index requested for delete event {} of {}",
                event.id, event.content_id
            )));
        }

        let _guard = self.locks.lock(&lock_key(&item.content_id)).await;

        if let Some(current) = self.indexed_version(&item.content_id).await? {
            if item.version <= current.version {
                return Ok(self.discard(item, current.version));
            }
        }

        let Some(extraction) = self.extractions.get(&item.content_id, item.version).await? else {
            tracing::info!(
                content_id = %item.content_id,
                version = item.version,
                "no extraction result for this version, re-driving extraction"
            );
            return Ok(IndexOutcome::AwaitingExtraction);
        };

        let doc = build_document(&event, &extraction);
        match self.bounded(self.index.upsert(&doc)).await? {
            ApplyOutcome::Applied => {
                tracing::info!(
                    content_id = %item.content_id,
                    version = item.version,
                    status = extraction.status.as_str(),
                    "indexed"
                );
                Ok(IndexOutcome::Applied)
            }
            ApplyOutcome::Stale { indexed } => Ok(self.discard(item, indexed)),
        }
    }

    #[tracing::instrument(skip_all, fields(item = %item.id, content_id = %item.content_id, version = item.version))]
    pub async fn apply_retract(&self, item: &WorkItem) -> PipelineResult<IndexOutcome> {
        let event = self.load_event(item).await?;
        if event.operation != Operation::Delete {
            return Err(PipelineError::invariant(format!(
                "retract requested for {} event {} of {}",
                event.operation.as_str(),
                event.id,
                event.content_id
            )));
        }

        let _guard = self.locks.lock(&lock_key(&item.content_id)).await;

        if let Some(current) = self.indexed_version(&item.content_id).await? {
            if current.version > item.version {
                return Ok(self.discard(item, current.version));
            }
        }

        match self
            .bounded(self.index.retract(&item.content_id, item.version))
            .await?
        {
            ApplyOutcome::Applied => {
                tracing::info!(content_id = %item.content_id, version = item.version, "retracted");
                Ok(IndexOutcome::Applied)
            }
            ApplyOutcome::Stale { indexed } => Ok(self.discard(item, indexed)),
        }
    }

    /// Indexed version, checked against the ledger head. An index that is
    /// ahead of the ledger cannot be explained by reordering.
    async fn indexed_version(&self, content_id: &str) -> PipelineResult<Option<IndexedVersion>> {
        let current = self.bounded(self.index.get_version(content_id)).await?;
        if let Some(current) = current {
            let head = self.ledger.head(content_id).await?.map(|e| e.version).unwrap_or(0);
            if current.version > head {
                return Err(PipelineError::invariant(format!(
                    "index holds {} v{} but ledger head is v{}",
                    content_id, current.version, head
                )));
            }
        }
        Ok(current)
    }

    async fn load_event(&self, item: &WorkItem) -> PipelineResult<VersionEvent> {
        let event = self.ledger.event_by_id(&item.event_id).await?.ok_or_else(|| {
            PipelineError::invariant(format!(
                "work item {} references missing ledger event {}",
                item.id, item.event_id
            ))
        })?;
        if event.content_id != item.content_id || event.version != item.version {
            return Err(PipelineError::invariant(format!(
                "work item {} is for {} v{} but event {} is {} v{}",
                item.id, item.content_id, item.version, event.id, event.content_id, event.version
            )));
        }
        Ok(event)
    }

    fn discard(&self, item: &WorkItem, indexed: i64) -> IndexOutcome {
        tracing::debug!(
            content_id = %item.content_id,
            version = item.version,
            indexed,
            kind = %item.kind,
            "stale work item discarded"
        );
        IndexOutcome::Stale { indexed }
    }

    async fn bounded<T>(&self, call: impl Future<Output = PipelineResult<T>>) -> PipelineResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(self.timeout)),
        }
    }
}

fn lock_key(content_id: &str) -> String {
    format!("index:{}", content_id)
}

/// Project a ledger event and its extraction result into an index document.
pub fn build_document(event: &VersionEvent, extraction: &ExtractionResult) -> IndexDocument {
    let payload = &event.payload;
    let captions: Vec<&str> = extraction
        .metadata
        .get("captions")
        .and_then(|c| c.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|c| c.get("line").and_then(|l| l.as_str()))
                .collect()
        })
        .unwrap_or_default();

    IndexDocument {
        content_id: event.content_id.clone(),
        version: event.version,
        kind: payload.kind,
        title: payload.title.clone(),
        description: payload.description.clone(),
        body: extraction.text.clone(),
        metadata: json!({
            "source_ref": payload.source_ref,
            "content_hash": extraction.content_hash,
            "extraction": extraction.metadata,
            "extraction_error": extraction.error,
        }),
        suggest: suggest_inputs(&payload.title, payload.description.as_deref(), &captions),
        extraction_status: extraction.status,
        retracted: false,
        indexed_at: chrono::Utc::now().timestamp_millis(),
    }
}

#[async_trait]
impl Handler for Indexer {
    async fn handle(&self, item: &WorkItem) -> PipelineResult<Option<WorkItem>> {
        let outcome = match item.kind {
            WorkKind::Index => self.apply_index(item).await?,
            WorkKind::Retract => self.apply_retract(item).await?,
            WorkKind::Extract => {
                return Err(PipelineError::invariant(format!(
                    "indexer received extract item {}",
                    item.id
                )))
            }
        };
        match outcome {
            IndexOutcome::Applied => Ok(None),
            IndexOutcome::AwaitingExtraction => Ok(Some(item.follow_up(WorkKind::Extract))),
            IndexOutcome::Stale { indexed } => Err(PipelineError::Stale {
                content_id: item.content_id.clone(),
                version: item.version,
                indexed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ChangeCapture, ContentPatch, NewContent};
    use crate::error::ErrorClass;
    use crate::index::InMemoryIndex;
    use crate::models::{ContentKind, ExtractionStatus};
    use sqlx::SqlitePool;
    use tempfile::TempDir;

    struct Setup {
        _tmp: TempDir,
        capture: ChangeCapture,
        store: ExtractionStore,
        index: Arc<InMemoryIndex>,
        indexer: Indexer,
    }

    async fn setup() -> Setup {
        let tmp = TempDir::new().unwrap();
        let pool: SqlitePool = crate::db::connect_path(&tmp.path().join("ix.sqlite"), 4)
            .await
            .unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        let store = ExtractionStore::new(pool.clone());
        let index = Arc::new(InMemoryIndex::new());
        let indexer = Indexer::new(
            Ledger::new(pool.clone()),
            store.clone(),
            index.clone(),
            KeyedLocks::new(),
            Duration::from_secs(5),
        );
        Setup {
            _tmp: tmp,
            capture: ChangeCapture::new(pool, KeyedLocks::new()),
            store,
            index,
            indexer,
        }
    }

    async fn extracted(store: &ExtractionStore, ev: &VersionEvent, text: &str) {
        store
            .upsert(&ExtractionResult {
                content_id: ev.content_id.clone(),
                version: ev.version,
                status: ExtractionStatus::Success,
                text: text.into(),
                metadata: json!({}),
                content_hash: crate::extraction::content_hash(text),
                error: None,
                extracted_at: 0,
            })
            .await
            .unwrap();
    }

    fn new_doc(id: &str) -> NewContent {
        NewContent {
            id: Some(id.into()),
            kind: ContentKind::Document,
            source_ref: "inline:v1".into(),
            title: "Genetics".into(),
            description: Some("Mendel's peas".into()),
        }
    }

    fn retitle(title: &str) -> ContentPatch {
        ContentPatch {
            title: Some(title.into()),
            ..ContentPatch::default()
        }
    }

    #[tokio::test]
    async fn out_of_order_delivery_keeps_the_newer_version() {
        let s = setup().await;
        let v1 = s.capture.create(new_doc("a")).await.unwrap();
        let v2 = s.capture.update("a", retitle("Genetics II")).await.unwrap();
        extracted(&s.store, &v1, "one").await;
        extracted(&s.store, &v2, "two").await;

        let i2 = WorkItem::for_event(WorkKind::Index, &v2);
        let i1 = WorkItem::for_event(WorkKind::Index, &v1);
        assert_eq!(s.indexer.apply_index(&i2).await.unwrap(), IndexOutcome::Applied);
        assert_eq!(
            s.indexer.apply_index(&i1).await.unwrap(),
            IndexOutcome::Stale { indexed: 2 }
        );
        // Redelivery of the applied item is a no-op.
        assert_eq!(
            s.indexer.apply_index(&i2).await.unwrap(),
            IndexOutcome::Stale { indexed: 2 }
        );

        let doc = s.index.get("a").await.unwrap().unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.title, "Genetics II");
        assert_eq!(doc.body, "two");
        assert!(doc.suggest.contains(&"Mendel's peas".to_string()));
    }

    #[tokio::test]
    async fn delete_wins_over_older_updates_in_either_order() {
        for delete_first in [true, false] {
            let s = setup().await;
            let _v1 = s.capture.create(new_doc("a")).await.unwrap();
            let v2 = s.capture.update("a", retitle("B")).await.unwrap();
            let v3 = s.capture.soft_delete("a").await.unwrap();
            extracted(&s.store, &v2, "two").await;

            let index2 = WorkItem::for_event(WorkKind::Index, &v2);
            let retract3 = WorkItem::for_event(WorkKind::Retract, &v3);
            if delete_first {
                s.indexer.handle(&retract3).await.unwrap();
                let err = s.indexer.handle(&index2).await.unwrap_err();
                assert_eq!(err.class(), ErrorClass::StaleWorkItem);
            } else {
                s.indexer.handle(&index2).await.unwrap();
                s.indexer.handle(&retract3).await.unwrap();
            }

            assert!(s.index.get("a").await.unwrap().is_none());
            assert_eq!(
                s.index.get_version("a").await.unwrap(),
                Some(IndexedVersion { version: 3, retracted: true })
            );
        }
    }

    #[tokio::test]
    async fn missing_extraction_redrives_extract() {
        let s = setup().await;
        let v1 = s.capture.create(new_doc("a")).await.unwrap();
        let item = WorkItem::for_event(WorkKind::Index, &v1);

        let follow_up = s.indexer.handle(&item).await.unwrap().unwrap();
        assert_eq!(follow_up.kind, WorkKind::Extract);
        assert_eq!(follow_up.event_id, v1.id);
        assert!(s.index.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mismatched_operations_are_invariant_violations() {
        let s = setup().await;
        let v1 = s.capture.create(new_doc("a")).await.unwrap();
        let retract = WorkItem::for_event(WorkKind::Retract, &v1);
        let err = s.indexer.handle(&retract).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvariantViolation);

        let ghost = WorkItem::new(WorkKind::Index, "a", 7, "missing-event");
        let err = s.indexer.handle(&ghost).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvariantViolation);
    }

    #[tokio::test]
    async fn index_ahead_of_ledger_is_flagged() {
        let s = setup().await;
        let v1 = s.capture.create(new_doc("a")).await.unwrap();
        extracted(&s.store, &v1, "one").await;
        let mut rogue = build_document(&v1, &s.store.get("a", 1).await.unwrap().unwrap());
        rogue.version = 9;
        s.index.upsert(&rogue).await.unwrap();

        let err = s
            .indexer
            .apply_index(&WorkItem::for_event(WorkKind::Index, &v1))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvariantViolation);
    }
}

//! Periodic ledger-vs-index comparison.
//!
//! Lost work items (a relay crash, a purged dead letter, an operator mistake)
//! leave the index behind the ledger forever unless something looks. The
//! reconciler walks every ledger head and re-drives the pipeline where the
//! index disagrees. It never writes to the index itself; every repair goes
//! through the queue and the indexer's version guard.
//!
//! Orphans (index entries with no ledger history) and regressions (index
//! ahead of the ledger) are reported, not repaired.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::error::{PipelineError, PipelineResult};
use crate::extraction::ExtractionStore;
use crate::index::SearchIndex;
use crate::ledger::Ledger;
use crate::models::{IndexedVersion, Operation, VersionEvent, WorkItem, WorkKind};
use crate::queue::TaskQueue;
use crate::workers::shutdown_requested;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Ledger heads examined.
    pub scanned: u64,
    /// Index or extract items enqueued for heads the index is missing or behind on.
    pub reindexed: u64,
    /// Retract items enqueued for deleted content still live in the index.
    pub retracted: u64,
    /// Divergent identifiers left alone because work for the head version is
    /// already queued.
    pub in_flight: u64,
    pub orphans: u64,
    pub regressions: u64,
    /// Repairs not enqueued because the queue was at its depth bound.
    pub skipped_full: u64,
}

impl ReconcileReport {
    pub fn repairs(&self) -> u64 {
        self.reindexed + self.retracted
    }
}

enum Drift {
    InSync,
    Behind(WorkKind),
    Regression { indexed: i64 },
}

pub struct Reconciler {
    ledger: Ledger,
    extractions: ExtractionStore,
    index: Arc<dyn SearchIndex>,
    queue: Arc<dyn TaskQueue>,
    batch_size: usize,
}

impl Reconciler {
    pub fn new(
        ledger: Ledger,
        extractions: ExtractionStore,
        index: Arc<dyn SearchIndex>,
        queue: Arc<dyn TaskQueue>,
        batch_size: usize,
    ) -> Self {
        Self {
            ledger,
            extractions,
            index,
            queue,
            batch_size: batch_size.max(1),
        }
    }

    /// One full pass over the ledger and the index.
    pub async fn reconcile_once(&self) -> PipelineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let mut after: Option<String> = None;
        loop {
            let heads = self.ledger.heads(after.as_deref(), self.batch_size).await?;
            let Some(last) = heads.last() else { break };
            after = Some(last.content_id.clone());

            for head in &heads {
                report.scanned += 1;
                self.check_head(head, &mut report).await?;
            }
            if heads.len() < self.batch_size {
                break;
            }
        }

        self.count_orphans(&mut report).await?;

        if report.repairs() > 0 || report.orphans > 0 || report.regressions > 0 {
            tracing::info!(
                scanned = report.scanned,
                reindexed = report.reindexed,
                retracted = report.retracted,
                in_flight = report.in_flight,
                orphans = report.orphans,
                regressions = report.regressions,
                skipped_full = report.skipped_full,
                "reconciliation found drift"
            );
        } else {
            tracing::debug!(scanned = report.scanned, "index in sync with ledger");
        }
        Ok(report)
    }

    async fn check_head(&self, head: &VersionEvent, report: &mut ReconcileReport) -> PipelineResult<()> {
        let indexed = self.index.get_version(&head.content_id).await?;
        let kind = match drift(head, indexed) {
            Drift::InSync => return Ok(()),
            Drift::Regression { indexed } => {
                report.regressions += 1;
                tracing::error!(
                    content_id = %head.content_id,
                    ledger_version = head.version,
                    indexed_version = indexed,
                    "index is ahead of the ledger"
                );
                return Ok(());
            }
            Drift::Behind(WorkKind::Retract) => WorkKind::Retract,
            Drift::Behind(_) => {
                if self.extractions.get(&head.content_id, head.version).await?.is_some() {
                    WorkKind::Index
                } else {
                    WorkKind::Extract
                }
            }
        };

        // Only work for the head version counts as in flight. A pending item
        // for an older version would index stale content, not repair drift.
        if self.queue.has_active_at(&head.content_id, head.version).await? {
            report.in_flight += 1;
            return Ok(());
        }

        match self.queue.enqueue(WorkItem::for_event(kind, head)).await {
            Ok(()) => {
                tracing::info!(
                    content_id = %head.content_id,
                    version = head.version,
                    kind = %kind,
                    "reconciler re-enqueued work"
                );
                if kind == WorkKind::Retract {
                    report.retracted += 1;
                } else {
                    report.reindexed += 1;
                }
                Ok(())
            }
            Err(PipelineError::QueueFull { .. }) => {
                report.skipped_full += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn count_orphans(&self, report: &mut ReconcileReport) -> PipelineResult<()> {
        let mut after: Option<String> = None;
        loop {
            let entries = self.index.entries(after.as_deref(), self.batch_size).await?;
            let Some((last, _)) = entries.last() else { break };
            after = Some(last.clone());

            for (content_id, entry) in &entries {
                if entry.retracted {
                    continue;
                }
                if !self.ledger.contains(content_id).await? {
                    report.orphans += 1;
                    tracing::warn!(
                        content_id = %content_id,
                        version = entry.version,
                        "index entry has no ledger history"
                    );
                }
            }
            if entries.len() < self.batch_size {
                break;
            }
        }
        Ok(())
    }

    /// Reconcile every `interval` until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?interval, "reconciler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        tracing::error!(error = %e, "reconciliation pass failed");
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        tracing::info!("reconciler stopped");
    }
}

fn drift(head: &VersionEvent, indexed: Option<IndexedVersion>) -> Drift {
    match (head.operation, indexed) {
        (_, Some(iv)) if iv.version > head.version => Drift::Regression { indexed: iv.version },
        (Operation::Delete, Some(iv)) if !iv.retracted => Drift::Behind(WorkKind::Retract),
        (Operation::Delete, _) => Drift::InSync,
        (_, Some(iv)) if iv.version == head.version && iv.retracted => {
            Drift::Regression { indexed: iv.version }
        }
        (_, Some(iv)) if iv.version == head.version => Drift::InSync,
        _ => Drift::Behind(WorkKind::Index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ChangeCapture, ContentPatch, NewContent};
    use crate::config::QueueConfig;
    use crate::index::InMemoryIndex;
    use crate::locks::KeyedLocks;
    use crate::models::{ContentKind, ExtractionResult, ExtractionStatus, IndexDocument};
    use crate::queue::InMemoryQueue;
    use tempfile::TempDir;

    struct Setup {
        _tmp: TempDir,
        capture: ChangeCapture,
        store: ExtractionStore,
        index: Arc<InMemoryIndex>,
        queue: Arc<InMemoryQueue>,
        reconciler: Reconciler,
    }

    async fn setup(max_depth: u64) -> Setup {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("rc.sqlite"), 4)
            .await
            .unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        let store = ExtractionStore::new(pool.clone());
        let index = Arc::new(InMemoryIndex::new());
        let queue = Arc::new(InMemoryQueue::new(&QueueConfig {
            max_depth,
            ..QueueConfig::default()
        }));
        let reconciler = Reconciler::new(
            Ledger::new(pool.clone()),
            store.clone(),
            index.clone(),
            queue.clone(),
            2,
        );
        Setup {
            _tmp: tmp,
            capture: ChangeCapture::new(pool, KeyedLocks::new()),
            store,
            index,
            queue,
            reconciler,
        }
    }

    fn content(id: &str) -> NewContent {
        NewContent {
            id: Some(id.into()),
            kind: ContentKind::Assignment,
            source_ref: "inline:Write a haiku".into(),
            title: format!("Assignment {}", id),
            description: None,
        }
    }

    fn doc(id: &str, version: i64) -> IndexDocument {
        IndexDocument {
            content_id: id.into(),
            version,
            kind: ContentKind::Assignment,
            title: id.into(),
            description: None,
            body: String::new(),
            metadata: serde_json::json!({}),
            suggest: Vec::new(),
            extraction_status: ExtractionStatus::Success,
            retracted: false,
            indexed_at: 0,
        }
    }

    #[tokio::test]
    async fn in_sync_ledger_needs_nothing() {
        let s = setup(100).await;
        s.capture.create(content("a")).await.unwrap();
        s.index.upsert(&doc("a", 1)).await.unwrap();

        let report = s.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.repairs(), 0);
        assert_eq!(s.queue.depth().await.unwrap().active(), 0);
    }

    #[tokio::test]
    async fn missing_and_lagging_entries_are_redriven() {
        let s = setup(100).await;
        for id in ["a", "b", "c"] {
            s.capture.create(content(id)).await.unwrap();
        }
        let b2 = s
            .capture
            .update(
                "b",
                ContentPatch {
                    title: Some("B2".into()),
                    ..ContentPatch::default()
                },
            )
            .await
            .unwrap();
        s.index.upsert(&doc("a", 1)).await.unwrap();
        s.index.upsert(&doc("b", 1)).await.unwrap();
        s.store
            .upsert(&ExtractionResult {
                content_id: "b".into(),
                version: b2.version,
                status: ExtractionStatus::Success,
                text: "haiku".into(),
                metadata: serde_json::json!({}),
                content_hash: crate::extraction::content_hash("haiku"),
                error: None,
                extracted_at: 0,
            })
            .await
            .unwrap();

        let report = s.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.reindexed, 2);

        let vis = Duration::from_secs(30);
        let index_item = s.queue.lease(WorkKind::Index, vis).await.unwrap().unwrap();
        assert_eq!(index_item.item.content_id, "b");
        assert_eq!(index_item.item.version, 2);
        let extract_item = s.queue.lease(WorkKind::Extract, vis).await.unwrap().unwrap();
        assert_eq!(extract_item.item.content_id, "c");

        // Queued work is not duplicated on the next pass.
        let again = s.reconciler.reconcile_once().await.unwrap();
        assert_eq!(again.repairs(), 0);
        assert_eq!(again.in_flight, 2);
    }

    #[tokio::test]
    async fn lost_retract_is_reissued() {
        let s = setup(100).await;
        s.capture.create(content("a")).await.unwrap();
        s.index.upsert(&doc("a", 1)).await.unwrap();
        let deleted = s.capture.soft_delete("a").await.unwrap();

        let report = s.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.retracted, 1);
        let lease = s
            .queue
            .lease(WorkKind::Retract, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.item.event_id, deleted.id);
    }

    #[tokio::test]
    async fn pending_older_work_does_not_hide_a_lost_retract() {
        let s = setup(100).await;
        s.capture.create(content("a")).await.unwrap();
        s.index.upsert(&doc("a", 1)).await.unwrap();
        let updated = s
            .capture
            .update(
                "a",
                ContentPatch {
                    title: Some("A2".into()),
                    ..ContentPatch::default()
                },
            )
            .await
            .unwrap();
        s.queue
            .enqueue(WorkItem::for_event(WorkKind::Extract, &updated))
            .await
            .unwrap();
        let deleted = s.capture.soft_delete("a").await.unwrap();

        let report = s.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.retracted, 1);
        assert_eq!(report.in_flight, 0);
        let lease = s
            .queue
            .lease(WorkKind::Retract, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.item.version, deleted.version);

        // The queued retract now covers the head.
        let again = s.reconciler.reconcile_once().await.unwrap();
        assert_eq!(again.retracted, 0);
        assert_eq!(again.in_flight, 1);
    }

    #[tokio::test]
    async fn orphans_and_regressions_are_reported_only() {
        let s = setup(100).await;
        s.capture.create(content("a")).await.unwrap();
        s.index.upsert(&doc("a", 4)).await.unwrap();
        s.index.upsert(&doc("ghost", 1)).await.unwrap();

        let report = s.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.regressions, 1);
        assert_eq!(report.orphans, 1);
        assert_eq!(report.repairs(), 0);
        assert_eq!(s.index.get_version("a").await.unwrap().unwrap().version, 4);
        assert!(s.index.get("ghost").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn full_queue_skips_repairs() {
        let s = setup(1).await;
        s.capture.create(content("a")).await.unwrap();
        s.capture.create(content("b")).await.unwrap();
        s.queue
            .enqueue(WorkItem::new(WorkKind::Extract, "z", 1, "ev-z"))
            .await
            .unwrap();

        let report = s.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.skipped_full, 2);
        assert_eq!(report.repairs(), 0);
    }
}

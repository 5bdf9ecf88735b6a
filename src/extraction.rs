//! Extraction Worker.
//!
//! Consumes `extract` work items: looks up the referenced ledger event,
//! resolves the raw source, runs the kind's extractor under a timeout, and
//! stores an [`ExtractionResult`] keyed by `(content_id, version)`. The
//! caller then acks the item and enqueues an `index` follow-up for the same
//! event.
//!
//! Failure classes:
//!
//! | Failure | Outcome |
//! |---------|---------|
//! | network, timeout, 5xx | `Err` (TransientIO): nack with backoff, no result written |
//! | unsupported format | result `unsupported`, proceed to indexing |
//! | corrupt payload, missing source | result `failed`, proceed to indexing |
//! | missing or mismatched ledger event | `Err` (InvariantViolation): dead-letter |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{PipelineError, PipelineResult};
use crate::extract::{ExtractError, Extracted, ExtractorSet};
use crate::ledger::Ledger;
use crate::models::{
    ExtractionResult, ExtractionStatus, Operation, VersionEvent, WorkItem, WorkKind,
};
use crate::resolve::{ResolveError, SourceResolver};
use crate::workers::Handler;

/// Storage for extraction results. Rows for older versions are kept: a
/// result is superseded by the next version's row, never edited.
#[derive(Clone)]
pub struct ExtractionStore {
    pool: SqlitePool,
}

impl ExtractionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Write the result for its exact version, replacing a previous run.
    pub async fn upsert(&self, result: &ExtractionResult) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO extraction_results
                (content_id, version, status, text, metadata_json, content_hash, error, extracted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_id, version) DO UPDATE SET
                status = excluded.status,
                text = excluded.text,
                metadata_json = excluded.metadata_json,
                content_hash = excluded.content_hash,
                error = excluded.error,
                extracted_at = excluded.extracted_at
            "#,
        )
        .bind(&result.content_id)
        .bind(result.version)
        .bind(result.status.as_str())
        .bind(&result.text)
        .bind(serde_json::to_string(&result.metadata)?)
        .bind(&result.content_hash)
        .bind(&result.error)
        .bind(result.extracted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, content_id: &str, version: i64) -> PipelineResult<Option<ExtractionResult>> {
        let row = sqlx::query(
            r#"
            SELECT content_id, version, status, text, metadata_json, content_hash, error, extracted_at
            FROM extraction_results
            WHERE content_id = ? AND version = ?
            "#,
        )
        .bind(content_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_result).transpose()
    }

    pub async fn count_by_status(&self) -> PipelineResult<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM extraction_results GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| -> PipelineResult<(String, i64)> {
                Ok((r.try_get("status")?, r.try_get("n")?))
            })
            .collect()
    }
}

fn row_to_result(row: &SqliteRow) -> PipelineResult<ExtractionResult> {
    let status: String = row.try_get("status")?;
    let metadata: String = row.try_get("metadata_json")?;
    Ok(ExtractionResult {
        content_id: row.try_get("content_id")?,
        version: row.try_get("version")?,
        status: status.parse()?,
        text: row.try_get("text")?,
        metadata: serde_json::from_str(&metadata)?,
        content_hash: row.try_get("content_hash")?,
        error: row.try_get("error")?,
        extracted_at: row.try_get("extracted_at")?,
    })
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct ExtractionWorker {
    ledger: Ledger,
    store: ExtractionStore,
    resolver: Arc<dyn SourceResolver>,
    extractors: Arc<ExtractorSet>,
    timeout: Duration,
}

impl ExtractionWorker {
    pub fn new(
        ledger: Ledger,
        store: ExtractionStore,
        resolver: Arc<dyn SourceResolver>,
        extractors: Arc<ExtractorSet>,
        timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            store,
            resolver,
            extractors,
            timeout,
        }
    }

    /// Produce and store the extraction result for one work item.
    #[tracing::instrument(skip_all, fields(item = %item.id, content_id = %item.content_id, version = item.version))]
    pub async fn process(&self, item: &WorkItem) -> PipelineResult<ExtractionResult> {
        let event = self.load_event(item).await?;

        let run = self.run_extractor(&event);
        let outcome = match tokio::time::timeout(self.timeout, run).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(PipelineError::Timeout(self.timeout)),
        };

        let result = match outcome? {
            Ok(extracted) => build_result(item, ExtractionStatus::Success, extracted, None),
            Err((status, reason)) => {
                tracing::info!(
                    content_id = %item.content_id,
                    version = item.version,
                    status = status.as_str(),
                    reason = %reason,
                    "extraction degraded to metadata-only"
                );
                build_result(item, status, Extracted::empty(), Some(reason))
            }
        };

        self.store.upsert(&result).await?;
        tracing::debug!(
            content_id = %item.content_id,
            version = item.version,
            status = result.status.as_str(),
            chars = result.text.len(),
            "extraction stored"
        );
        Ok(result)
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
        if event.operation == Operation::Delete {
            return Err(PipelineError::invariant(format!(
                "extract requested for delete event {} of {}",
                event.id, event.content_id
            )));
        }
        Ok(event)
    }

    /// Outer error: transient, retry. Inner error: permanent, index metadata-only.
    async fn run_extractor(
        &self,
        event: &VersionEvent,
    ) -> PipelineResult<Result<Extracted, (ExtractionStatus, String)>> {
        let source = match self.resolver.resolve(&event.payload.source_ref).await {
            Ok(source) => source,
            Err(e @ ResolveError::Unavailable(_)) => return Err(e.into()),
            Err(e) => return Ok(Err((ExtractionStatus::Failed, e.to_string()))),
        };
        let extractor = self.extractors.for_kind(event.payload.kind);
        match extractor.extract(&source).await {
            Ok(extracted) => Ok(Ok(extracted)),
            Err(ExtractError::Transient(msg)) => Err(PipelineError::transient(msg)),
            Err(e @ ExtractError::Unsupported(_)) => Ok(Err((
                ExtractionStatus::Unsupported,
                format!("{} for {}", e, event.payload.kind),
            ))),
            Err(e @ ExtractError::Corrupt(_)) => Ok(Err((ExtractionStatus::Failed, e.to_string()))),
        }
    }
}

fn build_result(
    item: &WorkItem,
    status: ExtractionStatus,
    extracted: Extracted,
    error: Option<String>,
) -> ExtractionResult {
    ExtractionResult {
        content_id: item.content_id.clone(),
        version: item.version,
        status,
        content_hash: content_hash(&extracted.text),
        text: extracted.text,
        metadata: extracted.metadata,
        error,
        extracted_at: chrono::Utc::now().timestamp_millis(),
    }
}

#[async_trait]
impl Handler for ExtractionWorker {
    async fn handle(&self, item: &WorkItem) -> PipelineResult<Option<WorkItem>> {
        self.process(item).await?;
        Ok(Some(item.follow_up(WorkKind::Index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ChangeCapture, NewContent};
    use crate::extract::Extractor;
    use crate::locks::KeyedLocks;
    use crate::models::ContentKind;
    use crate::error::ErrorClass;
    use crate::resolve::ResolvedSource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Resolves `inline:` refs, reports everything else as unreachable.
    struct InlineOnly;

    #[async_trait]
    impl SourceResolver for InlineOnly {
        async fn resolve(&self, source_ref: &str) -> Result<ResolvedSource, ResolveError> {
            match source_ref.strip_prefix("inline:") {
                Some(text) => Ok(ResolvedSource::inline(text)),
                None if source_ref == "missing" => Err(ResolveError::NotFound(source_ref.into())),
                None => Err(ResolveError::Unavailable(source_ref.into())),
            }
        }
    }

    struct Slow(AtomicUsize);

    #[async_trait]
    impl Extractor for Slow {
        async fn extract(&self, _s: &ResolvedSource) -> Result<Extracted, ExtractError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Extracted::empty())
        }
    }

    struct Setup {
        _tmp: TempDir,
        capture: ChangeCapture,
        worker: ExtractionWorker,
        store: ExtractionStore,
    }

    async fn setup(extractors: ExtractorSet) -> Setup {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("x.sqlite"), 4)
            .await
            .unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        let store = ExtractionStore::new(pool.clone());
        let worker = ExtractionWorker::new(
            Ledger::new(pool.clone()),
            store.clone(),
            Arc::new(InlineOnly),
            Arc::new(extractors),
            Duration::from_millis(200),
        );
        Setup {
            _tmp: tmp,
            capture: ChangeCapture::new(pool, KeyedLocks::new()),
            worker,
            store,
        }
    }

    fn content(id: &str, kind: ContentKind, source_ref: &str) -> NewContent {
        NewContent {
            id: Some(id.into()),
            kind,
            source_ref: source_ref.into(),
            title: "Title".into(),
            description: None,
        }
    }

    #[tokio::test]
    async fn success_is_stored_for_the_exact_version() {
        let s = setup(ExtractorSet::builtin()).await;
        let ev = s
            .capture
            .create(content("a", ContentKind::Document, "inline:Mitosis  and meiosis"))
            .await
            .unwrap();
        let item = WorkItem::for_event(WorkKind::Extract, &ev);

        let follow_up = s.worker.handle(&item).await.unwrap().unwrap();
        assert_eq!(follow_up.kind, WorkKind::Index);
        assert_eq!(follow_up.event_id, ev.id);

        let stored = s.store.get("a", 1).await.unwrap().unwrap();
        assert_eq!(stored.status, ExtractionStatus::Success);
        assert_eq!(stored.text, "Mitosis and meiosis");
        assert_eq!(stored.content_hash, content_hash("Mitosis and meiosis"));

        // Re-running is idempotent: same class, same row.
        s.worker.process(&item).await.unwrap();
        assert_eq!(s.store.count_by_status().await.unwrap(), vec![("success".to_string(), 1)]);
    }

    #[tokio::test]
    async fn unsupported_and_missing_sources_degrade() {
        let s = setup(ExtractorSet::builtin()).await;
        let ev = s
            .capture
            .create(content("a", ContentKind::Assignment, "missing"))
            .await
            .unwrap();
        let result = s
            .worker
            .process(&WorkItem::for_event(WorkKind::Extract, &ev))
            .await
            .unwrap();
        assert_eq!(result.status, ExtractionStatus::Failed);
        assert!(result.text.is_empty());

        // Captions or media only; inline text is not a video source.
        let s = setup(ExtractorSet::builtin()).await;
        let ev = s
            .capture
            .create(content("v", ContentKind::Video, "inline:plain words"))
            .await
            .unwrap();
        let result = s
            .worker
            .process(&WorkItem::for_event(WorkKind::Extract, &ev))
            .await
            .unwrap();
        assert_eq!(result.status, ExtractionStatus::Unsupported);
    }

    #[tokio::test]
    async fn unreachable_source_writes_nothing() {
        let s = setup(ExtractorSet::builtin()).await;
        let ev = s
            .capture
            .create(content("a", ContentKind::Document, "http://down"))
            .await
            .unwrap();
        let err = s
            .worker
            .process(&WorkItem::for_event(WorkKind::Extract, &ev))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransientIo);
        assert!(s.store.get("a", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn slow_extractor_times_out_as_transient() {
        let slow = Arc::new(Slow(AtomicUsize::new(0)));
        let s = setup(ExtractorSet::builtin().with(ContentKind::Document, slow.clone())).await;
        let ev = s
            .capture
            .create(content("a", ContentKind::Document, "inline:x"))
            .await
            .unwrap();
        let err = s
            .worker
            .process(&WorkItem::for_event(WorkKind::Extract, &ev))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(_)));
        assert_eq!(slow.0.load(Ordering::SeqCst), 1);
        assert!(s.store.get("a", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_event_is_an_invariant_violation() {
        let s = setup(ExtractorSet::builtin()).await;
        let item = WorkItem::new(WorkKind::Extract, "ghost", 1, "no-such-event");
        let err = s.worker.process(&item).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvariantViolation);
    }
}

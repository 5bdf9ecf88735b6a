//! SQLite search index: `index_documents` rows, an FTS5 table for keyword
//! search and `index_suggest` for completions.
//!
//! Each write runs in one transaction whose first statement is the
//! version-conditional upsert. When that statement changes nothing the
//! write is stale and the transaction rolls back, so the FTS and suggestion
//! rows never get ahead of the document row.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use super::{fts_query, ApplyOutcome, IndexCounts, SearchHit, SearchIndex};
use crate::error::PipelineResult;
use crate::models::{IndexDocument, IndexedVersion};

#[derive(Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn stale(&self, content_id: &str) -> PipelineResult<ApplyOutcome> {
        let indexed = self
            .get_version(content_id)
            .await?
            .map(|v| v.version)
            .unwrap_or(0);
        Ok(ApplyOutcome::Stale { indexed })
    }
}

async fn clear_projections(tx: &mut Transaction<'_, Sqlite>, content_id: &str) -> PipelineResult<()> {
    sqlx::query("DELETE FROM index_fts WHERE content_id = ?")
        .bind(content_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM index_suggest WHERE content_id = ?")
        .bind(content_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl SearchIndex for SqliteIndex {
    async fn get_version(&self, content_id: &str) -> PipelineResult<Option<IndexedVersion>> {
        let row = sqlx::query("SELECT version, retracted FROM index_documents WHERE content_id = ?")
            .bind(content_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> PipelineResult<IndexedVersion> {
            Ok(IndexedVersion {
                version: r.try_get("version")?,
                retracted: r.try_get("retracted")?,
            })
        })
        .transpose()
    }

    async fn get(&self, content_id: &str) -> PipelineResult<Option<IndexDocument>> {
        let row = sqlx::query(
            r#"
            SELECT content_id, version, kind, title, description, body, metadata_json,
                   suggest_json, extraction_status, retracted, indexed_at
            FROM index_documents
            WHERE content_id = ? AND retracted = 0
            "#,
        )
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn upsert(&self, doc: &IndexDocument) -> PipelineResult<ApplyOutcome> {
        let mut tx = self.pool.begin().await?;
        let written = sqlx::query(
            r#"
            INSERT INTO index_documents
                (content_id, version, kind, title, description, body, metadata_json,
                 suggest_json, extraction_status, retracted, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT(content_id) DO UPDATE SET
                version = excluded.version,
                kind = excluded.kind,
                title = excluded.title,
                description = excluded.description,
                body = excluded.body,
                metadata_json = excluded.metadata_json,
                suggest_json = excluded.suggest_json,
                extraction_status = excluded.extraction_status,
                retracted = 0,
                indexed_at = excluded.indexed_at
            WHERE excluded.version > index_documents.version
            "#,
        )
        .bind(&doc.content_id)
        .bind(doc.version)
        .bind(doc.kind.as_str())
        .bind(&doc.title)
        .bind(&doc.description)
        .bind(&doc.body)
        .bind(serde_json::to_string(&doc.metadata)?)
        .bind(serde_json::to_string(&doc.suggest)?)
        .bind(doc.extraction_status.as_str())
        .bind(doc.indexed_at)
        .execute(&mut *tx)
        .await?;

        if written.rows_affected() == 0 {
            tx.rollback().await?;
            return self.stale(&doc.content_id).await;
        }

        clear_projections(&mut tx, &doc.content_id).await?;
        sqlx::query("INSERT INTO index_fts (content_id, title, description, body) VALUES (?, ?, ?, ?)")
            .bind(&doc.content_id)
            .bind(&doc.title)
            .bind(doc.description.as_deref().unwrap_or(""))
            .bind(&doc.body)
            .execute(&mut *tx)
            .await?;
        for input in &doc.suggest {
            sqlx::query("INSERT OR IGNORE INTO index_suggest (content_id, input) VALUES (?, ?)")
                .bind(&doc.content_id)
                .bind(input)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn retract(&self, content_id: &str, version: i64) -> PipelineResult<ApplyOutcome> {
        let mut tx = self.pool.begin().await?;
        let written = sqlx::query(
            r#"
            INSERT INTO index_documents
                (content_id, version, kind, title, description, body, metadata_json,
                 suggest_json, extraction_status, retracted, indexed_at)
            VALUES (?, ?, '', '', NULL, '', '{}', '[]', 'success', 1, ?)
            ON CONFLICT(content_id) DO UPDATE SET
                version = excluded.version,
                body = '',
                suggest_json = '[]',
                retracted = 1,
                indexed_at = excluded.indexed_at
            WHERE excluded.version >= index_documents.version
            "#,
        )
        .bind(content_id)
        .bind(version)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        if written.rows_affected() == 0 {
            tx.rollback().await?;
            return self.stale(content_id).await;
        }

        clear_projections(&mut tx, content_id).await?;
        tx.commit().await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn entries(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> PipelineResult<Vec<(String, IndexedVersion)>> {
        let rows = sqlx::query(
            r#"
            SELECT content_id, version, retracted
            FROM index_documents
            WHERE content_id > ?
            ORDER BY content_id
            LIMIT ?
            "#,
        )
        .bind(after.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| -> PipelineResult<(String, IndexedVersion)> {
                Ok((
                    r.try_get("content_id")?,
                    IndexedVersion {
                        version: r.try_get("version")?,
                        retracted: r.try_get("retracted")?,
                    },
                ))
            })
            .collect()
    }

    async fn search(&self, query: &str, limit: usize) -> PipelineResult<Vec<SearchHit>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"
            SELECT d.content_id, d.version, d.kind, d.title,
                   bm25(index_fts, 0.0, 5.0, 2.0, 1.0) AS bm25_rank,
                   snippet(index_fts, 3, '>>>', '<<<', '...', 24) AS snippet
            FROM index_fts
            JOIN index_documents d ON d.content_id = index_fts.content_id
            WHERE index_fts MATCH ? AND d.retracted = 0
            ORDER BY bm25_rank, d.content_id
            LIMIT ?
            "#,
        )
        .bind(fts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> PipelineResult<SearchHit> {
                let rank: f64 = r.try_get("bm25_rank")?;
                Ok(SearchHit {
                    content_id: r.try_get("content_id")?,
                    version: r.try_get("version")?,
                    kind: r.try_get("kind")?,
                    title: r.try_get("title")?,
                    // bm25 is lower-is-better; negate so higher = better
                    score: -rank,
                    snippet: r.try_get("snippet")?,
                })
            })
            .collect()
    }

    async fn suggest(&self, prefix: &str, limit: usize) -> PipelineResult<Vec<String>> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!(
            "{}%",
            prefix
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_")
        );
        let inputs: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT s.input
            FROM index_suggest s
            JOIN index_documents d ON d.content_id = s.content_id
            WHERE s.input LIKE ? ESCAPE '\' AND d.retracted = 0
            GROUP BY s.input
            ORDER BY length(s.input), s.input
            LIMIT ?
            "#,
        )
        .bind(pattern)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(inputs)
    }

    async fn counts(&self) -> PipelineResult<IndexCounts> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(CASE WHEN retracted = 0 THEN 1 ELSE 0 END), 0) AS live,
                   COALESCE(SUM(CASE WHEN retracted = 1 THEN 1 ELSE 0 END), 0) AS retracted
            FROM index_documents
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(IndexCounts {
            live: row.try_get::<i64, _>("live")? as u64,
            retracted: row.try_get::<i64, _>("retracted")? as u64,
        })
    }
}

fn row_to_document(row: &SqliteRow) -> PipelineResult<IndexDocument> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("extraction_status")?;
    let metadata: String = row.try_get("metadata_json")?;
    let suggest: String = row.try_get("suggest_json")?;
    Ok(IndexDocument {
        content_id: row.try_get("content_id")?,
        version: row.try_get("version")?,
        kind: kind.parse()?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        body: row.try_get("body")?,
        metadata: serde_json::from_str(&metadata)?,
        suggest: serde_json::from_str(&suggest)?,
        extraction_status: status.parse()?,
        retracted: row.try_get("retracted")?,
        indexed_at: row.try_get("indexed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentKind, ExtractionStatus};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteIndex) {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("i.sqlite"), 4)
            .await
            .unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        (tmp, SqliteIndex::new(pool))
    }

    fn doc(id: &str, version: i64, body: &str) -> IndexDocument {
        IndexDocument {
            content_id: id.into(),
            version,
            kind: ContentKind::Document,
            title: format!("{} title", id),
            description: None,
            body: body.into(),
            metadata: serde_json::json!({}),
            suggest: vec![format!("{} title", id), "Thermodynamics".into()],
            extraction_status: ExtractionStatus::Success,
            retracted: false,
            indexed_at: 0,
        }
    }

    #[tokio::test]
    async fn older_versions_never_overwrite_newer() {
        let (_tmp, index) = setup().await;
        assert_eq!(index.upsert(&doc("a", 2, "second draft")).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            index.upsert(&doc("a", 1, "first draft")).await.unwrap(),
            ApplyOutcome::Stale { indexed: 2 }
        );
        // Same version again is a no-op, not a rewrite.
        assert_eq!(
            index.upsert(&doc("a", 2, "other")).await.unwrap(),
            ApplyOutcome::Stale { indexed: 2 }
        );
        let stored = index.get("a").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.body, "second draft");
        assert_eq!(index.search("draft", 10).await.unwrap().len(), 1);
        assert!(index.search("first", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retract_leaves_a_tombstone() {
        let (_tmp, index) = setup().await;
        index.upsert(&doc("a", 2, "entropy")).await.unwrap();
        assert_eq!(index.retract("a", 3).await.unwrap(), ApplyOutcome::Applied);

        assert!(index.get("a").await.unwrap().is_none());
        assert_eq!(
            index.get_version("a").await.unwrap(),
            Some(IndexedVersion { version: 3, retracted: true })
        );
        assert!(index.search("entropy", 10).await.unwrap().is_empty());
        assert!(index.suggest("thermo", 10).await.unwrap().is_empty());

        // v2 arriving after the delete loses to the tombstone.
        assert_eq!(
            index.upsert(&doc("a", 2, "entropy")).await.unwrap(),
            ApplyOutcome::Stale { indexed: 3 }
        );
        // A later restore wins.
        assert_eq!(index.upsert(&doc("a", 4, "entropy")).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(index.counts().await.unwrap(), IndexCounts { live: 1, retracted: 0 });
    }

    #[tokio::test]
    async fn retract_of_absent_doc_blocks_older_upserts() {
        let (_tmp, index) = setup().await;
        assert_eq!(index.retract("a", 3).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            index.upsert(&doc("a", 2, "late")).await.unwrap(),
            ApplyOutcome::Stale { indexed: 3 }
        );
        assert_eq!(index.retract("a", 2).await.unwrap(), ApplyOutcome::Stale { indexed: 3 });
    }

    #[tokio::test]
    async fn suggest_and_entries() {
        let (_tmp, index) = setup().await;
        index.upsert(&doc("b", 1, "x")).await.unwrap();
        index.upsert(&doc("a", 1, "x")).await.unwrap();

        assert_eq!(index.suggest("THERMO", 10).await.unwrap(), vec!["Thermodynamics"]);
        assert_eq!(index.suggest("a ti", 10).await.unwrap(), vec!["a title"]);
        assert!(index.suggest("%", 10).await.unwrap().is_empty());

        let entries = index.entries(None, 10).await.unwrap();
        let ids: Vec<&str> = entries.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(index.entries(Some("a"), 10).await.unwrap().len(), 1);
    }
}

//! Change Capture: the data layer for content mutations.
//!
//! Every committed mutation produces exactly one [`VersionEvent`] and one
//! outbox marker, in the same SQLite transaction as the content row change.
//! If any of the three writes fails the transaction is dropped and nothing
//! is visible (fail-closed). The outbox is forwarded to the task queue by
//! [`crate::relay`].
//!
//! Version numbers are assigned from the content row itself
//! (`version = version + 1`) and cross-checked against the ledger head, so a
//! gap or regression aborts the mutation as an invariant violation.
//!
//! ```text
//! mutation ─▶ BEGIN ─▶ content_items ─▶ version_events ─▶ outbox ─▶ COMMIT
//! ```

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::ledger::{append_event, head_version};
use crate::locks::KeyedLocks;
use crate::models::{initial_work_kind, ContentItem, ContentKind, Operation, VersionEvent};

/// Input for creating a content item.
#[derive(Debug, Clone)]
pub struct NewContent {
    /// Stable identifier; generated when `None`.
    pub id: Option<String>,
    pub kind: ContentKind,
    pub source_ref: String,
    pub title: String,
    pub description: Option<String>,
}

/// Partial update. `None` fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ContentPatch {
    pub source_ref: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl ContentPatch {
    pub fn is_empty(&self) -> bool {
        self.source_ref.is_none() && self.title.is_none() && self.description.is_none()
    }
}

const ITEM_COLUMNS: &str =
    "id, version, kind, source_ref, title, description, deleted, created_at, updated_at";

#[derive(Clone)]
pub struct ChangeCapture {
    pool: SqlitePool,
    locks: KeyedLocks,
}

impl ChangeCapture {
    pub fn new(pool: SqlitePool, locks: KeyedLocks) -> Self {
        Self { pool, locks }
    }

    #[instrument(skip(self, new), fields(kind = %new.kind))]
    pub async fn create(&self, new: NewContent) -> PipelineResult<VersionEvent> {
        let id = new.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        if id.trim().is_empty() {
            return Err(PipelineError::permanent("content id must not be empty"));
        }
        if new.title.trim().is_empty() {
            return Err(PipelineError::permanent("content title must not be empty"));
        }

        let _guard = self.locks.lock(&id).await;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO content_items (id, version, kind, source_ref, title, description, deleted, created_at, updated_at)
            VALUES (?, 1, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(new.kind.as_str())
        .bind(&new.source_ref)
        .bind(&new.title)
        .bind(&new.description)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(PipelineError::ContentExists(id));
        }

        let item = fetch_item(&mut *tx, &id)
            .await?
            .ok_or_else(|| PipelineError::invariant(format!("created row {} vanished", id)))?;
        let event = record(&mut *tx, &item, Operation::Create).await?;
        tx.commit().await?;

        debug!(content_id = %id, version = event.version, "content created");
        Ok(event)
    }

    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: &str, patch: ContentPatch) -> PipelineResult<VersionEvent> {
        if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(PipelineError::permanent("content title must not be empty"));
        }

        let _guard = self.locks.lock(id).await;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE content_items SET
                version = version + 1,
                source_ref = COALESCE(?, source_ref),
                title = COALESCE(?, title),
                description = COALESCE(?, description),
                updated_at = ?
            WHERE id = ? AND deleted = 0
            RETURNING {}
            "#,
            ITEM_COLUMNS
        ))
        .bind(&patch.source_ref)
        .bind(&patch.title)
        .bind(&patch.description)
        .bind(now)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let item = match row {
            Some(row) => row_to_item(&row)?,
            None => return Err(missing_or_deleted(&mut *tx, id).await?),
        };
        let event = record(&mut *tx, &item, Operation::Update).await?;
        tx.commit().await?;

        debug!(content_id = %id, version = event.version, "content updated");
        Ok(event)
    }

    /// Marks the item deleted; the ledger records operation `delete`.
    #[instrument(skip(self))]
    pub async fn soft_delete(&self, id: &str) -> PipelineResult<VersionEvent> {
        let _guard = self.locks.lock(id).await;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "UPDATE content_items SET version = version + 1, deleted = 1, updated_at = ? WHERE id = ? AND deleted = 0 RETURNING {}",
            ITEM_COLUMNS
        ))
        .bind(now)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let item = match row {
            Some(row) => row_to_item(&row)?,
            None => return Err(missing_or_deleted(&mut *tx, id).await?),
        };
        let event = record(&mut *tx, &item, Operation::Delete).await?;
        tx.commit().await?;

        debug!(content_id = %id, version = event.version, "content soft-deleted");
        Ok(event)
    }

    /// Clears the soft-delete flag. Recorded as an `update` with a higher version.
    #[instrument(skip(self))]
    pub async fn restore(&self, id: &str) -> PipelineResult<VersionEvent> {
        let _guard = self.locks.lock(id).await;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "UPDATE content_items SET version = version + 1, deleted = 0, updated_at = ? WHERE id = ? AND deleted = 1 RETURNING {}",
            ITEM_COLUMNS
        ))
        .bind(now)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let item = match row {
            Some(row) => row_to_item(&row)?,
            None => {
                return Err(match fetch_item(&mut *tx, id).await? {
                    None => PipelineError::ContentNotFound(id.to_string()),
                    Some(_) => PipelineError::permanent(format!("content {} is not deleted", id)),
                })
            }
        };
        let event = record(&mut *tx, &item, Operation::Update).await?;
        tx.commit().await?;

        debug!(content_id = %id, version = event.version, "content restored");
        Ok(event)
    }

    pub async fn get(&self, id: &str) -> PipelineResult<Option<ContentItem>> {
        let mut conn = self.pool.acquire().await?;
        fetch_item(&mut *conn, id).await
    }
}

/// Appends the ledger event and outbox marker for a row already at `item.version`.
async fn record(
    conn: &mut SqliteConnection,
    item: &ContentItem,
    operation: Operation,
) -> PipelineResult<VersionEvent> {
    let head = head_version(conn, &item.id).await?.unwrap_or(0);
    if head + 1 != item.version {
        return Err(PipelineError::invariant(format!(
            "ledger head for {} is {} but content row is at {}",
            item.id, head, item.version
        )));
    }

    let event = VersionEvent {
        id: Uuid::new_v4().to_string(),
        content_id: item.id.clone(),
        version: item.version,
        operation,
        created_at: chrono::Utc::now().timestamp_millis(),
        payload: item.snapshot(),
    };
    append_event(conn, &event).await?;

    sqlx::query(
        "INSERT INTO outbox (event_id, work_kind, content_id, version, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&event.id)
    .bind(initial_work_kind(operation).as_str())
    .bind(&event.content_id)
    .bind(event.version)
    .bind(event.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(event)
}

async fn missing_or_deleted(conn: &mut SqliteConnection, id: &str) -> PipelineResult<PipelineError> {
    Ok(match fetch_item(conn, id).await? {
        None => PipelineError::ContentNotFound(id.to_string()),
        Some(_) => PipelineError::ContentDeleted(id.to_string()),
    })
}

async fn fetch_item(conn: &mut SqliteConnection, id: &str) -> PipelineResult<Option<ContentItem>> {
    let row = sqlx::query(&format!("SELECT {} FROM content_items WHERE id = ?", ITEM_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(row_to_item).transpose()
}

fn row_to_item(row: &SqliteRow) -> PipelineResult<ContentItem> {
    let kind: String = row.try_get("kind")?;
    let deleted: i64 = row.try_get("deleted")?;
    Ok(ContentItem {
        id: row.try_get("id")?,
        version: row.try_get("version")?,
        kind: kind.parse()?,
        source_ref: row.try_get("source_ref")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        deleted: deleted != 0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

//! Read access to the append-only version ledger.
//!
//! Events are only ever written by [`crate::capture`], inside the same
//! transaction as the mutation they record. Everything here is read-only.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{ContentSnapshot, Operation, VersionEvent};

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

const EVENT_COLUMNS: &str = "id, content_id, version, operation, created_at, payload_json";

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn event(&self, content_id: &str, version: i64) -> PipelineResult<Option<VersionEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM version_events WHERE content_id = ? AND version = ?",
            EVENT_COLUMNS
        ))
        .bind(content_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    pub async fn event_by_id(&self, id: &str) -> PipelineResult<Option<VersionEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM version_events WHERE id = ?",
            EVENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    /// Highest-version event for one identifier.
    pub async fn head(&self, content_id: &str) -> PipelineResult<Option<VersionEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM version_events WHERE content_id = ? ORDER BY version DESC LIMIT 1",
            EVENT_COLUMNS
        ))
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    /// Head events ordered by identifier, starting strictly after `after`.
    pub async fn heads(&self, after: Option<&str>, limit: usize) -> PipelineResult<Vec<VersionEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.content_id, e.version, e.operation, e.created_at, e.payload_json
            FROM version_events e
            JOIN (
                SELECT content_id, MAX(version) AS head
                FROM version_events
                WHERE content_id > ?
                GROUP BY content_id
                ORDER BY content_id
                LIMIT ?
            ) h ON e.content_id = h.content_id AND e.version = h.head
            ORDER BY e.content_id
            "#,
        )
        .bind(after.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Full history for one identifier in version order.
    pub async fn history(&self, content_id: &str) -> PipelineResult<Vec<VersionEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM version_events WHERE content_id = ? ORDER BY version ASC",
            EVENT_COLUMNS
        ))
        .bind(content_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn contains(&self, content_id: &str) -> PipelineResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM version_events WHERE content_id = ?")
                .bind(content_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

pub(crate) async fn head_version(
    conn: &mut SqliteConnection,
    content_id: &str,
) -> PipelineResult<Option<i64>> {
    let head: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM version_events WHERE content_id = ?")
            .bind(content_id)
            .fetch_one(&mut *conn)
            .await?;
    Ok(head)
}

pub(crate) async fn append_event(
    conn: &mut SqliteConnection,
    event: &VersionEvent,
) -> PipelineResult<()> {
    let payload = serde_json::to_string(&event.payload)?;
    sqlx::query(
        "INSERT INTO version_events (id, content_id, version, operation, created_at, payload_json) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&event.id)
    .bind(&event.content_id)
    .bind(event.version)
    .bind(event.operation.as_str())
    .bind(event.created_at)
    .bind(payload)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn row_to_event(row: &SqliteRow) -> PipelineResult<VersionEvent> {
    let operation: String = row.try_get("operation")?;
    let payload_json: String = row.try_get("payload_json")?;
    let payload: ContentSnapshot = serde_json::from_str(&payload_json).map_err(|e| {
        PipelineError::invariant(format!("unreadable ledger payload: {}", e))
    })?;
    Ok(VersionEvent {
        id: row.try_get("id")?,
        content_id: row.try_get("content_id")?,
        version: row.try_get("version")?,
        operation: operation.parse::<Operation>()?,
        created_at: row.try_get("created_at")?,
        payload,
    })
}

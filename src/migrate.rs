//! Database schema migrations (idempotent).
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `content_items` | Store of record for learning content |
//! | `version_events` | Append-only version ledger |
//! | `outbox` | Enqueue markers written in the mutation transaction |
//! | `work_items` | Task queue: leases, attempts, dead letters |
//! | `extraction_results` | Extracted text per `(content_id, version)` |
//! | `index_documents` + `index_fts` | Search index projection and FTS5 table |
//! | `index_suggest` | Completion inputs per indexed document |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_items (
            id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            kind TEXT NOT NULL,
            source_ref TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            deleted INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS version_events (
            id TEXT PRIMARY KEY,
            content_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            operation TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            payload_json TEXT NOT NULL,
            UNIQUE(content_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The ledger is append-only: reject any rewrite at the storage layer too.
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS version_events_no_update
        BEFORE UPDATE ON version_events
        BEGIN
            SELECT RAISE(ABORT, 'version_events is append-only');
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS version_events_no_delete
        BEFORE DELETE ON version_events
        BEGIN
            SELECT RAISE(ABORT, 'version_events is append-only');
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outbox (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL,
            work_kind TEXT NOT NULL,
            content_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (event_id) REFERENCES version_events(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_items (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            content_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            event_id TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            next_eligible_at INTEGER NOT NULL,
            leased_until INTEGER,
            lease_token TEXT,
            dead_lettered INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_error_class TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extraction_results (
            content_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            status TEXT NOT NULL,
            text TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            content_hash TEXT NOT NULL,
            error TEXT,
            extracted_at INTEGER NOT NULL,
            PRIMARY KEY (content_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_documents (
            content_id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            body TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            suggest_json TEXT NOT NULL DEFAULT '[]',
            extraction_status TEXT NOT NULL,
            retracted INTEGER NOT NULL DEFAULT 0,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_suggest (
            content_id TEXT NOT NULL,
            input TEXT NOT NULL COLLATE NOCASE,
            PRIMARY KEY (content_id, input)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='index_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE index_fts USING fts5(
                content_id UNINDEXED,
                title,
                description,
                body
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_work_items_lease ON work_items(kind, dead_lettered, next_eligible_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_index_suggest_input ON index_suggest(input)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_version_events_content ON version_events(content_id, version DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

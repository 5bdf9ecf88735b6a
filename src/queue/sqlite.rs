//! SQLite-backed task queue over the `work_items` table.
//!
//! Leasing is a single `UPDATE ... RETURNING` so two workers can never lease
//! the same row, and the first statement of every write path is a write.
//! A row whose lease expired is leased again with its attempt counter bumped:
//! an expired visibility timeout is a failed attempt.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{
    duration_millis, now_millis, Lease, NackOutcome, QueueDepth, RetryPolicy, TaskQueue,
};
use crate::config::QueueConfig;
use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::models::{WorkItem, WorkKind};

const LEASE_EXPIRED: &str = "lease expired before the item was acknowledged";

/// Upper bound on exhausted rows skipped by a single `lease` call.
const MAX_LEASE_SWEEP: usize = 32;

#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    policy: RetryPolicy,
    max_depth: u64,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, config: &QueueConfig) -> Self {
        Self {
            pool,
            policy: RetryPolicy::from_config(config),
            max_depth: config.max_depth,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn mark_dead(&self, id: &str, token: &str) -> PipelineResult<()> {
        sqlx::query(
            "UPDATE work_items SET dead_lettered = 1, leased_until = NULL, lease_token = NULL, updated_at = ? WHERE id = ? AND lease_token = ?",
        )
        .bind(now_millis())
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for SqliteQueue {
    async fn enqueue(&self, item: WorkItem) -> PipelineResult<()> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO work_items
                (id, kind, content_id, version, event_id, attempts, next_eligible_at,
                 dead_lettered, created_at, updated_at)
            SELECT ?, ?, ?, ?, ?, ?, ?, 0, ?, ?
            WHERE (SELECT COUNT(*) FROM work_items WHERE dead_lettered = 0) < ?
            "#,
        )
        .bind(&item.id)
        .bind(item.kind.as_str())
        .bind(&item.content_id)
        .bind(item.version)
        .bind(&item.event_id)
        .bind(item.attempts as i64)
        .bind(item.next_eligible_at)
        .bind(item.created_at)
        .bind(now)
        .bind(self.max_depth as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let depth = self.depth().await?;
            return Err(PipelineError::QueueFull {
                depth: depth.active(),
                max: self.max_depth,
            });
        }
        Ok(())
    }

    async fn lease(&self, kind: WorkKind, visibility: Duration) -> PipelineResult<Option<Lease>> {
        for _ in 0..MAX_LEASE_SWEEP {
            let now = now_millis();
            let leased_until = now.saturating_add(duration_millis(visibility));
            let token = Uuid::new_v4().to_string();

            let row = sqlx::query(
                r#"
                UPDATE work_items
                SET leased_until = ?1,
                    lease_token = ?2,
                    updated_at = ?3,
                    attempts = attempts + CASE WHEN leased_until IS NOT NULL THEN 1 ELSE 0 END,
                    last_error = CASE WHEN leased_until IS NOT NULL THEN ?5 ELSE last_error END,
                    last_error_class = CASE WHEN leased_until IS NOT NULL THEN ?6 ELSE last_error_class END
                WHERE id = (
                    SELECT id FROM work_items
                    WHERE kind = ?4
                      AND dead_lettered = 0
                      AND next_eligible_at <= ?3
                      AND (leased_until IS NULL OR leased_until <= ?3)
                    ORDER BY next_eligible_at, created_at
                    LIMIT 1
                )
                RETURNING id, kind, content_id, version, event_id, attempts, next_eligible_at,
                          dead_lettered, last_error, last_error_class, created_at
                "#,
            )
            .bind(leased_until)
            .bind(&token)
            .bind(now)
            .bind(kind.as_str())
            .bind(LEASE_EXPIRED)
            .bind(ErrorClass::TransientIo.as_str())
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let item = row_to_item(&row)?;

            // Only an expired lease can push attempts to the limit here;
            // nack dead-letters on its own.
            if self.policy.exhausted(item.attempts) {
                tracing::warn!(
                    work_id = %item.id,
                    content_id = %item.content_id,
                    version = item.version,
                    attempts = item.attempts,
                    "visibility timeout exhausted attempts, dead-lettering"
                );
                self.mark_dead(&item.id, &token).await?;
                continue;
            }

            return Ok(Some(Lease {
                item,
                token,
                leased_until,
            }));
        }
        Ok(None)
    }

    async fn ack(&self, lease: &Lease) -> PipelineResult<bool> {
        let result = sqlx::query("DELETE FROM work_items WHERE id = ? AND lease_token = ?")
            .bind(&lease.item.id)
            .bind(&lease.token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ack_with_follow_up(&self, lease: &Lease, follow_up: WorkItem) -> PipelineResult<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM work_items WHERE id = ? AND lease_token = ?")
            .bind(&lease.item.id)
            .bind(&lease.token)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO work_items
                (id, kind, content_id, version, event_id, attempts, next_eligible_at,
                 dead_lettered, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, 0, ?, ?)
            "#,
        )
        .bind(&follow_up.id)
        .bind(follow_up.kind.as_str())
        .bind(&follow_up.content_id)
        .bind(follow_up.version)
        .bind(&follow_up.event_id)
        .bind(follow_up.next_eligible_at)
        .bind(follow_up.created_at)
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn nack(&self, lease: &Lease, error: &PipelineError) -> PipelineResult<NackOutcome> {
        let now = now_millis();
        let attempts = lease.item.attempts + 1;
        let exhausted = self.policy.exhausted(attempts);
        let delay = self.policy.delay_for(attempts);

        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET attempts = ?, last_error = ?, last_error_class = ?,
                leased_until = NULL, lease_token = NULL,
                next_eligible_at = ?, dead_lettered = ?, updated_at = ?
            WHERE id = ? AND lease_token = ?
            "#,
        )
        .bind(attempts as i64)
        .bind(error.to_string())
        .bind(error.class().as_str())
        .bind(now.saturating_add(duration_millis(delay)))
        .bind(exhausted)
        .bind(now)
        .bind(&lease.item.id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(NackOutcome::LeaseLost);
        }
        if exhausted {
            Ok(NackOutcome::DeadLettered { attempts })
        } else {
            Ok(NackOutcome::Retried { attempts, delay })
        }
    }

    async fn dead_letter(&self, lease: &Lease, error: &PipelineError) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET attempts = attempts + 1, last_error = ?, last_error_class = ?,
                leased_until = NULL, lease_token = NULL, dead_lettered = 1, updated_at = ?
            WHERE id = ? AND lease_token = ?
            "#,
        )
        .bind(error.to_string())
        .bind(error.class().as_str())
        .bind(now_millis())
        .bind(&lease.item.id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, lease: &Lease) -> PipelineResult<bool> {
        let result = sqlx::query(
            "UPDATE work_items SET leased_until = NULL, lease_token = NULL, updated_at = ? WHERE id = ? AND lease_token = ?",
        )
        .bind(now_millis())
        .bind(&lease.item.id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn depth(&self) -> PipelineResult<QueueDepth> {
        let now = now_millis();
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN dead_lettered = 0
                    AND (leased_until IS NULL OR leased_until <= ?1)
                    AND next_eligible_at <= ?1 THEN 1 ELSE 0 END), 0) AS ready,
                COALESCE(SUM(CASE WHEN dead_lettered = 0
                    AND (leased_until IS NULL OR leased_until <= ?1)
                    AND next_eligible_at > ?1 THEN 1 ELSE 0 END), 0) AS delayed,
                COALESCE(SUM(CASE WHEN dead_lettered = 0
                    AND leased_until > ?1 THEN 1 ELSE 0 END), 0) AS in_flight,
                COALESCE(SUM(CASE WHEN dead_lettered = 1 THEN 1 ELSE 0 END), 0) AS dead
            FROM work_items
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueDepth {
            ready: row.try_get::<i64, _>("ready")? as u64,
            delayed: row.try_get::<i64, _>("delayed")? as u64,
            in_flight: row.try_get::<i64, _>("in_flight")? as u64,
            dead_lettered: row.try_get::<i64, _>("dead")? as u64,
        })
    }

    async fn has_active(&self, content_id: &str) -> PipelineResult<bool> {
        let active: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM work_items WHERE content_id = ? AND dead_lettered = 0",
        )
        .bind(content_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(active)
    }

    async fn has_active_at(&self, content_id: &str, version: i64) -> PipelineResult<bool> {
        let active: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM work_items WHERE content_id = ? AND version >= ? AND dead_lettered = 0",
        )
        .bind(content_id)
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        Ok(active)
    }

    async fn dead_letters(&self, limit: usize) -> PipelineResult<Vec<WorkItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, content_id, version, event_id, attempts, next_eligible_at,
                   dead_lettered, last_error, last_error_class, created_at
            FROM work_items
            WHERE dead_lettered = 1
            ORDER BY updated_at DESC, id
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn requeue_dead_letter(&self, id: &str) -> PipelineResult<bool> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET dead_lettered = 0, attempts = 0, next_eligible_at = ?,
                leased_until = NULL, lease_token = NULL, updated_at = ?
            WHERE id = ? AND dead_lettered = 1
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_item(row: &SqliteRow) -> PipelineResult<WorkItem> {
    let kind: String = row.try_get("kind")?;
    let attempts: i64 = row.try_get("attempts")?;
    let class: Option<String> = row.try_get("last_error_class")?;
    Ok(WorkItem {
        id: row.try_get("id")?,
        kind: kind.parse()?,
        content_id: row.try_get("content_id")?,
        version: row.try_get("version")?,
        event_id: row.try_get("event_id")?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        next_eligible_at: row.try_get("next_eligible_at")?,
        dead_lettered: row.try_get("dead_lettered")?,
        last_error: row.try_get("last_error")?,
        last_error_class: class.as_deref().map(str::parse).transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

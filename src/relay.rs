//! Outbox relay.
//!
//! Change Capture writes an outbox row in the same transaction as the ledger
//! event. The relay forwards pending rows to the task queue in commit order
//! and deletes a row only after its enqueue succeeded, so a crash in between
//! yields a duplicate work item, never a lost one. The ledger keeps the
//! history; the outbox only holds rows not yet handed to the queue. When the
//! queue is full the relay stops and leaves the remaining rows for the next
//! pass.

use std::sync::Arc;
use std::time::Duration;

use sqlx::{Row, SqlitePool};
use tokio::sync::watch;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{WorkItem, WorkKind};
use crate::queue::TaskQueue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub relayed: usize,
    /// The queue rejected an item at its depth bound.
    pub backpressured: bool,
}

pub struct Relay {
    pool: SqlitePool,
    queue: Arc<dyn TaskQueue>,
    batch_size: i64,
}

impl Relay {
    pub fn new(pool: SqlitePool, queue: Arc<dyn TaskQueue>, batch_size: i64) -> Self {
        Self {
            pool,
            queue,
            batch_size: batch_size.max(1),
        }
    }

    /// Forward up to one batch of pending outbox rows.
    pub async fn relay_once(&self) -> PipelineResult<RelayReport> {
        let rows = sqlx::query(
            r#"
            SELECT seq, event_id, work_kind, content_id, version
            FROM outbox
            ORDER BY seq
            LIMIT ?
            "#,
        )
        .bind(self.batch_size)
        .fetch_all(&self.pool)
        .await?;

        let mut report = RelayReport::default();
        for row in rows {
            let seq: i64 = row.try_get("seq")?;
            let kind: String = row.try_get("work_kind")?;
            let content_id: String = row.try_get("content_id")?;
            let event_id: String = row.try_get("event_id")?;
            let item = WorkItem::new(
                kind.parse::<WorkKind>()?,
                &content_id,
                row.try_get("version")?,
                &event_id,
            );
            let work_id = item.id.clone();

            match self.queue.enqueue(item).await {
                Ok(()) => {}
                Err(PipelineError::QueueFull { depth, max }) => {
                    tracing::warn!(depth, max, seq, "queue full, outbox relay paused");
                    report.backpressured = true;
                    break;
                }
                Err(e) => return Err(e),
            }

            sqlx::query("DELETE FROM outbox WHERE seq = ?")
                .bind(seq)
                .execute(&self.pool)
                .await?;
            tracing::debug!(seq, work_id = %work_id, content_id = %content_id, "relayed outbox row");
            report.relayed += 1;
        }
        Ok(report)
    }

    /// Relay until the outbox is empty or the queue pushes back.
    pub async fn drain(&self) -> PipelineResult<RelayReport> {
        let mut total = RelayReport::default();
        loop {
            let report = self.relay_once().await?;
            total.relayed += report.relayed;
            if report.backpressured {
                total.backpressured = true;
                return Ok(total);
            }
            if report.relayed == 0 {
                return Ok(total);
            }
        }
    }

    pub async fn pending(&self) -> PipelineResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Poll the outbox every `interval` until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        tracing::info!(interval = ?interval, "outbox relay started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.drain().await {
                        Ok(report) if report.relayed > 0 => {
                            tracing::info!(relayed = report.relayed, backpressured = report.backpressured, "outbox relay pass");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "outbox relay failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("outbox relay stopped");
    }
}

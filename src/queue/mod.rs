//! Task queue abstraction.
//!
//! The [`TaskQueue`] trait is the contract the pipeline consumes from the
//! work-distribution collaborator: at-least-once delivery, leases that hide
//! an item from other consumers until acked or until the visibility timeout
//! elapses, exponential backoff on `nack`, and a dead-letter channel once the
//! attempt budget is spent. Ordering is not part of the contract; the
//! indexer's version guard provides correctness.
//!
//! | Backend | Module |
//! |---------|--------|
//! | SQLite table (`work_items`) | [`sqlite`] |
//! | In-process map | [`memory`] |

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::QueueConfig;
use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::models::{WorkItem, WorkKind};

pub use memory::InMemoryQueue;
pub use sqlite::SqliteQueue;

/// A leased work item. The token ties ack/nack to this particular lease.
#[derive(Debug, Clone)]
pub struct Lease {
    pub item: WorkItem,
    pub token: String,
    /// Unix milliseconds at which the item becomes visible again.
    pub leased_until: i64,
}

/// Result of returning an item to the queue after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Retried { attempts: u32, delay: Duration },
    DeadLettered { attempts: u32 },
    /// The lease had already expired and been taken by another consumer.
    LeaseLost,
}

/// Queue occupancy snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: u64,
    pub delayed: u64,
    pub in_flight: u64,
    pub dead_lettered: u64,
}

impl QueueDepth {
    /// Items that count against `queue.max_depth`.
    pub fn active(&self) -> u64 {
        self.ready + self.delayed + self.in_flight
    }
}

/// Exponential backoff with a cap, driven by `[queue]` configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before the next delivery once `attempts` failures have been recorded.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Work-distribution collaborator consumed by the pipeline.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Add an item. Fails with [`PipelineError::QueueFull`] at the depth bound.
    async fn enqueue(&self, item: WorkItem) -> PipelineResult<()>;

    /// Lease one eligible item of `kind`, hiding it for `visibility`.
    async fn lease(&self, kind: WorkKind, visibility: Duration) -> PipelineResult<Option<Lease>>;

    /// Remove a completed item. Returns `false` if the lease was lost.
    async fn ack(&self, lease: &Lease) -> PipelineResult<bool>;

    /// Remove a completed item and enqueue its follow-up in one step.
    ///
    /// The follow-up replaces the acked item, so it is not subject to the
    /// depth bound. Nothing is enqueued if the lease was lost.
    async fn ack_with_follow_up(&self, lease: &Lease, follow_up: WorkItem) -> PipelineResult<bool>;

    /// Record a failed attempt and make the item visible again after backoff,
    /// or dead-letter it once the attempt budget is spent.
    async fn nack(&self, lease: &Lease, error: &PipelineError) -> PipelineResult<NackOutcome>;

    /// Move an item straight to the dead-letter channel.
    async fn dead_letter(&self, lease: &Lease, error: &PipelineError) -> PipelineResult<bool>;

    /// Give a lease back without counting an attempt (worker shutdown).
    async fn release(&self, lease: &Lease) -> PipelineResult<bool>;

    async fn depth(&self) -> PipelineResult<QueueDepth>;

    /// Whether any non-dead-lettered item exists for the identifier.
    async fn has_active(&self, content_id: &str) -> PipelineResult<bool>;

    /// Whether a non-dead-lettered item for the identifier carries `version`
    /// or a later one. Older pending items do not cover a newer head.
    async fn has_active_at(&self, content_id: &str, version: i64) -> PipelineResult<bool>;

    /// Dead-lettered items, most recent first.
    async fn dead_letters(&self, limit: usize) -> PipelineResult<Vec<WorkItem>>;

    /// Operator remediation: return a dead-lettered item to the queue with a
    /// fresh attempt budget. Returns `false` if no such dead letter exists.
    async fn requeue_dead_letter(&self, id: &str) -> PipelineResult<bool>;

    /// Lease, polling until an item is available or `timeout` elapses.
    async fn lease_blocking(
        &self,
        kind: WorkKind,
        visibility: Duration,
        poll_interval: Duration,
        timeout: Duration,
    ) -> PipelineResult<Option<Lease>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lease) = self.lease(kind, visibility).await? {
                return Ok(Some(lease));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

/// Dead-letter inspection summary for operators.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterReport {
    pub count: usize,
    pub entries: Vec<DeadLetterEntry>,
}

#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub id: String,
    pub kind: WorkKind,
    pub content_id: String,
    pub version: i64,
    pub attempts: u32,
    pub reason: Option<ErrorClass>,
    pub last_error: Option<String>,
}

impl From<WorkItem> for DeadLetterEntry {
    fn from(item: WorkItem) -> Self {
        Self {
            id: item.id,
            kind: item.kind,
            content_id: item.content_id,
            version: item.version,
            attempts: item.attempts,
            reason: item.last_error_class,
            last_error: item.last_error,
        }
    }
}

pub async fn dead_letter_report(
    queue: &dyn TaskQueue,
    limit: usize,
) -> PipelineResult<DeadLetterReport> {
    let depth = queue.depth().await?;
    let entries: Vec<DeadLetterEntry> = queue
        .dead_letters(limit)
        .await?
        .into_iter()
        .map(DeadLetterEntry::from)
        .collect();
    Ok(DeadLetterReport {
        count: depth.dead_lettered as usize,
        entries,
    })
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

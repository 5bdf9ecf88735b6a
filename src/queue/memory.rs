//! In-process task queue.
//!
//! Same contract as [`super::SqliteQueue`] with the state held in a map
//! behind a mutex. Used by tests and by embedders that don't need work to
//! survive a restart.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    duration_millis, now_millis, Lease, NackOutcome, QueueDepth, RetryPolicy, TaskQueue,
};
use crate::config::QueueConfig;
use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::models::{WorkItem, WorkKind};

struct Entry {
    item: WorkItem,
    leased_until: Option<i64>,
    token: Option<String>,
    updated_at: i64,
}

impl Entry {
    fn holds(&self, lease: &Lease) -> bool {
        self.token.as_deref() == Some(lease.token.as_str())
    }

    fn leased_at(&self, now: i64) -> bool {
        matches!(self.leased_until, Some(until) if until > now)
    }
}

pub struct InMemoryQueue {
    entries: Mutex<HashMap<String, Entry>>,
    policy: RetryPolicy,
    max_depth: u64,
}

impl InMemoryQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy: RetryPolicy::from_config(config),
            max_depth: config.max_depth,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

fn insert(map: &mut HashMap<String, Entry>, item: WorkItem) {
    let now = now_millis();
    map.insert(
        item.id.clone(),
        Entry {
            item,
            leased_until: None,
            token: None,
            updated_at: now,
        },
    );
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, item: WorkItem) -> PipelineResult<()> {
        let mut map = self.entries();
        let active = map.values().filter(|e| !e.item.dead_lettered).count() as u64;
        if active >= self.max_depth {
            return Err(PipelineError::QueueFull {
                depth: active,
                max: self.max_depth,
            });
        }
        insert(&mut map, item);
        Ok(())
    }

    async fn lease(&self, kind: WorkKind, visibility: Duration) -> PipelineResult<Option<Lease>> {
        let now = now_millis();
        let mut map = self.entries();

        loop {
            let candidate = map
                .values()
                .filter(|e| {
                    e.item.kind == kind
                        && !e.item.dead_lettered
                        && e.item.next_eligible_at <= now
                        && !e.leased_at(now)
                })
                .min_by_key(|e| (e.item.next_eligible_at, e.item.created_at))
                .map(|e| e.item.id.clone());

            let Some(id) = candidate else {
                return Ok(None);
            };
            let Some(entry) = map.get_mut(&id) else {
                return Ok(None);
            };

            if entry.leased_until.is_some() {
                entry.item.attempts += 1;
                entry.item.last_error =
                    Some("lease expired before the item was acknowledged".to_string());
                entry.item.last_error_class = Some(ErrorClass::TransientIo);
            }
            entry.updated_at = now;

            if self.policy.exhausted(entry.item.attempts) {
                tracing::warn!(
                    work_id = %entry.item.id,
                    attempts = entry.item.attempts,
                    "visibility timeout exhausted attempts, dead-lettering"
                );
                entry.item.dead_lettered = true;
                entry.leased_until = None;
                entry.token = None;
                continue;
            }

            let leased_until = now.saturating_add(duration_millis(visibility));
            let token = Uuid::new_v4().to_string();
            entry.leased_until = Some(leased_until);
            entry.token = Some(token.clone());
            return Ok(Some(Lease {
                item: entry.item.clone(),
                token,
                leased_until,
            }));
        }
    }

    async fn ack(&self, lease: &Lease) -> PipelineResult<bool> {
        let mut map = self.entries();
        match map.get(&lease.item.id) {
            Some(entry) if entry.holds(lease) => {
                map.remove(&lease.item.id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ack_with_follow_up(&self, lease: &Lease, follow_up: WorkItem) -> PipelineResult<bool> {
        let mut map = self.entries();
        match map.get(&lease.item.id) {
            Some(entry) if entry.holds(lease) => {
                map.remove(&lease.item.id);
                insert(&mut map, follow_up);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn nack(&self, lease: &Lease, error: &PipelineError) -> PipelineResult<NackOutcome> {
        let now = now_millis();
        let mut map = self.entries();
        let Some(entry) = map.get_mut(&lease.item.id).filter(|e| e.holds(lease)) else {
            return Ok(NackOutcome::LeaseLost);
        };

        let attempts = entry.item.attempts + 1;
        let delay = self.policy.delay_for(attempts);
        entry.item.attempts = attempts;
        entry.item.last_error = Some(error.to_string());
        entry.item.last_error_class = Some(error.class());
        entry.item.next_eligible_at = now.saturating_add(duration_millis(delay));
        entry.leased_until = None;
        entry.token = None;
        entry.updated_at = now;

        if self.policy.exhausted(attempts) {
            entry.item.dead_lettered = true;
            Ok(NackOutcome::DeadLettered { attempts })
        } else {
            Ok(NackOutcome::Retried { attempts, delay })
        }
    }

    async fn dead_letter(&self, lease: &Lease, error: &PipelineError) -> PipelineResult<bool> {
        let mut map = self.entries();
        let Some(entry) = map.get_mut(&lease.item.id).filter(|e| e.holds(lease)) else {
            return Ok(false);
        };
        entry.item.attempts += 1;
        entry.item.last_error = Some(error.to_string());
        entry.item.last_error_class = Some(error.class());
        entry.item.dead_lettered = true;
        entry.leased_until = None;
        entry.token = None;
        entry.updated_at = now_millis();
        Ok(true)
    }

    async fn release(&self, lease: &Lease) -> PipelineResult<bool> {
        let mut map = self.entries();
        let Some(entry) = map.get_mut(&lease.item.id).filter(|e| e.holds(lease)) else {
            return Ok(false);
        };
        entry.leased_until = None;
        entry.token = None;
        entry.updated_at = now_millis();
        Ok(true)
    }

    async fn depth(&self) -> PipelineResult<QueueDepth> {
        let now = now_millis();
        let map = self.entries();
        let mut depth = QueueDepth::default();
        for entry in map.values() {
            if entry.item.dead_lettered {
                depth.dead_lettered += 1;
            } else if entry.leased_at(now) {
                depth.in_flight += 1;
            } else if entry.item.next_eligible_at > now {
                depth.delayed += 1;
            } else {
                depth.ready += 1;
            }
        }
        Ok(depth)
    }

    async fn has_active(&self, content_id: &str) -> PipelineResult<bool> {
        Ok(self
            .entries()
            .values()
            .any(|e| e.item.content_id == content_id && !e.item.dead_lettered))
    }

    async fn has_active_at(&self, content_id: &str, version: i64) -> PipelineResult<bool> {
        Ok(self.entries().values().any(|e| {
            e.item.content_id == content_id && e.item.version >= version && !e.item.dead_lettered
        }))
    }

    async fn dead_letters(&self, limit: usize) -> PipelineResult<Vec<WorkItem>> {
        let map = self.entries();
        let mut dead: Vec<&Entry> = map.values().filter(|e| e.item.dead_lettered).collect();
        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.item.id.cmp(&b.item.id)));
        Ok(dead.into_iter().take(limit).map(|e| e.item.clone()).collect())
    }

    async fn requeue_dead_letter(&self, id: &str) -> PipelineResult<bool> {
        let now = now_millis();
        let mut map = self.entries();
        let Some(entry) = map.get_mut(id).filter(|e| e.item.dead_lettered) else {
            return Ok(false);
        };
        entry.item.dead_lettered = false;
        entry.item.attempts = 0;
        entry.item.next_eligible_at = now;
        entry.leased_until = None;
        entry.token = None;
        entry.updated_at = now;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIS: Duration = Duration::from_secs(30);

    fn queue(max_attempts: u32) -> InMemoryQueue {
        InMemoryQueue::new(&QueueConfig {
            max_attempts,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            max_depth: 3,
            ..QueueConfig::default()
        })
    }

    #[tokio::test]
    async fn nack_until_dead_letter() {
        let q = queue(2);
        q.enqueue(WorkItem::new(WorkKind::Index, "a", 1, "ev")).await.unwrap();
        let err = PipelineError::transient("search cluster down");

        let lease = q.lease(WorkKind::Index, VIS).await.unwrap().unwrap();
        assert!(matches!(
            q.nack(&lease, &err).await.unwrap(),
            NackOutcome::Retried { attempts: 1, .. }
        ));
        let lease = q.lease(WorkKind::Index, VIS).await.unwrap().unwrap();
        assert_eq!(
            q.nack(&lease, &err).await.unwrap(),
            NackOutcome::DeadLettered { attempts: 2 }
        );
        assert_eq!(q.depth().await.unwrap().dead_lettered, 1);
        assert!(q.lease(WorkKind::Index, VIS).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_lease_cannot_ack() {
        let q = queue(5);
        q.enqueue(WorkItem::new(WorkKind::Extract, "a", 1, "ev")).await.unwrap();
        let first = q.lease(WorkKind::Extract, Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(3)).await;
        let second = q.lease(WorkKind::Extract, VIS).await.unwrap().unwrap();
        assert_eq!(second.item.attempts, 1);
        assert!(!q.ack(&first).await.unwrap());
        assert!(q.ack(&second).await.unwrap());
    }

    #[tokio::test]
    async fn bounded_depth() {
        let q = queue(5);
        for i in 0..3 {
            q.enqueue(WorkItem::new(WorkKind::Extract, &format!("c{}", i), 1, "ev"))
                .await
                .unwrap();
        }
        let err = q
            .enqueue(WorkItem::new(WorkKind::Extract, "c3", 1, "ev"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::QueueFull { depth: 3, max: 3 }));
    }
}

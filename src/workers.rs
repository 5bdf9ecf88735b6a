//! Worker runtime: leases work items and settles them by error class.
//!
//! Extract workers consume `extract` items; index workers consume `retract`
//! items first and then `index` items. Each worker holds a permit from a
//! shared semaphore while it owns a lease, which caps in-flight work across
//! both pools. Idle workers and workers whose collaborators keep failing
//! back off exponentially up to `workers.idle_backoff_max_ms`.
//!
//! | Outcome | Queue action |
//! |---------|--------------|
//! | `Ok(None)` | ack |
//! | `Ok(Some(next))` | ack + enqueue `next` atomically |
//! | `TransientIO` | nack (backoff, dead-letter when exhausted) |
//! | `PermanentContent`, `InvariantViolation` | dead-letter |
//! | `StaleWorkItem` | ack |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::config::{QueueConfig, WorkersConfig};
use crate::error::{ErrorClass, PipelineResult};
use crate::models::{WorkItem, WorkKind};
use crate::queue::{Lease, NackOutcome, TaskQueue};

/// Processes one work item. Returns the follow-up item, if any.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, item: &WorkItem) -> PipelineResult<Option<WorkItem>>;
}

/// What happened to a leased item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    FollowedUp(WorkKind),
    Retried { attempts: u32, delay: Duration },
    DeadLettered { class: ErrorClass },
    Stale,
    /// The lease expired before the item was settled.
    LeaseLost,
}

impl Disposition {
    fn is_transient_failure(&self) -> bool {
        matches!(
            self,
            Disposition::Retried { .. }
                | Disposition::DeadLettered {
                    class: ErrorClass::TransientIo
                }
        )
    }
}

/// Settle a lease according to the handler's result.
pub async fn settle(
    queue: &dyn TaskQueue,
    lease: &Lease,
    result: PipelineResult<Option<WorkItem>>,
) -> PipelineResult<Disposition> {
    let item = &lease.item;
    let err = match result {
        Ok(None) => {
            return Ok(if queue.ack(lease).await? {
                Disposition::Completed
            } else {
                Disposition::LeaseLost
            })
        }
        Ok(Some(next)) => {
            let kind = next.kind;
            return Ok(if queue.ack_with_follow_up(lease, next).await? {
                Disposition::FollowedUp(kind)
            } else {
                Disposition::LeaseLost
            });
        }
        Err(err) => err,
    };

    match err.class() {
        ErrorClass::TransientIo => match queue.nack(lease, &err).await? {
            NackOutcome::Retried { attempts, delay } => {
                tracing::warn!(
                    item = %item.id,
                    kind = %item.kind,
                    content_id = %item.content_id,
                    version = item.version,
                    attempts,
                    retry_in = ?delay,
                    error = %err,
                    "work item failed, will retry"
                );
                Ok(Disposition::Retried { attempts, delay })
            }
            NackOutcome::DeadLettered { attempts } => {
                tracing::error!(
                    item = %item.id,
                    kind = %item.kind,
                    content_id = %item.content_id,
                    version = item.version,
                    attempts,
                    error = %err,
                    "work item dead-lettered after exhausting retries"
                );
                Ok(Disposition::DeadLettered {
                    class: ErrorClass::TransientIo,
                })
            }
            NackOutcome::LeaseLost => Ok(Disposition::LeaseLost),
        },
        ErrorClass::StaleWorkItem => {
            tracing::debug!(item = %item.id, error = %err, "stale work item acknowledged");
            queue.ack(lease).await?;
            Ok(Disposition::Stale)
        }
        class @ (ErrorClass::PermanentContent | ErrorClass::InvariantViolation) => {
            tracing::error!(
                item = %item.id,
                kind = %item.kind,
                content_id = %item.content_id,
                version = item.version,
                class = class.as_str(),
                error = %err,
                "work item dead-lettered"
            );
            Ok(if queue.dead_letter(lease, &err).await? {
                Disposition::DeadLettered { class }
            } else {
                Disposition::LeaseLost
            })
        }
    }
}

/// Counts from a [`Workers::drain`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub completed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub lease_lost: usize,
}

impl DrainReport {
    fn record(&mut self, disposition: Disposition) {
        self.processed += 1;
        match disposition {
            Disposition::Completed | Disposition::FollowedUp(_) | Disposition::Stale => {
                self.completed += 1
            }
            Disposition::Retried { .. } => self.retried += 1,
            Disposition::DeadLettered { .. } => self.dead_lettered += 1,
            Disposition::LeaseLost => self.lease_lost += 1,
        }
    }
}

/// Resolves once `shutdown` reads true or its sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Clone)]
pub struct Workers {
    queue: Arc<dyn TaskQueue>,
    extract: Arc<dyn Handler>,
    index: Arc<dyn Handler>,
    workers: WorkersConfig,
    queue_config: QueueConfig,
    permits: Arc<Semaphore>,
}

impl Workers {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        extract: Arc<dyn Handler>,
        index: Arc<dyn Handler>,
        workers: WorkersConfig,
        queue_config: QueueConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(workers.max_in_flight.max(1)));
        Self {
            queue,
            extract,
            index,
            workers,
            queue_config,
            permits,
        }
    }

    fn handler_for(&self, kind: WorkKind) -> &Arc<dyn Handler> {
        match kind {
            WorkKind::Extract => &self.extract,
            WorkKind::Index | WorkKind::Retract => &self.index,
        }
    }

    /// Lease and process one item of `kind`, if any is eligible.
    pub async fn process_one(&self, kind: WorkKind) -> PipelineResult<Option<Disposition>> {
        let Some(lease) = self
            .queue
            .lease(kind, self.queue_config.visibility_timeout())
            .await?
        else {
            return Ok(None);
        };
        let result = self.handler_for(kind).handle(&lease.item).await;
        settle(self.queue.as_ref(), &lease, result).await.map(Some)
    }

    /// Process until no eligible work remains. Items waiting out a retry
    /// delay are left for a later pass.
    pub async fn drain(&self) -> PipelineResult<DrainReport> {
        let mut report = DrainReport::default();
        loop {
            let before = report.processed;
            for kind in [WorkKind::Extract, WorkKind::Retract, WorkKind::Index] {
                while let Some(disposition) = self.process_one(kind).await? {
                    report.record(disposition);
                }
            }
            if report.processed == before {
                return Ok(report);
            }
        }
    }

    /// Run both worker pools until `shutdown` flips to true. In-flight leases
    /// are released, not failed, when shutdown interrupts a handler.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut set = JoinSet::new();
        for n in 0..self.workers.extract {
            let this = self.clone();
            let rx = shutdown.clone();
            set.spawn(async move { this.worker_loop(format!("extract-{}", n), &[WorkKind::Extract], rx).await });
        }
        for n in 0..self.workers.index {
            let this = self.clone();
            let rx = shutdown.clone();
            set.spawn(async move {
                this.worker_loop(format!("index-{}", n), &[WorkKind::Retract, WorkKind::Index], rx)
                    .await
            });
        }
        tracing::info!(
            extract = self.workers.extract,
            index = self.workers.index,
            max_in_flight = self.workers.max_in_flight,
            "workers started"
        );

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
        tracing::info!("workers stopped");
    }

    async fn worker_loop(&self, name: String, kinds: &[WorkKind], mut shutdown: watch::Receiver<bool>) {
        let floor = self.queue_config.poll_interval();
        let ceiling = Duration::from_millis(self.workers.idle_backoff_max_ms).max(floor);
        let mut backoff = floor;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_requested(&mut shutdown) => break,
            };

            // Lease calls run to completion; shutdown is checked on return.
            let lease = match self.next_lease(kinds).await {
                Ok(Some(lease)) if *shutdown.borrow() => {
                    self.release_on_shutdown(&name, &lease).await;
                    break;
                }
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    drop(permit);
                    backoff = (backoff * 2).min(ceiling);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown_requested(&mut shutdown) => break,
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(worker = %name, error = %e, "lease failed");
                    backoff = (backoff * 2).min(ceiling);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            let handler = self.handler_for(lease.item.kind).clone();
            let result = tokio::select! {
                result = handler.handle(&lease.item) => result,
                _ = shutdown_requested(&mut shutdown) => {
                    self.release_on_shutdown(&name, &lease).await;
                    break;
                }
            };

            match settle(self.queue.as_ref(), &lease, result).await {
                Ok(disposition) => {
                    drop(permit);
                    if disposition.is_transient_failure() {
                        // Collaborator is struggling: lease more slowly.
                        backoff = (backoff * 2).min(ceiling);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown_requested(&mut shutdown) => break,
                        }
                    } else {
                        backoff = floor;
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(worker = %name, item = %lease.item.id, error = %e, "failed to settle work item");
                }
            }
        }
        tracing::debug!(worker = %name, "worker exiting");
    }

    async fn release_on_shutdown(&self, name: &str, lease: &Lease) {
        match self.queue.release(lease).await {
            Ok(_) => tracing::debug!(worker = %name, item = %lease.item.id, "lease released on shutdown"),
            Err(e) => {
                tracing::warn!(worker = %name, item = %lease.item.id, error = %e, "release on shutdown failed")
            }
        }
    }

    /// Earlier kinds take priority; the last kind is leased with a blocking poll.
    async fn next_lease(&self, kinds: &[WorkKind]) -> PipelineResult<Option<Lease>> {
        let visibility = self.queue_config.visibility_timeout();
        let Some((last, rest)) = kinds.split_last() else {
            return Ok(None);
        };
        for kind in rest {
            if let Some(lease) = self.queue.lease(*kind, visibility).await? {
                return Ok(Some(lease));
            }
        }
        self.queue
            .lease_blocking(
                *last,
                visibility,
                self.queue_config.poll_interval(),
                self.queue_config.lease_poll_timeout(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::queue::InMemoryQueue;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        calls: AtomicU32,
        fail_first: u32,
        error: fn() -> PipelineError,
        follow_up: Option<WorkKind>,
    }

    impl Scripted {
        fn new(fail_first: u32, error: fn() -> PipelineError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                error,
                follow_up: None,
            }
        }
    }

    #[async_trait]
    impl Handler for Scripted {
        async fn handle(&self, item: &WorkItem) -> PipelineResult<Option<WorkItem>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err((self.error)());
            }
            Ok(self.follow_up.map(|k| item.follow_up(k)))
        }
    }

    fn queue_config() -> QueueConfig {
        QueueConfig {
            max_attempts: 3,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            poll_interval_ms: 5,
            lease_poll_timeout_ms: 20,
            ..QueueConfig::default()
        }
    }

    fn workers(queue: Arc<InMemoryQueue>, extract: Arc<dyn Handler>, index: Arc<dyn Handler>) -> Workers {
        Workers::new(
            queue,
            extract,
            index,
            WorkersConfig {
                extract: 1,
                index: 1,
                max_in_flight: 2,
                idle_backoff_max_ms: 20,
            },
            queue_config(),
        )
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let queue = Arc::new(InMemoryQueue::new(&queue_config()));
        queue
            .enqueue(WorkItem::new(WorkKind::Extract, "a", 1, "ev"))
            .await
            .unwrap();
        let extract = Arc::new(Scripted::new(2, || PipelineError::transient("503")));
        let w = workers(queue.clone(), extract.clone(), Arc::new(Scripted::new(0, || unreachable!())));

        let report = w.drain().await.unwrap();
        assert_eq!(report.retried, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(extract.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.depth().await.unwrap().active(), 0);
    }

    #[tokio::test]
    async fn exhausted_transient_failures_dead_letter() {
        let queue = Arc::new(InMemoryQueue::new(&queue_config()));
        queue
            .enqueue(WorkItem::new(WorkKind::Index, "a", 1, "ev"))
            .await
            .unwrap();
        let index = Arc::new(Scripted::new(u32::MAX, || PipelineError::transient("timeout")));
        let w = workers(queue.clone(), Arc::new(Scripted::new(0, || unreachable!())), index);

        let report = w.drain().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].last_error_class, Some(ErrorClass::TransientIo));
    }

    #[tokio::test]
    async fn permanent_errors_skip_retries() {
        let queue = Arc::new(InMemoryQueue::new(&queue_config()));
        queue
            .enqueue(WorkItem::new(WorkKind::Index, "a", 1, "ev"))
            .await
            .unwrap();
        let index = Arc::new(Scripted::new(1, || PipelineError::invariant("gap")));
        let w = workers(queue.clone(), Arc::new(Scripted::new(0, || unreachable!())), index.clone());

        let report = w.drain().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(index.calls.load(Ordering::SeqCst), 1);
        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead[0].last_error_class, Some(ErrorClass::InvariantViolation));
    }

    #[tokio::test]
    async fn follow_ups_chain_through_drain() {
        let queue = Arc::new(InMemoryQueue::new(&queue_config()));
        queue
            .enqueue(WorkItem::new(WorkKind::Extract, "a", 1, "ev"))
            .await
            .unwrap();
        let mut extract = Scripted::new(0, || unreachable!());
        extract.follow_up = Some(WorkKind::Index);
        let index = Arc::new(Scripted::new(0, || unreachable!()));
        let w = workers(queue.clone(), Arc::new(extract), index.clone());

        let report = w.drain().await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(index.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_items_are_acknowledged() {
        let queue = Arc::new(InMemoryQueue::new(&queue_config()));
        queue
            .enqueue(WorkItem::new(WorkKind::Index, "a", 1, "ev"))
            .await
            .unwrap();
        let index = Arc::new(Scripted::new(1, || PipelineError::Stale {
            content_id: "a".into(),
            version: 1,
            indexed: 2,
        }));
        let w = workers(queue.clone(), Arc::new(Scripted::new(0, || unreachable!())), index.clone());

        assert_eq!(w.process_one(WorkKind::Index).await.unwrap(), Some(Disposition::Stale));
        assert_eq!(index.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.depth().await.unwrap(), crate::queue::QueueDepth::default());
    }

    /// Never finishes on its own.
    struct Hangs {
        started: AtomicU32,
    }

    #[async_trait]
    impl Handler for Hangs {
        async fn handle(&self, _item: &WorkItem) -> PipelineResult<Option<WorkItem>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn shutdown_releases_in_flight_lease_without_an_attempt() {
        let queue = Arc::new(InMemoryQueue::new(&queue_config()));
        queue
            .enqueue(WorkItem::new(WorkKind::Extract, "a", 1, "ev"))
            .await
            .unwrap();
        let extract = Arc::new(Hangs {
            started: AtomicU32::new(0),
        });
        let w = workers(queue.clone(), extract.clone(), Arc::new(Scripted::new(0, || unreachable!())));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { w.run(rx).await });
        for _ in 0..100 {
            if extract.started.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(extract.started.load(Ordering::SeqCst), 1);
        assert_eq!(queue.depth().await.unwrap().in_flight, 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let again = queue
            .lease(WorkKind::Extract, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.item.attempts, 0);
        assert!(again.item.last_error_class.is_none());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let queue = Arc::new(InMemoryQueue::new(&queue_config()));
        queue
            .enqueue(WorkItem::new(WorkKind::Extract, "a", 1, "ev"))
            .await
            .unwrap();
        let extract = Arc::new(Scripted::new(0, || unreachable!()));
        let w = workers(queue.clone(), extract.clone(), Arc::new(Scripted::new(0, || unreachable!())));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { w.run(rx).await });
        for _ in 0..100 {
            if extract.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(extract.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.depth().await.unwrap().active(), 0);
    }
}

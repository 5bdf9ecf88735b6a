//! `csync relay`, `work`, `reconcile` and `dead-letters`.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;

use crate::context::PipelineContext;
use crate::queue::dead_letter_report;

/// Flip the shutdown flag on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        let _ = tx.send(true);
    });
    rx
}

pub async fn run_relay(ctx: &PipelineContext, watch: bool) -> Result<()> {
    let relay = ctx.relay();
    if watch {
        let interval = Duration::from_millis(ctx.config.relay.interval_ms);
        relay.run(interval, shutdown_on_ctrl_c()).await;
        return Ok(());
    }

    let report = relay.drain().await?;
    println!("Relayed {} outbox row(s).", report.relayed);
    if report.backpressured {
        println!(
            "Queue is full; {} row(s) remain in the outbox.",
            relay.pending().await?
        );
    }
    Ok(())
}

/// Run relay and workers. With `drain`, stop once no eligible work remains.
pub async fn run_work(ctx: &PipelineContext, drain: bool) -> Result<()> {
    let relay = ctx.relay();
    let workers = ctx.workers();

    if drain {
        let mut relayed = 0;
        let mut processed = 0;
        let mut dead_lettered = 0;
        let mut retried = 0;
        loop {
            let r = relay.drain().await?;
            let w = workers.drain().await?;
            relayed += r.relayed;
            processed += w.processed;
            dead_lettered += w.dead_lettered;
            retried += w.retried;
            if r.relayed == 0 && w.processed == 0 {
                break;
            }
        }
        println!(
            "Relayed {}, processed {} work item(s): {} retried, {} dead-lettered.",
            relayed, processed, retried, dead_lettered
        );
        let depth = ctx.queue.depth().await?;
        if depth.delayed > 0 {
            println!("{} item(s) are waiting out a retry delay.", depth.delayed);
        }
        return Ok(());
    }

    let shutdown = shutdown_on_ctrl_c();
    let interval = Duration::from_millis(ctx.config.relay.interval_ms);
    tokio::join!(relay.run(interval, shutdown.clone()), workers.run(shutdown));
    Ok(())
}

pub async fn run_reconcile(ctx: &PipelineContext, watch: bool) -> Result<()> {
    let reconciler = ctx.reconciler();
    if watch {
        reconciler
            .run(ctx.config.reconciler.interval(), shutdown_on_ctrl_c())
            .await;
        return Ok(());
    }

    let report = reconciler.reconcile_once().await?;
    println!("Scanned {} ledger head(s).", report.scanned);
    println!("  re-indexed:   {}", report.reindexed);
    println!("  retracted:    {}", report.retracted);
    println!("  in flight:    {}", report.in_flight);
    println!("  orphans:      {}", report.orphans);
    println!("  regressions:  {}", report.regressions);
    if report.skipped_full > 0 {
        println!("  skipped (queue full): {}", report.skipped_full);
    }
    Ok(())
}

pub async fn run_dead_letters(ctx: &PipelineContext, limit: usize) -> Result<()> {
    let report = dead_letter_report(ctx.queue.as_ref(), limit).await?;
    if report.count == 0 {
        println!("No dead-lettered work items.");
        return Ok(());
    }

    println!("{} dead-lettered work item(s):", report.count);
    println!();
    for e in &report.entries {
        println!(
            "{}  {} {} v{}  attempts={}  reason={}",
            e.id,
            e.kind,
            e.content_id,
            e.version,
            e.attempts,
            e.reason.map(|c| c.as_str()).unwrap_or("unknown")
        );
        if let Some(ref err) = e.last_error {
            println!("    {}", err);
        }
    }
    Ok(())
}

pub async fn run_requeue(ctx: &PipelineContext, id: &str) -> Result<()> {
    if !ctx.queue.requeue_dead_letter(id).await? {
        anyhow::bail!("no dead-lettered work item with id '{}'", id);
    }
    println!("Requeued {}.", id);
    Ok(())
}

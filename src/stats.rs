//! Pipeline statistics and health overview.
//!
//! One screen that answers "is the index keeping up?": store and ledger
//! sizes, outbox backlog, queue depth by state, extraction outcomes, and
//! how much of the catalog is live in the index. Used by `csync stats`.

use anyhow::Result;

use crate::context::PipelineContext;

/// Run the stats command: query every stage and print a summary.
pub async fn run_stats(ctx: &PipelineContext) -> Result<()> {
    let pool = &ctx.pool;

    let total_items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content_items")
        .fetch_one(pool)
        .await?;
    let deleted_items: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM content_items WHERE deleted = 1")
            .fetch_one(pool)
            .await?;
    let total_events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM version_events")
        .fetch_one(pool)
        .await?;
    let last_event_ms: Option<i64> = sqlx::query_scalar("SELECT MAX(created_at) FROM version_events")
        .fetch_one(pool)
        .await?;

    let pending_outbox = ctx.relay().pending().await?;
    let depth = ctx.queue.depth().await?;
    let extraction = ctx.extraction_store().count_by_status().await?;
    let index = ctx.index.counts().await?;

    let db_size = std::fs::metadata(&ctx.config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    let live_items = (total_items - deleted_items).max(0) as u64;

    println!("Content Sync: Pipeline Stats");
    println!("=============================");
    println!();
    println!("  Database:    {}", ctx.config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Content:     {} ({} deleted)", total_items, deleted_items);
    println!(
        "  Ledger:      {} events, last {}",
        total_events,
        last_event_ms
            .map(|ms| format_ts_relative(ms / 1000))
            .unwrap_or_else(|| "never".to_string())
    );
    println!("  Outbox:      {} pending", pending_outbox);
    println!();
    println!("  Queue:");
    println!("    ready:         {}", depth.ready);
    println!("    delayed:       {}", depth.delayed);
    println!("    in flight:     {}", depth.in_flight);
    println!("    dead-lettered: {}", depth.dead_lettered);

    if !extraction.is_empty() {
        println!();
        println!("  Extractions:");
        for (status, count) in &extraction {
            println!("    {:<14} {}", format!("{}:", status), count);
        }
    }

    println!();
    println!(
        "  Indexed:     {} / {} live ({}%), {} retracted",
        index.live,
        live_items,
        if live_items > 0 {
            (index.live * 100) / live_items
        } else {
            0
        },
        index.retracted
    );
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Relative time for a Unix timestamp in seconds (e.g. "3 hours ago").
pub(crate) fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    let (n, unit) = match delta {
        0..=59 => return "just now".to_string(),
        60..=3599 => (delta / 60, "min"),
        3600..=86_399 => (delta / 3600, "hour"),
        86_400..=2_591_999 => (delta / 86_400, "day"),
        _ => return format_ts_iso(ts),
    };
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

pub(crate) fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scale() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_times() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now - 5), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
    }
}

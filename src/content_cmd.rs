//! `csync content`, `csync history` and `csync status`.

use anyhow::Result;

use crate::capture::{ContentPatch, NewContent};
use crate::context::PipelineContext;
use crate::models::{ContentKind, VersionEvent};
use crate::stats::format_ts_iso;

fn print_event(action: &str, event: &VersionEvent) {
    println!(
        "{} {} v{} ({}, event {})",
        action,
        event.content_id,
        event.version,
        event.operation.as_str(),
        event.id
    );
}

pub async fn run_create(
    ctx: &PipelineContext,
    id: Option<String>,
    kind: &str,
    source_ref: String,
    title: String,
    description: Option<String>,
) -> Result<()> {
    let kind: ContentKind = kind.parse()?;
    let event = ctx
        .capture()
        .create(NewContent {
            id,
            kind,
            source_ref,
            title,
            description,
        })
        .await?;
    print_event("Created", &event);
    Ok(())
}

pub async fn run_update(ctx: &PipelineContext, id: &str, patch: ContentPatch) -> Result<()> {
    if patch.is_empty() {
        anyhow::bail!("nothing to update: pass --title, --description or --source");
    }
    let event = ctx.capture().update(id, patch).await?;
    print_event("Updated", &event);
    Ok(())
}

pub async fn run_delete(ctx: &PipelineContext, id: &str) -> Result<()> {
    let event = ctx.capture().soft_delete(id).await?;
    print_event("Deleted", &event);
    Ok(())
}

pub async fn run_restore(ctx: &PipelineContext, id: &str) -> Result<()> {
    let event = ctx.capture().restore(id).await?;
    print_event("Restored", &event);
    Ok(())
}

pub async fn run_history(ctx: &PipelineContext, id: &str) -> Result<()> {
    let events = ctx.ledger().history(id).await?;
    if events.is_empty() {
        anyhow::bail!("no ledger history for '{}'", id);
    }

    println!("{:>4}  {:<8} {:<17} {}", "VER", "OP", "AT", "TITLE");
    for e in &events {
        println!(
            "{:>4}  {:<8} {:<17} {}{}",
            e.version,
            e.operation.as_str(),
            format_ts_iso(e.created_at / 1000),
            e.payload.title,
            if e.payload.deleted { " (deleted)" } else { "" }
        );
    }
    Ok(())
}

/// Ledger head versus indexed version for one identifier.
pub async fn run_status(ctx: &PipelineContext, id: &str) -> Result<()> {
    let Some(head) = ctx.ledger().head(id).await? else {
        anyhow::bail!("no ledger history for '{}'", id);
    };
    let indexed = ctx.index.get_version(id).await?;
    let extraction = ctx.extraction_store().get(id, head.version).await?;
    let queued = ctx.queue.has_active(id).await?;

    println!("id:          {}", id);
    println!("kind:        {}", head.payload.kind);
    println!("ledger head: v{} ({})", head.version, head.operation.as_str());
    match indexed {
        Some(iv) if iv.retracted => println!("index:       retracted at v{}", iv.version),
        Some(iv) => println!("index:       v{}", iv.version),
        None => println!("index:       absent"),
    }
    match extraction {
        Some(r) => println!(
            "extraction:  {}{}",
            r.status.as_str(),
            r.error.map(|e| format!(" ({})", e)).unwrap_or_default()
        ),
        None => println!("extraction:  none for v{}", head.version),
    }
    println!("queued work: {}", if queued { "yes" } else { "no" });

    let converged = match indexed {
        Some(iv) => iv.version == head.version,
        None => head.payload.deleted,
    };
    println!("converged:   {}", if converged { "yes" } else { "no" });
    Ok(())
}

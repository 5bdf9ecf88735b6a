//! Keyword search and completion over the search index.

use anyhow::Result;

use crate::context::PipelineContext;

const DEFAULT_LIMIT: usize = 10;

/// CLI entry point for `csync search`.
pub async fn run_search(ctx: &PipelineContext, query: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("search query must not be empty");
    }

    let hits = ctx.index.search(query, limit.unwrap_or(DEFAULT_LIMIT)).await?;
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let title = if hit.title.is_empty() {
            "(untitled)"
        } else {
            hit.title.as_str()
        };
        println!("{}. [{:.2}] {} / {}", i + 1, hit.score, hit.kind, title);
        println!("    version: {}", hit.version);
        if !hit.snippet.trim().is_empty() {
            println!("    excerpt: \"{}\"", hit.snippet.replace('\n', " ").trim());
        }
        println!("    id: {}", hit.content_id);
        println!();
    }
    Ok(())
}

/// CLI entry point for `csync suggest`.
pub async fn run_suggest(ctx: &PipelineContext, prefix: &str, limit: Option<usize>) -> Result<()> {
    let suggestions = ctx.index.suggest(prefix, limit.unwrap_or(DEFAULT_LIMIT)).await?;
    if suggestions.is_empty() {
        println!("No suggestions.");
        return Ok(());
    }
    for s in suggestions {
        println!("{}", s);
    }
    Ok(())
}

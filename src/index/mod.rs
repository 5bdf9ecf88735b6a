//! Search index abstraction.
//!
//! The index holds at most one [`IndexDocument`] per content identifier.
//! Writes are version-conditional: [`SearchIndex::upsert`] applies only when
//! the incoming version is strictly newer than what is recorded, and
//! [`SearchIndex::retract`] applies only when the recorded version is not
//! newer than the delete. Retracting leaves a tombstone carrying the delete
//! version, so a late-arriving older upsert still loses. Because every write
//! is a compare-and-set on version, concurrent writers for one identifier
//! commute.
//!
//! | Backend | Module |
//! |---------|--------|
//! | SQLite + FTS5 | [`sqlite`] |
//! | In-process map | [`memory`] |

pub mod memory;
pub mod sqlite;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::PipelineResult;
use crate::models::{IndexDocument, IndexedVersion};

pub use memory::InMemoryIndex;
pub use sqlite::SqliteIndex;

/// Result of a version-conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The index already holds this or a newer version.
    Stale { indexed: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub content_id: String,
    pub version: i64,
    pub kind: String,
    pub title: String,
    pub score: f64,
    pub snippet: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexCounts {
    pub live: u64,
    pub retracted: u64,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Recorded version for an identifier, tombstones included.
    async fn get_version(&self, content_id: &str) -> PipelineResult<Option<IndexedVersion>>;

    /// The live document, if any. Tombstones read as absent.
    async fn get(&self, content_id: &str) -> PipelineResult<Option<IndexDocument>>;

    async fn upsert(&self, doc: &IndexDocument) -> PipelineResult<ApplyOutcome>;

    async fn retract(&self, content_id: &str, version: i64) -> PipelineResult<ApplyOutcome>;

    /// Recorded versions ordered by identifier, starting strictly after `after`.
    async fn entries(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> PipelineResult<Vec<(String, IndexedVersion)>>;

    async fn search(&self, query: &str, limit: usize) -> PipelineResult<Vec<SearchHit>>;

    /// Completion inputs starting with `prefix`, shortest first.
    async fn suggest(&self, prefix: &str, limit: usize) -> PipelineResult<Vec<String>>;

    async fn counts(&self) -> PipelineResult<IndexCounts>;
}

/// Caption lines shorter than this are not offered as completions.
const MIN_SUGGEST_SENTENCE: usize = 5;
const MAX_SUGGEST_SENTENCES: usize = 100;

/// Completion inputs for a document: the title and description phrases,
/// their distinct words of two or more characters, and the shortest caption
/// lines.
pub fn suggest_inputs(title: &str, description: Option<&str>, captions: &[&str]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let mut push = |s: &str| {
        let s = s.trim();
        if !s.is_empty() && seen.insert(s.to_lowercase()) {
            out.push(s.to_string());
        }
    };

    push(title);
    if let Some(d) = description {
        push(d);
    }
    for text in std::iter::once(title).chain(description) {
        for word in text.split_whitespace() {
            let word = word.trim_matches(|c: char| !c.is_alphanumeric());
            if word.chars().count() >= 2 {
                push(word);
            }
        }
    }

    let mut sentences: Vec<&str> = captions
        .iter()
        .map(|l| l.trim())
        .filter(|l| l.chars().count() >= MIN_SUGGEST_SENTENCE)
        .collect();
    sentences.sort_by_key(|l| l.len());
    for line in sentences.into_iter().take(MAX_SUGGEST_SENTENCES) {
        push(line);
    }
    out
}

/// Turn free text into an FTS5 query that matches all terms.
///
/// Terms are quoted so operators and punctuation in user input are never
/// parsed as query syntax.
pub fn fts_query(raw: &str) -> Option<String> {
    let terms: Vec<String> = raw
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggestions_cover_phrases_and_words() {
        let inputs = suggest_inputs(
            "Intro to Rust",
            Some("Ownership & borrowing"),
            &["ok", "Welcome everyone", "Today we cover lifetimes"],
        );
        assert_eq!(
            inputs,
            vec![
                "Intro to Rust",
                "Ownership & borrowing",
                "Intro",
                "to",
                "Rust",
                "Ownership",
                "borrowing",
                "Welcome everyone",
                "Today we cover lifetimes",
            ]
        );
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(fts_query("cell-division OR \"x\"").as_deref(), Some("\"cell\" \"division\" \"OR\" \"x\""));
        assert_eq!(fts_query(" -* "), None);
    }
}

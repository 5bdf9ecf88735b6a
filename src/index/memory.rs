//! In-process search index with the same version-conditional semantics as
//! [`super::SqliteIndex`]. Keyword search is a plain term match, good enough
//! for tests and small embedded catalogs.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{ApplyOutcome, IndexCounts, SearchHit, SearchIndex};
use crate::error::PipelineResult;
use crate::models::{ContentKind, ExtractionStatus, IndexDocument, IndexedVersion};

#[derive(Default)]
pub struct InMemoryIndex {
    docs: RwLock<BTreeMap<String, IndexDocument>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, IndexDocument>> {
        match self.docs.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, IndexDocument>> {
        match self.docs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn tombstone(content_id: &str, version: i64, previous: Option<IndexDocument>) -> IndexDocument {
    let (kind, title) = previous
        .map(|d| (d.kind, d.title))
        .unwrap_or((ContentKind::Document, String::new()));
    IndexDocument {
        content_id: content_id.to_string(),
        version,
        kind,
        title,
        description: None,
        body: String::new(),
        metadata: serde_json::json!({}),
        suggest: Vec::new(),
        extraction_status: ExtractionStatus::Success,
        retracted: true,
        indexed_at: chrono::Utc::now().timestamp_millis(),
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn get_version(&self, content_id: &str) -> PipelineResult<Option<IndexedVersion>> {
        Ok(self.read().get(content_id).map(|d| IndexedVersion {
            version: d.version,
            retracted: d.retracted,
        }))
    }

    async fn get(&self, content_id: &str) -> PipelineResult<Option<IndexDocument>> {
        Ok(self.read().get(content_id).filter(|d| !d.retracted).cloned())
    }

    async fn upsert(&self, doc: &IndexDocument) -> PipelineResult<ApplyOutcome> {
        let mut docs = self.write();
        if let Some(current) = docs.get(&doc.content_id) {
            if doc.version <= current.version {
                return Ok(ApplyOutcome::Stale {
                    indexed: current.version,
                });
            }
        }
        let mut stored = doc.clone();
        stored.retracted = false;
        docs.insert(doc.content_id.clone(), stored);
        Ok(ApplyOutcome::Applied)
    }

    async fn retract(&self, content_id: &str, version: i64) -> PipelineResult<ApplyOutcome> {
        let mut docs = self.write();
        if let Some(current) = docs.get(content_id) {
            if current.version > version {
                return Ok(ApplyOutcome::Stale {
                    indexed: current.version,
                });
            }
        }
        let previous = docs.remove(content_id);
        docs.insert(content_id.to_string(), tombstone(content_id, version, previous));
        Ok(ApplyOutcome::Applied)
    }

    async fn entries(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> PipelineResult<Vec<(String, IndexedVersion)>> {
        let docs = self.read();
        let start = after.unwrap_or("");
        Ok(docs
            .iter()
            .filter(|(id, _)| id.as_str() > start)
            .take(limit)
            .map(|(id, d)| {
                (
                    id.clone(),
                    IndexedVersion {
                        version: d.version,
                        retracted: d.retracted,
                    },
                )
            })
            .collect())
    }

    async fn search(&self, query: &str, limit: usize) -> PipelineResult<Vec<SearchHit>> {
        let terms: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let docs = self.read();
        let mut hits: Vec<SearchHit> = docs
            .values()
            .filter(|d| !d.retracted)
            .filter_map(|d| {
                let haystack = format!(
                    "{} {} {}",
                    d.title,
                    d.description.as_deref().unwrap_or(""),
                    d.body
                )
                .to_lowercase();
                let mut score = 0.0;
                for term in &terms {
                    let n = haystack.matches(term.as_str()).count();
                    if n == 0 {
                        return None;
                    }
                    score += n as f64;
                }
                Some(SearchHit {
                    content_id: d.content_id.clone(),
                    version: d.version,
                    kind: d.kind.as_str().to_string(),
                    title: d.title.clone(),
                    score,
                    snippet: d.body.chars().take(120).collect(),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.content_id.cmp(&b.content_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn suggest(&self, prefix: &str, limit: usize) -> PipelineResult<Vec<String>> {
        let prefix = prefix.trim().to_lowercase();
        if prefix.is_empty() {
            return Ok(Vec::new());
        }
        let docs = self.read();
        let mut seen = std::collections::HashSet::new();
        let mut out: Vec<String> = docs
            .values()
            .filter(|d| !d.retracted)
            .flat_map(|d| d.suggest.iter())
            .filter(|s| s.to_lowercase().starts_with(&prefix))
            .filter(|s| seen.insert(s.to_lowercase()))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.len().cmp(&b.len()).then(a.cmp(b)));
        out.truncate(limit);
        Ok(out)
    }

    async fn counts(&self) -> PipelineResult<IndexCounts> {
        let docs = self.read();
        let retracted = docs.values().filter(|d| d.retracted).count() as u64;
        Ok(IndexCounts {
            live: docs.len() as u64 - retracted,
            retracted,
        })
    }
}

//! Core data models used throughout the pipeline.
//!
//! These types represent the content records, ledger events, derived
//! artifacts and queue entries that flow from a committed mutation to the
//! search index.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorClass, PipelineError};

/// Closed set of learning-content kinds. Each kind has exactly one extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Document,
    Video,
    Assignment,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Document => "document",
            ContentKind::Video => "video",
            ContentKind::Assignment => "assignment",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(ContentKind::Document),
            "video" => Ok(ContentKind::Video),
            "assignment" => Ok(ContentKind::Assignment),
            other => Err(PipelineError::permanent(format!(
                "unknown content kind '{}'. Must be document, video, or assignment.",
                other
            ))),
        }
    }
}

/// Mutation recorded by a [`VersionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl FromStr for Operation {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(PipelineError::invariant(format!(
                "unknown ledger operation '{}'",
                other
            ))),
        }
    }
}

/// The addressable unit of learning content, as held by the store of record.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentItem {
    pub id: String,
    pub version: i64,
    pub kind: ContentKind,
    /// Opaque handle to object storage, a URL, or inline text.
    pub source_ref: String,
    pub title: String,
    pub description: Option<String>,
    pub deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ContentItem {
    pub fn snapshot(&self) -> ContentSnapshot {
        ContentSnapshot {
            kind: self.kind,
            source_ref: self.source_ref.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            deleted: self.deleted,
        }
    }
}

/// Payload snapshot stored with every ledger event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSnapshot {
    pub kind: ContentKind,
    pub source_ref: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

/// Immutable record of one committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionEvent {
    pub id: String,
    pub content_id: String,
    /// Strictly increasing, gap-free per `content_id`.
    pub version: i64,
    pub operation: Operation,
    pub created_at: i64,
    pub payload: ContentSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Success,
    Failed,
    Unsupported,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Success => "success",
            ExtractionStatus::Failed => "failed",
            ExtractionStatus::Unsupported => "unsupported",
        }
    }
}

impl FromStr for ExtractionStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExtractionStatus::Success),
            "failed" => Ok(ExtractionStatus::Failed),
            "unsupported" => Ok(ExtractionStatus::Unsupported),
            other => Err(PipelineError::invariant(format!(
                "unknown extraction status '{}'",
                other
            ))),
        }
    }
}

/// Derived artifact keyed by `(content_id, version)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub content_id: String,
    pub version: i64,
    pub status: ExtractionStatus,
    pub text: String,
    pub metadata: serde_json::Value,
    pub content_hash: String,
    pub error: Option<String>,
    pub extracted_at: i64,
}

/// Projection stored in the search index. At most one per `content_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDocument {
    pub content_id: String,
    pub version: i64,
    pub kind: ContentKind,
    pub title: String,
    pub description: Option<String>,
    pub body: String,
    pub metadata: serde_json::Value,
    pub suggest: Vec<String>,
    pub extraction_status: ExtractionStatus,
    pub retracted: bool,
    pub indexed_at: i64,
}

/// Version recorded in the index for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedVersion {
    pub version: i64,
    pub retracted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkKind {
    Extract,
    Index,
    Retract,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Extract => "extract",
            WorkKind::Index => "index",
            WorkKind::Retract => "retract",
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extract" => Ok(WorkKind::Extract),
            "index" => Ok(WorkKind::Index),
            "retract" => Ok(WorkKind::Retract),
            other => Err(PipelineError::invariant(format!(
                "unknown work kind '{}'",
                other
            ))),
        }
    }
}

/// One unit of queued pipeline work referencing a [`VersionEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: String,
    pub kind: WorkKind,
    pub content_id: String,
    pub version: i64,
    pub event_id: String,
    pub attempts: u32,
    /// Unix milliseconds before which the item is not leasable.
    pub next_eligible_at: i64,
    pub dead_lettered: bool,
    pub last_error: Option<String>,
    pub last_error_class: Option<ErrorClass>,
    pub created_at: i64,
}

impl WorkItem {
    pub fn new(kind: WorkKind, content_id: &str, version: i64, event_id: &str) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content_id: content_id.to_string(),
            version,
            event_id: event_id.to_string(),
            attempts: 0,
            next_eligible_at: now,
            dead_lettered: false,
            last_error: None,
            last_error_class: None,
            created_at: now,
        }
    }

    pub fn for_event(kind: WorkKind, event: &VersionEvent) -> Self {
        Self::new(kind, &event.content_id, event.version, &event.id)
    }

    /// Follow-up item of another kind for the same ledger event.
    pub fn follow_up(&self, kind: WorkKind) -> Self {
        Self::new(kind, &self.content_id, self.version, &self.event_id)
    }
}

/// First work item a mutation needs: deletes retract, everything else extracts.
pub fn initial_work_kind(operation: Operation) -> WorkKind {
    match operation {
        Operation::Delete => WorkKind::Retract,
        Operation::Create | Operation::Update => WorkKind::Extract,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_routes_to_retract() {
        assert_eq!(initial_work_kind(Operation::Delete), WorkKind::Retract);
        assert_eq!(initial_work_kind(Operation::Update), WorkKind::Extract);
    }

    #[test]
    fn follow_up_keeps_event_reference() {
        let item = WorkItem::new(WorkKind::Extract, "c1", 3, "ev-3");
        let next = item.follow_up(WorkKind::Index);
        assert_eq!(next.kind, WorkKind::Index);
        assert_eq!(next.version, 3);
        assert_eq!(next.event_id, "ev-3");
        assert_ne!(next.id, item.id);
        assert_eq!(next.attempts, 0);
    }

    #[test]
    fn unknown_kind_is_permanent() {
        let err = "podcast".parse::<ContentKind>().unwrap_err();
        assert_eq!(err.class(), ErrorClass::PermanentContent);
    }
}

//! Pipeline error types.
//!
//! Every failure the pipeline can produce maps onto one of four classes
//! ([`ErrorClass`]). The class, not the variant, decides what a worker does
//! with the work item: retry, degrade to metadata-only, discard, or
//! dead-letter.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Failure classification shared by workers, the queue and the dead-letter surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network or timeout failure from a collaborator. Retried with backoff.
    TransientIo,
    /// Unsupported or corrupt content. Never retried.
    PermanentContent,
    /// The work item was superseded by a newer applied version.
    StaleWorkItem,
    /// A version gap or regression outside normal stale handling.
    InvariantViolation,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientIo => "TransientIO",
            ErrorClass::PermanentContent => "PermanentContent",
            ErrorClass::StaleWorkItem => "StaleWorkItem",
            ErrorClass::InvariantViolation => "InvariantViolation",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::TransientIo)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TransientIO" => Ok(ErrorClass::TransientIo),
            "PermanentContent" => Ok(ErrorClass::PermanentContent),
            "StaleWorkItem" => Ok(ErrorClass::StaleWorkItem),
            "InvariantViolation" => Ok(ErrorClass::InvariantViolation),
            other => Err(PipelineError::invariant(format!(
                "unknown error class '{}'",
                other
            ))),
        }
    }
}

/// Errors produced by the versioning and synchronization pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("permanent content failure: {0}")]
    PermanentContent(String),

    #[error("stale work item for {content_id}: version {version} <= indexed {indexed}")]
    Stale {
        content_id: String,
        version: i64,
        indexed: i64,
    },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("content not found: {0}")]
    ContentNotFound(String),

    #[error("content already exists: {0}")]
    ContentExists(String),

    #[error("content is deleted: {0}")]
    ContentDeleted(String),

    #[error("queue is full: depth {depth} >= max {max}")]
    QueueFull { depth: u64, max: u64 },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::PermanentContent(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::TransientIo(_)
            | PipelineError::QueueFull { .. }
            | PipelineError::Timeout(_)
            | PipelineError::Database(_) => ErrorClass::TransientIo,
            PipelineError::PermanentContent(_)
            | PipelineError::ContentNotFound(_)
            | PipelineError::ContentExists(_)
            | PipelineError::ContentDeleted(_)
            | PipelineError::Serialization(_) => ErrorClass::PermanentContent,
            PipelineError::Stale { .. } => ErrorClass::StaleWorkItem,
            PipelineError::InvariantViolation(_) => ErrorClass::InvariantViolation,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

//! Kind-specific text extraction.
//!
//! Each [`ContentKind`] has exactly one [`Extractor`]. Dispatch is an
//! exhaustive match over the closed kind set held in [`ExtractorSet`];
//! adding a kind means adding a variant and an extractor, and the compiler
//! points at every place that needs one.
//!
//! Extractors take resolved bytes plus a content type and return normalized
//! text and structured metadata. Failures are classified:
//!
//! - [`ExtractError::Unsupported`]: the format is not handled for this kind.
//! - [`ExtractError::Corrupt`]: the payload claims a format but doesn't parse.
//! - [`ExtractError::Transient`]: an external extraction service was unreachable.

pub mod assignment;
pub mod document;
pub mod video;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::ContentKind;
use crate::resolve::ResolvedSource;

pub use assignment::AssignmentExtractor;
pub use document::DocumentExtractor;
pub use video::VideoExtractor;

/// Normalized extraction output.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub text: String,
    pub metadata: serde_json::Value,
}

impl Extracted {
    /// No text and no metadata: what a metadata-only index entry is built from.
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            metadata: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content type '{0}'")]
    Unsupported(String),
    #[error("corrupt payload: {0}")]
    Corrupt(String),
    #[error("extraction unavailable: {0}")]
    Transient(String),
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, source: &ResolvedSource) -> Result<Extracted, ExtractError>;
}

/// One extractor per content kind.
#[derive(Clone)]
pub struct ExtractorSet {
    document: Arc<dyn Extractor>,
    video: Arc<dyn Extractor>,
    assignment: Arc<dyn Extractor>,
}

impl ExtractorSet {
    pub fn builtin() -> Self {
        Self {
            document: Arc::new(DocumentExtractor),
            video: Arc::new(VideoExtractor),
            assignment: Arc::new(AssignmentExtractor),
        }
    }

    /// Replace the extractor for one kind.
    pub fn with(mut self, kind: ContentKind, extractor: Arc<dyn Extractor>) -> Self {
        match kind {
            ContentKind::Document => self.document = extractor,
            ContentKind::Video => self.video = extractor,
            ContentKind::Assignment => self.assignment = extractor,
        }
        self
    }

    pub fn for_kind(&self, kind: ContentKind) -> &dyn Extractor {
        match kind {
            ContentKind::Document => self.document.as_ref(),
            ContentKind::Video => self.video.as_ref(),
            ContentKind::Assignment => self.assignment.as_ref(),
        }
    }
}

impl Default for ExtractorSet {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Decode bytes as UTF-8, failing as corrupt rather than lossy-replacing.
pub(crate) fn utf8(bytes: &[u8]) -> Result<&str, ExtractError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ExtractError::Corrupt(format!("invalid UTF-8: {}", e)))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

/// Collapse runs of whitespace into single spaces.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Decode the handful of HTML entities that show up in course material.
pub(crate) fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl Extractor for Fixed {
        async fn extract(&self, _source: &ResolvedSource) -> Result<Extracted, ExtractError> {
            Ok(Extracted {
                text: "fixed".into(),
                metadata: serde_json::json!({}),
            })
        }
    }

    #[tokio::test]
    async fn dispatch_is_per_kind() {
        let set = ExtractorSet::builtin().with(ContentKind::Video, Arc::new(Fixed));
        let src = ResolvedSource::inline("hello   world");

        let video = set.for_kind(ContentKind::Video).extract(&src).await.unwrap();
        assert_eq!(video.text, "fixed");

        let doc = set.for_kind(ContentKind::Document).extract(&src).await.unwrap();
        assert_eq!(doc.text, "hello world");
    }

    #[test]
    fn entities_decode_once() {
        assert_eq!(decode_entities("a &amp;lt; b"), "a &lt; b");
        assert_eq!(normalize_whitespace("  a \n\t b "), "a b");
    }

    #[test]
    fn invalid_utf8_is_corrupt() {
        assert!(matches!(utf8(&[0xff, 0xfe, 0x00]), Err(ExtractError::Corrupt(_))));
    }
}

//! Raw-source resolution.
//!
//! A content item's `source_ref` is an opaque handle. [`SourceResolver`]
//! turns it into bytes plus a content type for the extractors.
//!
//! Supported references:
//!
//! | Reference | Source |
//! |-----------|--------|
//! | `object://<key>` | file under `extraction.object_root` |
//! | `file://<path>` | local file |
//! | `http://…`, `https://…` | fetched with `reqwest` |
//! | `inline:<text>` | the text after the prefix, as `text/plain` |
//!
//! Missing sources are permanent failures; unreachable ones are transient.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ExtractionConfig;
use crate::error::PipelineError;

/// Raw bytes of a content item's source.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub bytes: Vec<u8>,
    /// MIME type without parameters, lowercased.
    pub content_type: String,
    /// Human-readable location, for logs and metadata.
    pub locator: String,
}

impl ResolvedSource {
    pub fn inline(text: &str) -> Self {
        Self {
            bytes: text.as_bytes().to_vec(),
            content_type: "text/plain".to_string(),
            locator: "inline".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source {locator} is {size} bytes, limit is {limit}")]
    TooLarge {
        locator: String,
        size: u64,
        limit: u64,
    },
    #[error("invalid source reference: {0}")]
    Invalid(String),
}

impl From<ResolveError> for PipelineError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Unavailable(_) => PipelineError::transient(err.to_string()),
            ResolveError::NotFound(_) | ResolveError::TooLarge { .. } | ResolveError::Invalid(_) => {
                PipelineError::permanent(err.to_string())
            }
        }
    }
}

#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, source_ref: &str) -> Result<ResolvedSource, ResolveError>;
}

/// Resolver for the built-in reference schemes.
pub struct DefaultResolver {
    object_root: PathBuf,
    max_bytes: u64,
    client: reqwest::Client,
}

impl DefaultResolver {
    pub fn new(config: &ExtractionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self {
            object_root: config.object_root.clone(),
            max_bytes: config.max_source_bytes,
            client,
        })
    }

    async fn read_file(&self, path: &Path, locator: &str) -> Result<ResolvedSource, ResolveError> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResolveError::NotFound(locator.to_string()))
            }
            Err(e) => return Err(ResolveError::Unavailable(format!("{}: {}", locator, e))),
        };
        if !meta.is_file() {
            return Err(ResolveError::NotFound(locator.to_string()));
        }
        self.check_size(locator, meta.len())?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ResolveError::Unavailable(format!("{}: {}", locator, e)))?;
        Ok(ResolvedSource {
            bytes,
            content_type: content_type_for_path(&path.to_string_lossy()).to_string(),
            locator: locator.to_string(),
        })
    }

    async fn fetch(&self, url: &str) -> Result<ResolvedSource, ResolveError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::Unavailable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status.as_u16() == 404 || status.as_u16() == 410 {
            return Err(ResolveError::NotFound(format!("{} ({})", url, status)));
        }
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ResolveError::Unavailable(format!("{} ({})", url, status)));
        }
        if !status.is_success() {
            return Err(ResolveError::Invalid(format!("{} ({})", url, status)));
        }
        if let Some(len) = response.content_length() {
            self.check_size(url, len)?;
        }

        let header_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(normalize_content_type)
            .filter(|ct| !ct.is_empty() && ct != "application/octet-stream");

        // Content-Length is absent on chunked responses, so the limit is
        // enforced while reading.
        let mut response = response;
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ResolveError::Unavailable(format!("{}: {}", url, e)))?
        {
            bytes.extend_from_slice(&chunk);
            self.check_size(url, bytes.len() as u64)?;
        }

        let path = url.split(['?', '#']).next().unwrap_or(url);
        Ok(ResolvedSource {
            bytes,
            content_type: header_type.unwrap_or_else(|| content_type_for_path(path).to_string()),
            locator: url.to_string(),
        })
    }

    fn check_size(&self, locator: &str, size: u64) -> Result<(), ResolveError> {
        if size > self.max_bytes {
            return Err(ResolveError::TooLarge {
                locator: locator.to_string(),
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SourceResolver for DefaultResolver {
    async fn resolve(&self, source_ref: &str) -> Result<ResolvedSource, ResolveError> {
        if let Some(text) = source_ref.strip_prefix("inline:") {
            return Ok(ResolvedSource::inline(text));
        }
        if let Some(key) = source_ref.strip_prefix("object://") {
            let path = object_path(&self.object_root, key)?;
            return self.read_file(&path, source_ref).await;
        }
        if let Some(path) = source_ref.strip_prefix("file://") {
            return self.read_file(Path::new(path), source_ref).await;
        }
        if source_ref.starts_with("http://") || source_ref.starts_with("https://") {
            return self.fetch(source_ref).await;
        }
        Err(ResolveError::Invalid(format!(
            "unknown scheme in '{}'",
            source_ref
        )))
    }
}

/// Object keys are relative paths that must stay inside the object root.
fn object_path(root: &Path, key: &str) -> Result<PathBuf, ResolveError> {
    let rel = Path::new(key);
    if key.is_empty()
        || rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(ResolveError::Invalid(format!("object key '{}'", key)));
    }
    Ok(root.join(rel))
}

fn normalize_content_type(raw: &str) -> String {
    raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// Content type inferred from a file extension.
pub fn content_type_for_path(path: &str) -> &'static str {
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => crate::extract::document::MIME_PDF,
        "docx" => crate::extract::document::MIME_DOCX,
        "pptx" => crate::extract::document::MIME_PPTX,
        "xlsx" => crate::extract::document::MIME_XLSX,
        "txt" | "text" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "vtt" => "text/vtt",
        "srt" => "application/x-subrip",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

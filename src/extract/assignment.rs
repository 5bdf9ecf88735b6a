//! Assignment extraction.
//!
//! Structured assignments are JSON:
//!
//! ```json
//! { "title": "Lab 3", "instructions": "Measure…", "rubric": ["Method", {"criterion": "Analysis", "points": 5}] }
//! ```
//!
//! Plain-text and Markdown prompts are accepted as-is.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::document::strip_markdown;
use super::{normalize_whitespace, utf8, ExtractError, Extracted, Extractor};
use crate::resolve::ResolvedSource;

pub struct AssignmentExtractor;

#[derive(Debug, Deserialize)]
struct AssignmentSpec {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    instructions: String,
    #[serde(default)]
    rubric: Vec<RubricItem>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RubricItem {
    Text(String),
    Scored {
        criterion: String,
        #[serde(default)]
        points: Option<f64>,
    },
}

impl RubricItem {
    fn criterion(&self) -> &str {
        match self {
            RubricItem::Text(s) => s,
            RubricItem::Scored { criterion, .. } => criterion,
        }
    }

    fn points(&self) -> Option<f64> {
        match self {
            RubricItem::Text(_) => None,
            RubricItem::Scored { points, .. } => *points,
        }
    }
}

#[async_trait]
impl Extractor for AssignmentExtractor {
    async fn extract(&self, source: &ResolvedSource) -> Result<Extracted, ExtractError> {
        let ct = source.content_type.as_str();
        match ct {
            "application/json" => {
                let spec: AssignmentSpec = serde_json::from_slice(&source.bytes)
                    .map_err(|e| ExtractError::Corrupt(format!("assignment json: {}", e)))?;

                let mut parts: Vec<&str> = Vec::new();
                if let Some(title) = spec.title.as_deref() {
                    parts.push(title);
                }
                parts.push(&spec.instructions);
                parts.extend(spec.rubric.iter().map(RubricItem::criterion));

                let points: Option<f64> = spec
                    .rubric
                    .iter()
                    .filter_map(RubricItem::points)
                    .reduce(|a, b| a + b);
                Ok(Extracted {
                    text: normalize_whitespace(&parts.join(" ")),
                    metadata: json!({
                        "content_type": ct,
                        "rubric_items": spec.rubric.len(),
                        "total_points": points,
                    }),
                })
            }
            "text/plain" | "text/markdown" => {
                let body = utf8(&source.bytes)?;
                let text = if ct == "text/markdown" {
                    strip_markdown(body)
                } else {
                    body.to_string()
                };
                Ok(Extracted {
                    text: normalize_whitespace(&text),
                    metadata: json!({ "content_type": ct, "rubric_items": 0 }),
                })
            }
            other => Err(ExtractError::Unsupported(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_source(body: &str) -> ResolvedSource {
        ResolvedSource {
            bytes: body.as_bytes().to_vec(),
            content_type: "application/json".into(),
            locator: "inline".into(),
        }
    }

    #[tokio::test]
    async fn structured_assignment() {
        let src = json_source(
            r#"{"title":"Lab 3","instructions":"Measure the pendulum period.",
                "rubric":["Method",{"criterion":"Error analysis","points":4},{"criterion":"Plot","points":1.5}]}"#,
        );
        let out = AssignmentExtractor.extract(&src).await.unwrap();
        assert_eq!(
            out.text,
            "Lab 3 Measure the pendulum period. Method Error analysis Plot"
        );
        assert_eq!(out.metadata["rubric_items"], 3);
        assert_eq!(out.metadata["total_points"], 5.5);
    }

    #[tokio::test]
    async fn malformed_json_is_corrupt() {
        let err = AssignmentExtractor
            .extract(&json_source("{\"instructions\": "))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Corrupt(_)));
    }

    #[tokio::test]
    async fn plain_text_prompt() {
        let out = AssignmentExtractor
            .extract(&ResolvedSource::inline("Write  a short essay"))
            .await
            .unwrap();
        assert_eq!(out.text, "Write a short essay");
    }

    #[tokio::test]
    async fn pdf_is_unsupported_for_assignments() {
        let src = ResolvedSource {
            bytes: vec![],
            content_type: "application/pdf".into(),
            locator: "x".into(),
        };
        assert!(matches!(
            AssignmentExtractor.extract(&src).await,
            Err(ExtractError::Unsupported(_))
        ));
    }
}

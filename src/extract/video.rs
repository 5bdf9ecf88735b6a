//! Video extraction.
//!
//! Caption tracks (WebVTT, and SubRip which differs only in its header and
//! decimal separator) become searchable text plus timestamped caption
//! metadata. Media files themselves carry no text: they index
//! metadata-only with an empty body.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use super::{decode_entities, normalize_whitespace, utf8, ExtractError, Extracted, Extractor};
use crate::resolve::ResolvedSource;

pub struct VideoExtractor;

/// One timed caption block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Caption {
    pub start: String,
    pub end: String,
    pub line: String,
}

#[async_trait]
impl Extractor for VideoExtractor {
    async fn extract(&self, source: &ResolvedSource) -> Result<Extracted, ExtractError> {
        let ct = source.content_type.as_str();
        match ct {
            "text/vtt" | "application/x-subrip" | "text/srt" => {
                let body = utf8(&source.bytes)?;
                if ct == "text/vtt" && !body.trim_start().starts_with("WEBVTT") {
                    return Err(ExtractError::Corrupt("missing WEBVTT header".into()));
                }
                let captions = parse_captions(body);
                let text = normalize_whitespace(
                    &captions
                        .iter()
                        .map(|c| c.line.as_str())
                        .collect::<Vec<_>>()
                        .join(" "),
                );
                Ok(Extracted {
                    text,
                    metadata: json!({
                        "content_type": ct,
                        "duration": captions.last().map(|c| c.end.clone()),
                        "captions": captions,
                    }),
                })
            }
            _ if ct.starts_with("video/") || ct.starts_with("audio/") => Ok(Extracted {
                text: String::new(),
                metadata: json!({
                    "content_type": ct,
                    "bytes": source.bytes.len(),
                    "source": source.locator,
                }),
            }),
            other => Err(ExtractError::Unsupported(other.to_string())),
        }
    }
}

/// Split a caption file into timed blocks.
///
/// Blocks without a `-->` timing line (the header, `NOTE`, `STYLE`) are
/// skipped. An optional cue identifier may precede the timing line.
pub fn parse_captions(body: &str) -> Vec<Caption> {
    let normalized = body.replace("\r\n", "\n").replace('\r', "\n");
    let mut captions = Vec::new();

    for block in normalized.split("\n\n") {
        let mut lines = block.lines().map(str::trim).filter(|l| !l.is_empty());
        let Some(timing) = lines.by_ref().find(|l| l.contains("-->")) else {
            continue;
        };
        let Some((start, end)) = parse_timing(timing) else {
            continue;
        };
        let line = lines.map(clean_cue_text).collect::<Vec<_>>().join(" ");
        let line = normalize_whitespace(&line);
        if !line.is_empty() {
            captions.push(Caption { start, end, line });
        }
    }
    captions
}

fn parse_timing(line: &str) -> Option<(String, String)> {
    let (start, rest) = line.split_once("-->")?;
    // Cue settings ("align:start") follow the end timestamp.
    let end = rest.split_whitespace().next()?;
    let start = start.trim().replace(',', ".");
    let end = end.replace(',', ".");
    if is_timestamp(&start) && is_timestamp(&end) {
        Some((start, end))
    } else {
        None
    }
}

fn is_timestamp(s: &str) -> bool {
    let Some((hms, millis)) = s.split_once('.') else {
        return false;
    };
    let parts: Vec<&str> = hms.split(':').collect();
    (2..=3).contains(&parts.len())
        && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        && millis.len() == 3
        && millis.chars().all(|c| c.is_ascii_digit())
}

/// Remove inline voice/class/timestamp tags and decode entities.
fn clean_cue_text(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_tag = false;
    for c in line.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    decode_entities(&out)
}

//! Parsing of `<codex_updates>` payloads embedded in assistant text.
//!
//! The payload is a JSON array of glossary change requests the model may
//! emit instead of (or alongside) tool calls. Malformed payloads log a
//! warning and never halt the scene.

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    New,
    Update,
    Skip,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CodexUpdate {
    pub term: String,
    pub definition: String,
    pub status: UpdateStatus,
    #[serde(default)]
    pub source_post_id: Option<i64>,
}

/// Extract updates from a `<codex_updates>...</codex_updates>` block.
/// Returns an empty list when the block is absent or malformed.
pub fn extract_updates(content: &str) -> Vec<CodexUpdate> {
    let pattern = Regex::new(r"(?s)<codex_updates>(.*?)</codex_updates>").expect("static regex");
    let payload = match pattern.captures(content) {
        Some(captures) => captures[1].trim().to_string(),
        None => return Vec::new(),
    };
    if payload.is_empty() || payload == "[]" {
        return Vec::new();
    }

    match serde_json::from_str::<Vec<serde_json::Value>>(&payload) {
        Ok(raw) => raw
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<CodexUpdate>(value.clone()) {
                Ok(update) => Some(update),
                Err(e) => {
                    warn!(error = %e, %value, "skipping malformed codex update");
                    None
                }
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "malformed codex_updates payload, ignoring");
            Vec::new()
        }
    }
}

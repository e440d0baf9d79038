//! Glossary exporters: JSON and YAML documents with export metadata.

use std::io::Write;
use std::path::Path;

use serde::Serialize;

use terra_core::entry::GlossaryEntry;
use terra_store::{GlossaryRepo, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Yaml,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }
}

#[derive(Serialize)]
struct ExportDocument {
    exported_at: String,
    entry_count: usize,
    entries: Vec<ExportedEntry>,
}

#[derive(Serialize)]
struct ExportedEntry {
    id: i64,
    term: String,
    definition: String,
    status: String,
    tags: Vec<String>,
    first_seen_post_id: i64,
    first_seen_thread_id: i64,
    last_updated_post_id: i64,
    last_updated_thread_id: i64,
    created_at: String,
    updated_at: String,
}

impl From<GlossaryEntry> for ExportedEntry {
    fn from(entry: GlossaryEntry) -> Self {
        Self {
            id: entry.id,
            term: entry.term,
            definition: entry.definition,
            status: entry.status.to_string(),
            tags: entry.tags,
            first_seen_post_id: entry.first_seen_post_id,
            first_seen_thread_id: entry.first_seen_thread_id,
            last_updated_post_id: entry.last_updated_post_id,
            last_updated_thread_id: entry.last_updated_thread_id,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        }
    }
}

/// Keep entries matching the status filter and carrying every given tag.
pub fn filter_entries(
    entries: Vec<GlossaryEntry>,
    status: Option<&str>,
    tags: &[String],
) -> Vec<GlossaryEntry> {
    entries
        .into_iter()
        .filter(|entry| match status {
            Some("all") | None => true,
            Some(wanted) => entry.status.to_string() == wanted,
        })
        .filter(|entry| tags.iter().all(|tag| entry.tags.contains(tag)))
        .collect()
}

/// Export the filtered glossary to `output`. Returns the entry count.
pub fn export_glossary(
    glossary: &GlossaryRepo,
    format: ExportFormat,
    status: Option<&str>,
    tags: &[String],
    output: &Path,
) -> Result<usize, ExportError> {
    let entries = filter_entries(glossary.all_entries()?, status, tags);
    let document = ExportDocument {
        exported_at: terra_core::utcnow(),
        entry_count: entries.len(),
        entries: entries.into_iter().map(ExportedEntry::from).collect(),
    };

    let rendered = match format {
        ExportFormat::Json => serde_json::to_string_pretty(&document)?,
        ExportFormat::Yaml => serde_yaml::to_string(&document)?,
    };

    let mut file = std::fs::File::create(output)?;
    file.write_all(rendered.as_bytes())?;
    Ok(document.entry_count)
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("JSON encode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML encode failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use terra_core::entry::EntryStatus;
    use terra_store::Database;

    fn seeded_glossary() -> GlossaryRepo {
        let repo = GlossaryRepo::new(Database::in_memory().unwrap());
        repo.create(
            "Soma",
            "Questmaster NPC",
            &["character".to_string()],
            100,
            1,
            EntryStatus::Confirmed,
        )
        .unwrap();
        repo.create(
            "vatis",
            "order of seers",
            &["faction".to_string(), "character".to_string()],
            105,
            1,
            EntryStatus::Tentative,
        )
        .unwrap();
        repo
    }

    #[test]
    fn filters_by_status_and_tags() {
        let repo = seeded_glossary();
        let all = repo.all_entries().unwrap();

        assert_eq!(filter_entries(all.clone(), Some("confirmed"), &[]).len(), 1);
        assert_eq!(filter_entries(all.clone(), Some("all"), &[]).len(), 2);
        assert_eq!(
            filter_entries(all.clone(), None, &["character".to_string()]).len(),
            2
        );
        assert_eq!(
            filter_entries(all, None, &["character".to_string(), "faction".to_string()]).len(),
            1
        );
    }

    #[test]
    fn json_export_round_trips() {
        let repo = seeded_glossary();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("glossary.json");

        let count = export_glossary(&repo, ExportFormat::Json, None, &[], &output).unwrap();
        assert_eq!(count, 2);

        let raw = std::fs::read_to_string(&output).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["entry_count"], 2);
        assert_eq!(parsed["entries"][0]["term"], "Soma");
        assert_eq!(parsed["entries"][0]["status"], "confirmed");
    }

    #[test]
    fn yaml_export_is_parseable() {
        let repo = seeded_glossary();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("glossary.yaml");

        let count =
            export_glossary(&repo, ExportFormat::Yaml, Some("tentative"), &[], &output).unwrap();
        assert_eq!(count, 1);

        let raw = std::fs::read_to_string(&output).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(parsed["entries"][0]["term"], "vatis");
    }
}

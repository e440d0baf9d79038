use serde::{Deserialize, Serialize};

/// Belief state of a glossary entry. New entries are tentative until the
/// curator (or a human) promotes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Tentative,
    Confirmed,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tentative => write!(f, "tentative"),
            Self::Confirmed => write!(f, "confirmed"),
        }
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tentative" => Ok(Self::Tentative),
            "confirmed" => Ok(Self::Confirmed),
            other => Err(format!("unknown entry status: {other}")),
        }
    }
}

/// A glossary entry with full provenance metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub id: i64,
    pub term: String,
    pub term_normalized: String,
    /// Markdown; may contain `[[Term]]` cross-references (not validated).
    pub definition: String,
    pub status: EntryStatus,
    pub tags: Vec<String>,
    pub first_seen_post_id: i64,
    pub first_seen_thread_id: i64,
    pub last_updated_post_id: i64,
    pub last_updated_thread_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Normalize a term for the uniqueness key: strip one trailing
/// parenthesized disambiguation suffix, trim, lowercase.
pub fn normalize_term(term: &str) -> String {
    strip_disambiguation(term).trim().to_lowercase()
}

/// Remove a single trailing parenthesized suffix, e.g. `Soma (NPC)` -> `Soma`.
pub fn strip_disambiguation(term: &str) -> &str {
    let trimmed = term.trim_end();
    if let Some(open) = trimmed.rfind('(') {
        if trimmed.ends_with(')') && open > 0 {
            return trimmed[..open].trim_end();
        }
    }
    trimmed
}

/// Fields a revision row may describe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionField {
    Term,
    Definition,
    Status,
    Tags,
    CuratorDecision,
}

impl std::fmt::Display for RevisionField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "term"),
            Self::Definition => write!(f, "definition"),
            Self::Status => write!(f, "status"),
            Self::Tags => write!(f, "tags"),
            Self::CuratorDecision => write!(f, "curator_decision"),
        }
    }
}

impl std::str::FromStr for RevisionField {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "term" => Ok(Self::Term),
            "definition" => Ok(Self::Definition),
            "status" => Ok(Self::Status),
            "tags" => Ok(Self::Tags),
            "curator_decision" => Ok(Self::CuratorDecision),
            other => Err(format!("unknown revision field: {other}")),
        }
    }
}

/// Append-only change record. `entry_id` goes null when the entry is
/// deleted so the audit trail outlives the entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Revision {
    pub id: i64,
    pub entry_id: Option<i64>,
    pub snapshot_id: Option<i64>,
    pub field_name: RevisionField,
    pub old_value: Option<String>,
    pub new_value: String,
    pub changed_at: String,
    pub source_post_id: Option<i64>,
}

/// Partial update for a glossary entry; absent fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct EntryPatch {
    pub term: Option<String>,
    pub definition: Option<String>,
    pub tags: Option<Vec<String>>,
    pub status: Option<EntryStatus>,
}

impl EntryPatch {
    pub fn is_empty(&self) -> bool {
        self.term.is_none()
            && self.definition.is_none()
            && self.tags.is_none()
            && self.status.is_none()
    }
}

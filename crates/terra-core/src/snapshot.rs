use serde::{Deserialize, Serialize};

/// Why a snapshot was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Checkpoint,
    CuratorFork,
    Manual,
}

impl std::fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Checkpoint => write!(f, "checkpoint"),
            Self::CuratorFork => write!(f, "curator_fork"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for SnapshotType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkpoint" => Ok(Self::Checkpoint),
            "curator_fork" => Ok(Self::CuratorFork),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown snapshot type: {other}")),
        }
    }
}

/// Snapshot metadata (the row without its serialized context).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub snapshot_type: SnapshotType,
    pub created_at: String,
    pub last_post_id: i64,
    pub last_thread_id: i64,
    pub thread_position: i64,
    pub glossary_entry_count: i64,
    pub context_token_count: Option<i64>,
}

/// Per-entry state captured at snapshot time, for blame tracking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub snapshot_id: i64,
    pub entry_id: i64,
    pub definition_at_snapshot: String,
    pub status_at_snapshot: String,
}

/// The run-state singleton (id = 1 in the store).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunState {
    pub last_post_id: Option<i64>,
    pub last_thread_id: Option<i64>,
    pub current_snapshot_id: Option<i64>,
    pub run_started_at: Option<String>,
    pub run_updated_at: Option<String>,
    pub total_posts_processed: i64,
    pub total_entries_created: i64,
    pub total_entries_updated: i64,
}

/// Per-thread progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Pending,
    InProgress,
    Completed,
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for ThreadStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown thread status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadState {
    pub thread_id: i64,
    pub status: ThreadStatus,
    pub summary: Option<String>,
    pub posts_processed: i64,
    pub entries_created: i64,
    pub entries_updated: i64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

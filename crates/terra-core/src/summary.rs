use serde::{Deserialize, Serialize};

/// Summary of a chunk of consecutive scenes within one thread.
///
/// Chunk indices within a thread are contiguous from 0; negative indices
/// mark partial-chunk emergency summaries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub thread_id: i64,
    pub chunk_index: i64,
    pub first_scene_index: i64,
    pub last_scene_index: i64,
    pub text: String,
    #[serde(default)]
    pub entry_ids: Vec<i64>,
}

/// Summary of a completed thread, held only until it merges into the
/// cumulative summary at thread close.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: i64,
    /// Order in which the thread was processed.
    pub position: i64,
    pub text: String,
    #[serde(default)]
    pub entries_created: Vec<i64>,
    #[serde(default)]
    pub entries_updated: Vec<i64>,
}

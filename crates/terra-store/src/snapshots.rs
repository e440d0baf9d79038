use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use terra_core::snapshot::{Snapshot, SnapshotEntry, SnapshotType};
use terra_core::summary::{ChunkSummary, ThreadSummary};
use terra_core::turn::Turn;
use terra_core::utcnow;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Everything needed to rehydrate an annotation dialogue: the conversation
/// object plus the compaction bookkeeping that frames it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotContext {
    pub system_prompt: String,
    pub cumulative_summary: Option<String>,
    pub chunk_summaries: Vec<ChunkSummary>,
    pub thread_summaries: Vec<ThreadSummary>,
    pub conversation_history: Vec<Turn>,
    pub current_thread_id: Option<i64>,
    pub current_scene_index: i64,
    pub completed_thread_ids: Vec<i64>,
    pub summarized_chunk_indices: Vec<i64>,
    pub merged_thread_ids: Vec<i64>,
}

/// Input for a snapshot write.
#[derive(Clone, Debug)]
pub struct SnapshotInput {
    pub snapshot_type: SnapshotType,
    pub last_post_id: i64,
    pub last_thread_id: i64,
    pub thread_position: i64,
    pub token_count: Option<i64>,
    pub context: SnapshotContext,
    /// (entry_id, definition, status) at snapshot time, for blame.
    pub entry_states: Vec<(i64, String, String)>,
}

const SNAPSHOT_COLUMNS: &str = "id, snapshot_type, created_at, last_post_id, last_thread_id,
       thread_position, glossary_entry_count, context_token_count";

/// Point-in-time captures of the annotation state.
pub struct SnapshotRepo {
    db: Database,
}

impl SnapshotRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Write snapshot metadata, serialized context, and per-entry states in
    /// one transaction. Returns the new snapshot id.
    #[instrument(skip(self, input), fields(snapshot_type = %input.snapshot_type, last_post_id = input.last_post_id))]
    pub fn create(&self, input: &SnapshotInput) -> Result<i64, StoreError> {
        self.db.with_tx(|tx| insert_tx(tx, input))
    }

    pub fn get(&self, snapshot_id: i64) -> Result<Option<Snapshot>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM snapshot WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([snapshot_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_snapshot(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Reconstruct the serialized context. Lossless for every field in
    /// [`SnapshotContext`].
    pub fn get_context(&self, snapshot_id: i64) -> Result<Option<SnapshotContext>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT system_prompt, cumulative_summary, chunk_summaries, thread_summaries,
                        conversation_history, current_thread_id, current_scene_index,
                        completed_thread_ids, summarized_chunk_indices, merged_thread_ids
                 FROM snapshot_context WHERE snapshot_id = ?1",
            )?;
            let mut rows = stmt.query([snapshot_id])?;
            let row = match rows.next()? {
                Some(row) => row,
                None => return Ok(None),
            };

            let chunk_raw: String = row_helpers::get(row, 2, "snapshot_context", "chunk_summaries")?;
            let thread_raw: String = row_helpers::get(row, 3, "snapshot_context", "thread_summaries")?;
            let history_raw: String =
                row_helpers::get(row, 4, "snapshot_context", "conversation_history")?;
            let completed_raw: String =
                row_helpers::get(row, 7, "snapshot_context", "completed_thread_ids")?;
            let summarized_raw: String =
                row_helpers::get(row, 8, "snapshot_context", "summarized_chunk_indices")?;
            let merged_raw: String =
                row_helpers::get(row, 9, "snapshot_context", "merged_thread_ids")?;

            Ok(Some(SnapshotContext {
                system_prompt: row_helpers::get(row, 0, "snapshot_context", "system_prompt")?,
                cumulative_summary: row_helpers::get_opt(row, 1, "snapshot_context", "cumulative_summary")?,
                chunk_summaries: row_helpers::parse_json(&chunk_raw, "snapshot_context", "chunk_summaries")?,
                thread_summaries: row_helpers::parse_json(&thread_raw, "snapshot_context", "thread_summaries")?,
                conversation_history: row_helpers::parse_json(&history_raw, "snapshot_context", "conversation_history")?,
                current_thread_id: row_helpers::get_opt(row, 5, "snapshot_context", "current_thread_id")?,
                current_scene_index: row_helpers::get(row, 6, "snapshot_context", "current_scene_index")?,
                completed_thread_ids: row_helpers::parse_json(&completed_raw, "snapshot_context", "completed_thread_ids")?,
                summarized_chunk_indices: row_helpers::parse_json(&summarized_raw, "snapshot_context", "summarized_chunk_indices")?,
                merged_thread_ids: row_helpers::parse_json(&merged_raw, "snapshot_context", "merged_thread_ids")?,
            }))
        })
    }

    /// Per-entry (definition, status) at snapshot time, ordered by entry id.
    pub fn get_entries(&self, snapshot_id: i64) -> Result<Vec<SnapshotEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT snapshot_id, entry_id, definition_at_snapshot, status_at_snapshot
                 FROM snapshot_entry WHERE snapshot_id = ?1 ORDER BY entry_id",
            )?;
            let mut rows = stmt.query([snapshot_id])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(SnapshotEntry {
                    snapshot_id: row_helpers::get(row, 0, "snapshot_entry", "snapshot_id")?,
                    entry_id: row_helpers::get(row, 1, "snapshot_entry", "entry_id")?,
                    definition_at_snapshot: row_helpers::get(row, 2, "snapshot_entry", "definition_at_snapshot")?,
                    status_at_snapshot: row_helpers::get(row, 3, "snapshot_entry", "status_at_snapshot")?,
                });
            }
            Ok(entries)
        })
    }

    /// Metadata-only listing, newest first.
    pub fn list_recent(
        &self,
        limit: usize,
        snapshot_type: Option<SnapshotType>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        self.db.with_conn(|conn| {
            let (sql, params): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = match snapshot_type {
                Some(t) => (
                    format!(
                        "SELECT {SNAPSHOT_COLUMNS} FROM snapshot
                         WHERE snapshot_type = ?1 ORDER BY id DESC LIMIT ?2"
                    ),
                    vec![Box::new(t.to_string()), Box::new(limit as i64)],
                ),
                None => (
                    format!(
                        "SELECT {SNAPSHOT_COLUMNS} FROM snapshot ORDER BY id DESC LIMIT ?1"
                    ),
                    vec![Box::new(limit as i64)],
                ),
            };
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(param_refs.as_slice())?;
            let mut snapshots = Vec::new();
            while let Some(row) = rows.next()? {
                snapshots.push(row_to_snapshot(row)?);
            }
            Ok(snapshots)
        })
    }

    pub fn list_by_thread(&self, thread_id: i64) -> Result<Vec<Snapshot>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM snapshot
                 WHERE last_thread_id = ?1 ORDER BY id DESC"
            ))?;
            let mut rows = stmt.query([thread_id])?;
            let mut snapshots = Vec::new();
            while let Some(row) = rows.next()? {
                snapshots.push(row_to_snapshot(row)?);
            }
            Ok(snapshots)
        })
    }

    /// Delete a snapshot and its context/entry rows. Idempotent.
    pub fn delete(&self, snapshot_id: i64) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM snapshot WHERE id = ?1", [snapshot_id])?;
            Ok(changed > 0)
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM snapshot", [], |r| r.get(0))?))
    }

    pub fn count_by_type(&self) -> Result<Vec<(String, i64)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT snapshot_type, COUNT(*) FROM snapshot GROUP BY snapshot_type")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }
}

/// Insert a snapshot on an open transaction. Shared with the run-state
/// checkpoint commit so snapshot write and state advance are atomic.
pub(crate) fn insert_tx(conn: &Connection, input: &SnapshotInput) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO snapshot (
            snapshot_type, created_at, last_post_id, last_thread_id,
            thread_position, glossary_entry_count, context_token_count
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            input.snapshot_type.to_string(),
            utcnow(),
            input.last_post_id,
            input.last_thread_id,
            input.thread_position,
            input.entry_states.len() as i64,
            input.token_count,
        ],
    )?;
    let snapshot_id = conn.last_insert_rowid();

    let ctx = &input.context;
    conn.execute(
        "INSERT INTO snapshot_context (
            snapshot_id, system_prompt, cumulative_summary, chunk_summaries,
            thread_summaries, conversation_history, current_thread_id,
            current_scene_index, completed_thread_ids, summarized_chunk_indices,
            merged_thread_ids
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            snapshot_id,
            ctx.system_prompt,
            ctx.cumulative_summary,
            serde_json::to_string(&ctx.chunk_summaries)?,
            serde_json::to_string(&ctx.thread_summaries)?,
            serde_json::to_string(&ctx.conversation_history)?,
            ctx.current_thread_id,
            ctx.current_scene_index,
            serde_json::to_string(&ctx.completed_thread_ids)?,
            serde_json::to_string(&ctx.summarized_chunk_indices)?,
            serde_json::to_string(&ctx.merged_thread_ids)?,
        ],
    )?;

    for (entry_id, definition, status) in &input.entry_states {
        conn.execute(
            "INSERT INTO snapshot_entry (
                snapshot_id, entry_id, definition_at_snapshot, status_at_snapshot
            ) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![snapshot_id, entry_id, definition, status],
        )?;
    }

    Ok(snapshot_id)
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> Result<Snapshot, StoreError> {
    let type_raw: String = row_helpers::get(row, 1, "snapshot", "snapshot_type")?;
    Ok(Snapshot {
        id: row_helpers::get(row, 0, "snapshot", "id")?,
        snapshot_type: row_helpers::parse_enum(&type_raw, "snapshot", "snapshot_type")?,
        created_at: row_helpers::get(row, 2, "snapshot", "created_at")?,
        last_post_id: row_helpers::get(row, 3, "snapshot", "last_post_id")?,
        last_thread_id: row_helpers::get(row, 4, "snapshot", "last_thread_id")?,
        thread_position: row_helpers::get(row, 5, "snapshot", "thread_position")?,
        glossary_entry_count: row_helpers::get(row, 6, "snapshot", "glossary_entry_count")?,
        context_token_count: row_helpers::get_opt(row, 7, "snapshot", "context_token_count")?,
    })
}

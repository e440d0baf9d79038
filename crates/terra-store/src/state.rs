use tracing::instrument;

use terra_core::snapshot::{RunState, ThreadState, ThreadStatus};
use terra_core::utcnow;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::snapshots::{self, SnapshotInput};

/// Deltas and pointers applied to the run-state singleton. Counter deltas
/// add to the stored totals.
#[derive(Clone, Debug, Default)]
pub struct StateAdvance {
    pub last_post_id: Option<i64>,
    pub last_thread_id: Option<i64>,
    pub current_snapshot_id: Option<i64>,
    pub posts_processed_delta: i64,
    pub entries_created_delta: i64,
    pub entries_updated_delta: i64,
}

/// The run-state singleton (row id = 1).
pub struct RunStateRepo {
    db: Database,
}

impl RunStateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self) -> Result<RunState, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT last_post_id, last_thread_id, current_snapshot_id,
                        run_started_at, run_updated_at,
                        total_posts_processed, total_entries_created, total_entries_updated
                 FROM run_state WHERE id = 1",
            )?;
            let mut rows = stmt.query([])?;
            let row = rows
                .next()?
                .ok_or_else(|| StoreError::NotFound("run_state singleton".into()))?;
            Ok(RunState {
                last_post_id: row_helpers::get_opt(row, 0, "run_state", "last_post_id")?,
                last_thread_id: row_helpers::get_opt(row, 1, "run_state", "last_thread_id")?,
                current_snapshot_id: row_helpers::get_opt(row, 2, "run_state", "current_snapshot_id")?,
                run_started_at: row_helpers::get_opt(row, 3, "run_state", "run_started_at")?,
                run_updated_at: row_helpers::get_opt(row, 4, "run_state", "run_updated_at")?,
                total_posts_processed: row_helpers::get(row, 5, "run_state", "total_posts_processed")?,
                total_entries_created: row_helpers::get(row, 6, "run_state", "total_entries_created")?,
                total_entries_updated: row_helpers::get(row, 7, "run_state", "total_entries_updated")?,
            })
        })
    }

    /// Apply an advance in its own transaction.
    #[instrument(skip(self, advance))]
    pub fn update(&self, advance: &StateAdvance) -> Result<(), StoreError> {
        self.db.with_tx(|tx| apply_advance(tx, advance))
    }

    /// Write a snapshot and advance run state in one transaction: the
    /// at-most-one advancing commit per scene.
    #[instrument(skip(self, snapshot, advance), fields(last_post_id = snapshot.last_post_id))]
    pub fn commit_checkpoint(
        &self,
        snapshot: &SnapshotInput,
        advance: &StateAdvance,
    ) -> Result<i64, StoreError> {
        self.db.with_tx(|tx| {
            let snapshot_id = snapshots::insert_tx(tx, snapshot)?;
            let mut advance = advance.clone();
            advance.current_snapshot_id = Some(snapshot_id);
            apply_advance(tx, &advance)?;
            Ok(snapshot_id)
        })
    }

    pub fn start_run(&self) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = utcnow();
            conn.execute(
                "UPDATE run_state SET run_started_at = ?1, run_updated_at = ?1 WHERE id = 1",
                [&now],
            )?;
            Ok(())
        })
    }
}

fn apply_advance(conn: &rusqlite::Connection, advance: &StateAdvance) -> Result<(), StoreError> {
    let mut sets = vec!["run_updated_at = ?1".to_string()];
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(utcnow())];

    if let Some(post_id) = advance.last_post_id {
        sets.push(format!("last_post_id = ?{}", params.len() + 1));
        params.push(Box::new(post_id));
    }
    if let Some(thread_id) = advance.last_thread_id {
        sets.push(format!("last_thread_id = ?{}", params.len() + 1));
        params.push(Box::new(thread_id));
    }
    if let Some(snapshot_id) = advance.current_snapshot_id {
        sets.push(format!("current_snapshot_id = ?{}", params.len() + 1));
        params.push(Box::new(snapshot_id));
    }
    if advance.posts_processed_delta != 0 {
        sets.push(format!(
            "total_posts_processed = total_posts_processed + ?{}",
            params.len() + 1
        ));
        params.push(Box::new(advance.posts_processed_delta));
    }
    if advance.entries_created_delta != 0 {
        sets.push(format!(
            "total_entries_created = total_entries_created + ?{}",
            params.len() + 1
        ));
        params.push(Box::new(advance.entries_created_delta));
    }
    if advance.entries_updated_delta != 0 {
        sets.push(format!(
            "total_entries_updated = total_entries_updated + ?{}",
            params.len() + 1
        ));
        params.push(Box::new(advance.entries_updated_delta));
    }

    let sql = format!("UPDATE run_state SET {} WHERE id = 1", sets.join(", "));
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    conn.execute(&sql, param_refs.as_slice())?;
    Ok(())
}

/// Per-thread progress rows.
pub struct ThreadStateRepo {
    db: Database,
}

#[derive(Clone, Debug, Default)]
pub struct ThreadAdvance {
    pub status: Option<ThreadStatus>,
    pub summary: Option<String>,
    pub posts_processed_delta: i64,
    pub entries_created_delta: i64,
    pub entries_updated_delta: i64,
}

impl ThreadStateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, thread_id: i64) -> Result<Option<ThreadState>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT thread_id, status, summary, posts_processed,
                        entries_created, entries_updated, started_at, completed_at
                 FROM thread_state WHERE thread_id = ?1",
            )?;
            let mut rows = stmt.query([thread_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_thread_state(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Update or create the row for a thread.
    #[instrument(skip(self, advance), fields(thread_id))]
    pub fn update(&self, thread_id: i64, advance: &ThreadAdvance) -> Result<(), StoreError> {
        let now = utcnow();
        self.db.with_tx(|tx| {
            let exists: bool = tx.query_row(
                "SELECT COUNT(*) > 0 FROM thread_state WHERE thread_id = ?1",
                [thread_id],
                |row| row.get(0),
            )?;

            if !exists {
                tx.execute(
                    "INSERT INTO thread_state (
                        thread_id, status, summary, posts_processed,
                        entries_created, entries_updated, started_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        thread_id,
                        advance.status.unwrap_or(ThreadStatus::Pending).to_string(),
                        advance.summary,
                        advance.posts_processed_delta,
                        advance.entries_created_delta,
                        advance.entries_updated_delta,
                        matches!(advance.status, Some(ThreadStatus::InProgress)).then(|| now.clone()),
                    ],
                )?;
                return Ok(());
            }

            let mut sets: Vec<String> = Vec::new();
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

            if let Some(status) = advance.status {
                sets.push(format!("status = ?{}", params.len() + 1));
                params.push(Box::new(status.to_string()));
                match status {
                    ThreadStatus::InProgress => {
                        sets.push(format!("started_at = COALESCE(started_at, ?{})", params.len() + 1));
                        params.push(Box::new(now.clone()));
                    }
                    ThreadStatus::Completed => {
                        sets.push(format!("completed_at = ?{}", params.len() + 1));
                        params.push(Box::new(now.clone()));
                    }
                    ThreadStatus::Pending => {}
                }
            }
            if let Some(summary) = &advance.summary {
                sets.push(format!("summary = ?{}", params.len() + 1));
                params.push(Box::new(summary.clone()));
            }
            if advance.posts_processed_delta != 0 {
                sets.push(format!("posts_processed = posts_processed + ?{}", params.len() + 1));
                params.push(Box::new(advance.posts_processed_delta));
            }
            if advance.entries_created_delta != 0 {
                sets.push(format!("entries_created = entries_created + ?{}", params.len() + 1));
                params.push(Box::new(advance.entries_created_delta));
            }
            if advance.entries_updated_delta != 0 {
                sets.push(format!("entries_updated = entries_updated + ?{}", params.len() + 1));
                params.push(Box::new(advance.entries_updated_delta));
            }

            if sets.is_empty() {
                return Ok(());
            }
            let sql = format!(
                "UPDATE thread_state SET {} WHERE thread_id = ?{}",
                sets.join(", "),
                params.len() + 1
            );
            params.push(Box::new(thread_id));
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            tx.execute(&sql, param_refs.as_slice())?;
            Ok(())
        })
    }

    pub fn completed(&self) -> Result<Vec<ThreadState>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT thread_id, status, summary, posts_processed,
                        entries_created, entries_updated, started_at, completed_at
                 FROM thread_state WHERE status = 'completed' ORDER BY completed_at",
            )?;
            let mut rows = stmt.query([])?;
            let mut states = Vec::new();
            while let Some(row) = rows.next()? {
                states.push(row_to_thread_state(row)?);
            }
            Ok(states)
        })
    }
}

fn row_to_thread_state(row: &rusqlite::Row<'_>) -> Result<ThreadState, StoreError> {
    let status_raw: String = row_helpers::get(row, 1, "thread_state", "status")?;
    Ok(ThreadState {
        thread_id: row_helpers::get(row, 0, "thread_state", "thread_id")?,
        status: row_helpers::parse_enum(&status_raw, "thread_state", "status")?,
        summary: row_helpers::get_opt(row, 2, "thread_state", "summary")?,
        posts_processed: row_helpers::get(row, 3, "thread_state", "posts_processed")?,
        entries_created: row_helpers::get(row, 4, "thread_state", "entries_created")?,
        entries_updated: row_helpers::get(row, 5, "thread_state", "entries_updated")?,
        started_at: row_helpers::get_opt(row, 6, "thread_state", "started_at")?,
        completed_at: row_helpers::get_opt(row, 7, "thread_state", "completed_at")?,
    })
}

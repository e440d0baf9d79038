use rusqlite::Connection;
use tracing::instrument;

use terra_core::entry::{Revision, RevisionField};
use terra_core::utcnow;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Insert a revision row on an open connection/transaction. Used by the
/// glossary repo so mutations and their audit rows commit together.
pub(crate) fn insert_tx(
    conn: &Connection,
    entry_id: i64,
    field: RevisionField,
    old_value: Option<&str>,
    new_value: &str,
    source_post_id: Option<i64>,
    snapshot_id: Option<i64>,
) -> Result<i64, StoreError> {
    insert_raw(conn, Some(entry_id), field, old_value, new_value, source_post_id, snapshot_id)
}

fn insert_raw(
    conn: &Connection,
    entry_id: Option<i64>,
    field: RevisionField,
    old_value: Option<&str>,
    new_value: &str,
    source_post_id: Option<i64>,
    snapshot_id: Option<i64>,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO revision (
            entry_id, snapshot_id, field_name, old_value, new_value,
            changed_at, source_post_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            entry_id,
            snapshot_id,
            field.to_string(),
            old_value,
            new_value,
            utcnow(),
            source_post_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

const REVISION_COLUMNS: &str =
    "id, entry_id, snapshot_id, field_name, old_value, new_value, changed_at, source_post_id";

/// Read access to the audit log, plus standalone notes (curator decisions,
/// summon dismissals) that are not tied to a glossary mutation.
pub struct RevisionRepo {
    db: Database,
}

impl RevisionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a standalone change note.
    #[instrument(skip(self, old_value, new_value), fields(entry_id, field = %field))]
    pub fn log_change(
        &self,
        entry_id: Option<i64>,
        field: RevisionField,
        old_value: Option<&str>,
        new_value: &str,
        source_post_id: Option<i64>,
        snapshot_id: Option<i64>,
    ) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            insert_raw(conn, entry_id, field, old_value, new_value, source_post_id, snapshot_id)
        })
    }

    /// Change history for an entry, newest first.
    pub fn history(&self, entry_id: i64, limit: usize) -> Result<Vec<Revision>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REVISION_COLUMNS} FROM revision
                 WHERE entry_id = ?1
                 ORDER BY changed_at DESC, id DESC
                 LIMIT ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![entry_id, limit as i64])?;
            collect_revisions(&mut rows)
        })
    }

    /// Revisions whose entry has been deleted (entry reference nulled).
    pub fn history_for_deleted(&self, limit: usize) -> Result<Vec<Revision>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REVISION_COLUMNS} FROM revision
                 WHERE entry_id IS NULL
                 ORDER BY changed_at DESC, id DESC
                 LIMIT ?1"
            ))?;
            let mut rows = stmt.query([limit as i64])?;
            collect_revisions(&mut rows)
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM revision", [], |r| r.get(0))?))
    }
}

fn collect_revisions(rows: &mut rusqlite::Rows<'_>) -> Result<Vec<Revision>, StoreError> {
    let mut revisions = Vec::new();
    while let Some(row) = rows.next()? {
        let field_raw: String = row_helpers::get(row, 3, "revision", "field_name")?;
        revisions.push(Revision {
            id: row_helpers::get(row, 0, "revision", "id")?,
            entry_id: row_helpers::get_opt(row, 1, "revision", "entry_id")?,
            snapshot_id: row_helpers::get_opt(row, 2, "revision", "snapshot_id")?,
            field_name: row_helpers::parse_enum(&field_raw, "revision", "field_name")?,
            old_value: row_helpers::get_opt(row, 4, "revision", "old_value")?,
            new_value: row_helpers::get(row, 5, "revision", "new_value")?,
            changed_at: row_helpers::get(row, 6, "revision", "changed_at")?,
            source_post_id: row_helpers::get_opt(row, 7, "revision", "source_post_id")?,
        });
    }
    Ok(revisions)
}

use rusqlite::Connection;
use tracing::instrument;

use terra_core::entry::{normalize_term, EntryPatch, EntryStatus, GlossaryEntry, RevisionField};
use terra_core::utcnow;

use crate::database::Database;
use crate::error::StoreError;
use crate::revisions;
use crate::row_helpers;

/// Status filter for searches and exports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatusFilter {
    Confirmed,
    Tentative,
    #[default]
    All,
}

impl StatusFilter {
    fn as_status(&self) -> Option<&'static str> {
        match self {
            Self::Confirmed => Some("confirmed"),
            Self::Tentative => Some("tentative"),
            Self::All => None,
        }
    }
}

impl std::str::FromStr for StatusFilter {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(Self::Confirmed),
            "tentative" => Ok(Self::Tentative),
            "all" => Ok(Self::All),
            other => Err(format!("unknown status filter: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SearchOptions {
    pub tags: Vec<String>,
    pub status: StatusFilter,
    pub limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            status: StatusFilter::All,
            limit: 10,
        }
    }
}

const ENTRY_COLUMNS: &str = "e.id, e.term, e.term_normalized, e.definition, e.status,
       e.first_seen_post_id, e.first_seen_thread_id,
       e.last_updated_post_id, e.last_updated_thread_id,
       e.created_at, e.updated_at";

/// Glossary store over annotator.db. Every mutation commits together with
/// its revision rows.
pub struct GlossaryRepo {
    db: Database,
}

impl GlossaryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Full-text search over (term, definition). Exact normalized-term
    /// matches rank first; ties break by id ascending. The tag filter is
    /// conjunctive.
    #[instrument(skip(self, opts), fields(query))]
    pub fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<GlossaryEntry>, StoreError> {
        let fts_query = build_fts_query(query);
        let normalized = normalize_term(query);

        self.db.with_conn(|conn| {
            let mut sql = format!(
                "SELECT {ENTRY_COLUMNS}, bm25(glossary_fts) AS rank
                 FROM glossary_fts f
                 JOIN glossary_entry e ON f.rowid = e.id
                 WHERE glossary_fts MATCH ?1"
            );
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(fts_query)];

            if let Some(status) = opts.status.as_status() {
                sql.push_str(&format!(" AND e.status = ?{}", params.len() + 1));
                params.push(Box::new(status.to_string()));
            }

            if !opts.tags.is_empty() {
                let placeholders: Vec<String> = (0..opts.tags.len())
                    .map(|i| format!("?{}", params.len() + 1 + i))
                    .collect();
                sql.push_str(&format!(
                    " AND e.id IN (
                         SELECT entry_id FROM glossary_tag
                         WHERE tag IN ({})
                         GROUP BY entry_id
                         HAVING COUNT(DISTINCT tag) = ?{}
                     )",
                    placeholders.join(","),
                    params.len() + 1 + opts.tags.len(),
                ));
                for tag in &opts.tags {
                    params.push(Box::new(tag.clone()));
                }
                params.push(Box::new(opts.tags.len() as i64));
            }

            sql.push_str(&format!(
                " ORDER BY CASE WHEN e.term_normalized = ?{} THEN 0 ELSE 1 END, rank, e.id
                 LIMIT ?{}",
                params.len() + 1,
                params.len() + 2,
            ));
            params.push(Box::new(normalized.clone()));
            params.push(Box::new(opts.limit as i64));

            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(param_refs.as_slice())?;

            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                let mut entry = row_to_entry(row)?;
                entry.tags = get_tags(conn, entry.id)?;
                entries.push(entry);
            }
            Ok(entries)
        })
    }

    /// Fetch a single entry, None if it does not exist.
    pub fn get(&self, entry_id: i64) -> Result<Option<GlossaryEntry>, StoreError> {
        self.db.with_conn(|conn| get_in_conn(conn, entry_id))
    }

    /// Insert a new entry; the creation revisions land in the same
    /// transaction. Fails with DuplicateTerm when the normalized term is
    /// taken.
    #[instrument(skip(self, definition, tags), fields(term, post_id, thread_id))]
    pub fn create(
        &self,
        term: &str,
        definition: &str,
        tags: &[String],
        post_id: i64,
        thread_id: i64,
        status: EntryStatus,
    ) -> Result<i64, StoreError> {
        let normalized = normalize_term(term);
        let now = utcnow();

        self.db.with_tx(|tx| {
            if let Some(existing_id) = lookup_normalized(tx, &normalized)? {
                return Err(StoreError::DuplicateTerm {
                    term: term.to_string(),
                    existing_id,
                });
            }

            tx.execute(
                "INSERT INTO glossary_entry (
                    term, term_normalized, definition, status,
                    first_seen_post_id, first_seen_thread_id,
                    last_updated_post_id, last_updated_thread_id,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?5, ?6, ?7, ?7)",
                rusqlite::params![term, normalized, definition, status.to_string(), post_id, thread_id, now],
            )?;
            let entry_id = tx.last_insert_rowid();

            for tag in tags {
                tx.execute(
                    "INSERT INTO glossary_tag (entry_id, tag) VALUES (?1, ?2)",
                    rusqlite::params![entry_id, tag],
                )?;
            }

            let tags_json = serde_json::to_string(tags)?;
            revisions::insert_tx(tx, entry_id, RevisionField::Term, None, term, Some(post_id), None)?;
            revisions::insert_tx(tx, entry_id, RevisionField::Definition, None, definition, Some(post_id), None)?;
            revisions::insert_tx(tx, entry_id, RevisionField::Tags, None, &tags_json, Some(post_id), None)?;
            revisions::insert_tx(tx, entry_id, RevisionField::Status, None, &status.to_string(), Some(post_id), None)?;

            Ok(entry_id)
        })
    }

    /// Apply a partial update; every changed field gets a revision row in
    /// the same transaction. Returns false when the entry does not exist.
    #[instrument(skip(self, patch), fields(entry_id, post_id, thread_id))]
    pub fn update(
        &self,
        entry_id: i64,
        patch: &EntryPatch,
        post_id: i64,
        thread_id: i64,
    ) -> Result<bool, StoreError> {
        let now = utcnow();

        self.db.with_tx(|tx| {
            let existing = match get_in_conn(tx, entry_id)? {
                Some(e) => e,
                None => return Ok(false),
            };

            let mut sets = vec![
                "last_updated_post_id = ?1".to_string(),
                "last_updated_thread_id = ?2".to_string(),
                "updated_at = ?3".to_string(),
            ];
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
                vec![Box::new(post_id), Box::new(thread_id), Box::new(now.clone())];

            if let Some(term) = &patch.term {
                let normalized = normalize_term(term);
                if normalized != existing.term_normalized {
                    if let Some(conflict_id) = lookup_normalized(tx, &normalized)? {
                        return Err(StoreError::DuplicateTerm {
                            term: term.clone(),
                            existing_id: conflict_id,
                        });
                    }
                }
                sets.push(format!("term = ?{}", params.len() + 1));
                params.push(Box::new(term.clone()));
                sets.push(format!("term_normalized = ?{}", params.len() + 1));
                params.push(Box::new(normalized));
            }
            if let Some(definition) = &patch.definition {
                sets.push(format!("definition = ?{}", params.len() + 1));
                params.push(Box::new(definition.clone()));
            }
            if let Some(status) = &patch.status {
                sets.push(format!("status = ?{}", params.len() + 1));
                params.push(Box::new(status.to_string()));
            }

            let sql = format!(
                "UPDATE glossary_entry SET {} WHERE id = ?{}",
                sets.join(", "),
                params.len() + 1
            );
            params.push(Box::new(entry_id));
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            tx.execute(&sql, param_refs.as_slice())?;

            if let Some(tags) = &patch.tags {
                tx.execute("DELETE FROM glossary_tag WHERE entry_id = ?1", [entry_id])?;
                for tag in tags {
                    tx.execute(
                        "INSERT INTO glossary_tag (entry_id, tag) VALUES (?1, ?2)",
                        rusqlite::params![entry_id, tag],
                    )?;
                }
            }

            // Revision per changed field.
            if let Some(term) = &patch.term {
                if *term != existing.term {
                    revisions::insert_tx(tx, entry_id, RevisionField::Term, Some(&existing.term), term, Some(post_id), None)?;
                }
            }
            if let Some(definition) = &patch.definition {
                if *definition != existing.definition {
                    revisions::insert_tx(
                        tx,
                        entry_id,
                        RevisionField::Definition,
                        Some(&existing.definition),
                        definition,
                        Some(post_id),
                        None,
                    )?;
                }
            }
            if let Some(tags) = &patch.tags {
                if *tags != existing.tags {
                    let old_json = serde_json::to_string(&existing.tags)?;
                    let new_json = serde_json::to_string(tags)?;
                    revisions::insert_tx(tx, entry_id, RevisionField::Tags, Some(&old_json), &new_json, Some(post_id), None)?;
                }
            }
            if let Some(status) = &patch.status {
                if *status != existing.status {
                    revisions::insert_tx(
                        tx,
                        entry_id,
                        RevisionField::Status,
                        Some(&existing.status.to_string()),
                        &status.to_string(),
                        Some(post_id),
                        None,
                    )?;
                }
            }

            Ok(true)
        })
    }

    /// Delete an entry. The curator_decision revision lands first in the
    /// same transaction so the audit outlives the row (the revision's
    /// entry reference nulls out on delete). Idempotent.
    #[instrument(skip(self, reason), fields(entry_id))]
    pub fn delete(&self, entry_id: i64, reason: &str, post_id: i64) -> Result<bool, StoreError> {
        self.db.with_tx(|tx| {
            let existing = match get_in_conn(tx, entry_id)? {
                Some(e) => e,
                None => return Ok(false),
            };

            revisions::insert_tx(
                tx,
                entry_id,
                RevisionField::CuratorDecision,
                Some(&existing.term),
                reason,
                Some(post_id),
                None,
            )?;
            tx.execute("DELETE FROM glossary_entry WHERE id = ?1", [entry_id])?;
            Ok(true)
        })
    }

    /// Every entry, ordered by normalized term (for exporters).
    pub fn all_entries(&self) -> Result<Vec<GlossaryEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM glossary_entry e ORDER BY e.term_normalized"
            ))?;
            let mut rows = stmt.query([])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                let mut entry = row_to_entry(row)?;
                entry.tags = get_tags(conn, entry.id)?;
                entries.push(entry);
            }
            Ok(entries)
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM glossary_entry", [], |row| row.get(0))?)
        })
    }

    pub fn count_by_status(&self) -> Result<Vec<(String, i64)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM glossary_entry GROUP BY status")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// Entries first seen in a thread.
    pub fn get_by_thread(&self, thread_id: i64) -> Result<Vec<GlossaryEntry>, StoreError> {
        self.entries_where("e.first_seen_thread_id = ?1", thread_id)
    }

    /// Entries last touched in a thread but created elsewhere.
    pub fn get_updated_in_thread(&self, thread_id: i64) -> Result<Vec<GlossaryEntry>, StoreError> {
        self.entries_where(
            "e.last_updated_thread_id = ?1 AND e.first_seen_thread_id != ?1",
            thread_id,
        )
    }

    /// Tentative entries first seen in a thread: the curator's worklist.
    pub fn get_tentative_by_thread(&self, thread_id: i64) -> Result<Vec<GlossaryEntry>, StoreError> {
        self.entries_where(
            "e.first_seen_thread_id = ?1 AND e.status = 'tentative'",
            thread_id,
        )
    }

    /// Look up an entry by its normalized term.
    pub fn get_by_normalized_term(&self, normalized: &str) -> Result<Option<GlossaryEntry>, StoreError> {
        self.db.with_conn(|conn| {
            match lookup_normalized(conn, normalized)? {
                Some(id) => get_in_conn(conn, id),
                None => Ok(None),
            }
        })
    }

    fn entries_where(&self, condition: &str, thread_id: i64) -> Result<Vec<GlossaryEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM glossary_entry e
                 WHERE {condition} ORDER BY e.term_normalized"
            ))?;
            let mut rows = stmt.query([thread_id])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                let mut entry = row_to_entry(row)?;
                entry.tags = get_tags(conn, entry.id)?;
                entries.push(entry);
            }
            Ok(entries)
        })
    }
}

fn build_fts_query(query: &str) -> String {
    if query.split_whitespace().count() <= 1 {
        format!("\"{}\"", query.replace('"', "\"\""))
    } else {
        query.to_string()
    }
}

fn lookup_normalized(conn: &Connection, normalized: &str) -> Result<Option<i64>, StoreError> {
    let mut stmt = conn.prepare("SELECT id FROM glossary_entry WHERE term_normalized = ?1")?;
    let mut rows = stmt.query([normalized])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

fn get_in_conn(conn: &Connection, entry_id: i64) -> Result<Option<GlossaryEntry>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM glossary_entry e WHERE e.id = ?1"
    ))?;
    let mut rows = stmt.query([entry_id])?;
    match rows.next()? {
        Some(row) => {
            let mut entry = row_to_entry(row)?;
            entry.tags = get_tags(conn, entry.id)?;
            Ok(Some(entry))
        }
        None => Ok(None),
    }
}

fn get_tags(conn: &Connection, entry_id: i64) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare("SELECT tag FROM glossary_tag WHERE entry_id = ?1 ORDER BY tag")?;
    let rows = stmt.query_map([entry_id], |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<GlossaryEntry, StoreError> {
    let status_raw: String = row_helpers::get(row, 4, "glossary_entry", "status")?;
    Ok(GlossaryEntry {
        id: row_helpers::get(row, 0, "glossary_entry", "id")?,
        term: row_helpers::get(row, 1, "glossary_entry", "term")?,
        term_normalized: row_helpers::get(row, 2, "glossary_entry", "term_normalized")?,
        definition: row_helpers::get(row, 3, "glossary_entry", "definition")?,
        status: row_helpers::parse_enum(&status_raw, "glossary_entry", "status")?,
        tags: Vec::new(),
        first_seen_post_id: row_helpers::get(row, 5, "glossary_entry", "first_seen_post_id")?,
        first_seen_thread_id: row_helpers::get(row, 6, "glossary_entry", "first_seen_thread_id")?,
        last_updated_post_id: row_helpers::get(row, 7, "glossary_entry", "last_updated_post_id")?,
        last_updated_thread_id: row_helpers::get(row, 8, "glossary_entry", "last_updated_thread_id")?,
        created_at: row_helpers::get(row, 9, "glossary_entry", "created_at")?,
        updated_at: row_helpers::get(row, 10, "glossary_entry", "updated_at")?,
    })
}

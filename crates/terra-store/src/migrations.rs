//! Versioned schema migrations for annotator.db.
//!
//! Each migration runs in one transaction and records itself in
//! `schema_version(version, applied_at)`.

pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

/// Migration 1: all core tables.
const INITIAL_SCHEMA: Migration = Migration {
    version: 1,
    name: "initial_schema",
    statements: &[
        "CREATE TABLE schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        "CREATE TABLE glossary_entry (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            term TEXT NOT NULL,
            term_normalized TEXT NOT NULL,
            definition TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'tentative'
                CHECK (status IN ('confirmed', 'tentative')),
            first_seen_post_id INTEGER NOT NULL,
            first_seen_thread_id INTEGER NOT NULL,
            last_updated_post_id INTEGER NOT NULL,
            last_updated_thread_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(term_normalized)
        )",
        "CREATE INDEX idx_glossary_term ON glossary_entry(term_normalized)",
        "CREATE INDEX idx_glossary_status ON glossary_entry(status)",
        "CREATE INDEX idx_glossary_updated ON glossary_entry(updated_at)",
        "CREATE TABLE glossary_tag (
            entry_id INTEGER NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (entry_id, tag),
            FOREIGN KEY (entry_id) REFERENCES glossary_entry(id) ON DELETE CASCADE
        )",
        "CREATE INDEX idx_tag ON glossary_tag(tag)",
        // The deletion audit must outlive its entry, so both references
        // null out instead of cascading.
        "CREATE TABLE revision (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id INTEGER,
            snapshot_id INTEGER,
            field_name TEXT NOT NULL,
            old_value TEXT,
            new_value TEXT NOT NULL,
            changed_at TEXT NOT NULL,
            source_post_id INTEGER,
            FOREIGN KEY (entry_id) REFERENCES glossary_entry(id) ON DELETE SET NULL,
            FOREIGN KEY (snapshot_id) REFERENCES snapshot(id) ON DELETE SET NULL
        )",
        "CREATE INDEX idx_revision_entry ON revision(entry_id, changed_at)",
        "CREATE TABLE snapshot (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            snapshot_type TEXT NOT NULL
                CHECK (snapshot_type IN ('checkpoint', 'curator_fork', 'manual')),
            created_at TEXT NOT NULL,
            last_post_id INTEGER NOT NULL,
            last_thread_id INTEGER NOT NULL,
            thread_position INTEGER NOT NULL,
            glossary_entry_count INTEGER NOT NULL,
            context_token_count INTEGER
        )",
        "CREATE INDEX idx_snapshot_created ON snapshot(created_at)",
        "CREATE INDEX idx_snapshot_thread ON snapshot(last_thread_id)",
        "CREATE INDEX idx_snapshot_type ON snapshot(snapshot_type)",
        "CREATE TABLE snapshot_context (
            snapshot_id INTEGER PRIMARY KEY,
            system_prompt TEXT NOT NULL,
            cumulative_summary TEXT,
            chunk_summaries TEXT NOT NULL,
            thread_summaries TEXT NOT NULL,
            conversation_history TEXT NOT NULL,
            current_thread_id INTEGER,
            current_scene_index INTEGER NOT NULL DEFAULT 0,
            completed_thread_ids TEXT NOT NULL DEFAULT '[]',
            summarized_chunk_indices TEXT NOT NULL DEFAULT '[]',
            merged_thread_ids TEXT NOT NULL DEFAULT '[]',
            FOREIGN KEY (snapshot_id) REFERENCES snapshot(id) ON DELETE CASCADE
        )",
        "CREATE TABLE snapshot_entry (
            snapshot_id INTEGER NOT NULL,
            entry_id INTEGER NOT NULL,
            definition_at_snapshot TEXT NOT NULL,
            status_at_snapshot TEXT NOT NULL,
            PRIMARY KEY (snapshot_id, entry_id),
            FOREIGN KEY (snapshot_id) REFERENCES snapshot(id) ON DELETE CASCADE,
            FOREIGN KEY (entry_id) REFERENCES glossary_entry(id) ON DELETE CASCADE
        )",
        "CREATE INDEX idx_snapshot_entry_entry ON snapshot_entry(entry_id)",
        "CREATE TABLE run_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_post_id INTEGER,
            last_thread_id INTEGER,
            current_snapshot_id INTEGER,
            run_started_at TEXT,
            run_updated_at TEXT,
            total_posts_processed INTEGER NOT NULL DEFAULT 0,
            total_entries_created INTEGER NOT NULL DEFAULT 0,
            total_entries_updated INTEGER NOT NULL DEFAULT 0
        )",
        "INSERT INTO run_state (id) VALUES (1)",
        "CREATE TABLE thread_state (
            thread_id INTEGER PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'in_progress', 'completed')),
            summary TEXT,
            posts_processed INTEGER NOT NULL DEFAULT 0,
            entries_created INTEGER NOT NULL DEFAULT 0,
            entries_updated INTEGER NOT NULL DEFAULT 0,
            started_at TEXT,
            completed_at TEXT
        )",
        "CREATE INDEX idx_thread_status ON thread_state(status)",
    ],
};

/// Migration 2: FTS5 over (term, definition) with sync triggers.
const FTS_SCHEMA: Migration = Migration {
    version: 2,
    name: "add_fts5",
    statements: &[
        "CREATE VIRTUAL TABLE glossary_fts USING fts5(
            term,
            definition,
            content='glossary_entry',
            content_rowid='id'
        )",
        "CREATE TRIGGER glossary_fts_insert AFTER INSERT ON glossary_entry BEGIN
            INSERT INTO glossary_fts(rowid, term, definition)
            VALUES (NEW.id, NEW.term, NEW.definition);
        END",
        "CREATE TRIGGER glossary_fts_update AFTER UPDATE ON glossary_entry BEGIN
            INSERT INTO glossary_fts(glossary_fts, rowid, term, definition)
            VALUES ('delete', OLD.id, OLD.term, OLD.definition);
            INSERT INTO glossary_fts(rowid, term, definition)
            VALUES (NEW.id, NEW.term, NEW.definition);
        END",
        "CREATE TRIGGER glossary_fts_delete AFTER DELETE ON glossary_entry BEGIN
            INSERT INTO glossary_fts(glossary_fts, rowid, term, definition)
            VALUES ('delete', OLD.id, OLD.term, OLD.definition);
        END",
    ],
};

/// Migration 3: index the revision → snapshot reference.
const REVISION_SNAPSHOT_INDEX: Migration = Migration {
    version: 3,
    name: "add_revision_snapshot_index",
    statements: &["CREATE INDEX idx_revision_snapshot ON revision(snapshot_id)"],
};

pub const ALL_MIGRATIONS: &[Migration] = &[INITIAL_SCHEMA, FTS_SCHEMA, REVISION_SNAPSHOT_INDEX];

pub const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
";

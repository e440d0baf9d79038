use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use terra_core::entry::{normalize_term, EntryPatch, EntryStatus, GlossaryEntry, RevisionField};
use terra_core::messages::{ToolCall, ToolDefinition};
use terra_corpus::{CorpusError, CorpusReader};
use terra_llm::AgentApi;
use terra_store::{
    GlossaryRepo, RevisionRepo, SearchOptions, SnapshotRepo, StatusFilter, StoreError,
};

use crate::schemas;
use crate::summon::SummonState;
use crate::xml::{self, escape, tool_error};

/// Result of a dispatched tool call, ready to append as a tool turn.
#[derive(Clone, Debug)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub success: bool,
    pub body: String,
}

/// Mutation counters for the scene in progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SceneStats {
    pub entries_created: i64,
    pub entries_updated: i64,
    pub entries_deleted: i64,
}

/// Failures that escape to the runner: storage and corpus-layer errors.
/// Everything domain-level is routed back to the model as a
/// `<tool_error>` result.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
}

enum Reply {
    Ok(String),
    /// Reason text, rendered as `<tool_error>`; starts with the error kind.
    Domain(String),
}

/// Routes tool calls to the glossary store, corpus reader, and snapshot
/// store. Holds the current (post, thread) position for provenance
/// stamping and the summon sub-state.
pub struct ToolDispatcher {
    glossary: GlossaryRepo,
    revisions: RevisionRepo,
    snapshots: SnapshotRepo,
    corpus: Arc<CorpusReader>,
    agent: Arc<dyn AgentApi>,

    post_id: i64,
    thread_id: i64,
    summon: Option<SummonState>,
    stats: SceneStats,
}

// Typed argument shapes; validation happens here so handlers see
// concrete values.

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    include_references: Option<bool>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct CreateArgs {
    term: String,
    definition: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct UpdateArgs {
    entry_id: i64,
    #[serde(default)]
    term: Option<String>,
    #[serde(default)]
    definition: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct DeleteArgs {
    entry_id: i64,
    reason: String,
}

#[derive(Deserialize)]
struct ReadPostArgs {
    post_id: i64,
    #[serde(default)]
    include_adjacent: Option<bool>,
}

#[derive(Deserialize)]
struct ReadThreadRangeArgs {
    thread_id: i64,
    #[serde(default)]
    start_post_id: Option<i64>,
    #[serde(default)]
    end_post_id: Option<i64>,
    #[serde(default)]
    tag_filter: Option<String>,
}

#[derive(Deserialize)]
struct SummonSnapshotArgs {
    snapshot_id: i64,
    #[serde(default)]
    query: Option<String>,
}

#[derive(Deserialize)]
struct SummonContinueArgs {
    message: String,
}

#[derive(Deserialize)]
struct SummonDismissArgs {
    summary: String,
}

impl ToolDispatcher {
    pub fn new(
        glossary: GlossaryRepo,
        revisions: RevisionRepo,
        snapshots: SnapshotRepo,
        corpus: Arc<CorpusReader>,
        agent: Arc<dyn AgentApi>,
    ) -> Self {
        Self {
            glossary,
            revisions,
            snapshots,
            corpus,
            agent,
            post_id: 0,
            thread_id: 0,
            summon: None,
            stats: SceneStats::default(),
        }
    }

    /// Stamp provenance for subsequent writes.
    pub fn set_position(&mut self, post_id: i64, thread_id: i64) {
        self.post_id = post_id;
        self.thread_id = thread_id;
    }

    pub fn has_active_summon(&self) -> bool {
        self.summon.is_some()
    }

    /// Drain the per-scene mutation counters.
    pub fn take_scene_stats(&mut self) -> SceneStats {
        std::mem::take(&mut self.stats)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        schemas::all_tool_definitions()
    }

    /// Execute one tool call. Domain failures come back as error results;
    /// only storage/corpus failures return `Err`.
    #[instrument(skip(self, call), fields(tool = %call.function.name, call_id = %call.id))]
    pub async fn dispatch(&mut self, call: &ToolCall) -> Result<ToolOutcome, DispatchError> {
        let name = call.function.name.clone();

        let args: serde_json::Value = match serde_json::from_str(&call.function.arguments) {
            Ok(v) => v,
            Err(e) => {
                return Ok(self.outcome(call, &name, Reply::Domain(format!("InvalidArguments: invalid JSON: {e}"))))
            }
        };

        let reply = match name.as_str() {
            "glossary_search" => self.handle_search(args)?,
            "glossary_create" => match self.write_guard() {
                Some(blocked) => blocked,
                None => self.handle_create(args)?,
            },
            "glossary_update" => match self.write_guard() {
                Some(blocked) => blocked,
                None => self.handle_update(args)?,
            },
            "glossary_delete" => match self.write_guard() {
                Some(blocked) => blocked,
                None => self.handle_delete(args)?,
            },
            "read_post" => self.handle_read_post(args)?,
            "read_thread_range" => self.handle_read_thread_range(args)?,
            "summon_snapshot" => self.handle_summon_snapshot(args).await?,
            "summon_continue" => self.handle_summon_continue(args).await,
            "summon_dismiss" => self.handle_summon_dismiss(args)?,
            _ => Reply::Domain(format!("UnknownTool: {name}")),
        };

        Ok(self.outcome(call, &name, reply))
    }

    fn outcome(&self, call: &ToolCall, name: &str, reply: Reply) -> ToolOutcome {
        match reply {
            Reply::Ok(body) => ToolOutcome {
                call_id: call.id.clone(),
                name: name.to_string(),
                success: true,
                body,
            },
            Reply::Domain(reason) => {
                warn!(tool = name, reason = %reason, "tool error");
                ToolOutcome {
                    call_id: call.id.clone(),
                    name: name.to_string(),
                    success: false,
                    body: tool_error(name, &reason),
                }
            }
        }
    }

    /// Writes are blocked for the duration of a summon.
    fn write_guard(&self) -> Option<Reply> {
        self.summon.as_ref().map(|s| {
            Reply::Domain(format!(
                "WriteBlockedDuringSummon: snapshot {} is summoned; dismiss it before writing",
                s.snapshot_id
            ))
        })
    }

    fn handle_search(&self, args: serde_json::Value) -> Result<Reply, DispatchError> {
        let a: SearchArgs = match parse_args(args) {
            Ok(a) => a,
            Err(reply) => return Ok(reply),
        };
        let status = match a.status.as_deref() {
            None => StatusFilter::All,
            Some(raw) => match raw.parse() {
                Ok(s) => s,
                Err(_) => return Ok(Reply::Domain(format!("InvalidArguments: unknown status '{raw}'"))),
            },
        };
        let opts = SearchOptions {
            tags: a.tags.unwrap_or_default(),
            status,
            limit: a.limit.unwrap_or(10),
        };
        let entries = self.glossary.search(&a.query, &opts)?;

        let mut lines = vec![format!(
            "<glossary_results query=\"{}\" count=\"{}\">",
            escape(&a.query),
            entries.len()
        )];
        for entry in &entries {
            lines.push(format!("  {}", xml::format_entry(entry)));
        }
        if a.include_references.unwrap_or(false) {
            for referenced in self.expand_references(&entries)? {
                lines.push(format!("  {}", xml::format_entry_as(&referenced, "referenced_entry")));
            }
        }
        lines.push("</glossary_results>".to_string());
        Ok(Reply::Ok(lines.join("\n")))
    }

    /// Resolve `[[Term]]` references in result definitions to entries not
    /// already present in the result set.
    fn expand_references(
        &self,
        entries: &[GlossaryEntry],
    ) -> Result<Vec<GlossaryEntry>, DispatchError> {
        let pattern = Regex::new(r"\[\[([^\]]+)\]\]").expect("static regex");
        let present: Vec<i64> = entries.iter().map(|e| e.id).collect();
        let mut resolved = Vec::new();
        let mut seen = present.clone();

        for entry in entries {
            for capture in pattern.captures_iter(&entry.definition) {
                let normalized = normalize_term(&capture[1]);
                if let Some(referenced) = self.glossary.get_by_normalized_term(&normalized)? {
                    if !seen.contains(&referenced.id) {
                        seen.push(referenced.id);
                        resolved.push(referenced);
                    }
                }
            }
        }
        Ok(resolved)
    }

    fn handle_create(&mut self, args: serde_json::Value) -> Result<Reply, DispatchError> {
        let a: CreateArgs = match parse_args(args) {
            Ok(a) => a,
            Err(reply) => return Ok(reply),
        };
        let status = match parse_status(a.status.as_deref()) {
            Ok(s) => s.unwrap_or(EntryStatus::Tentative),
            Err(reply) => return Ok(reply),
        };

        match self.glossary.create(
            &a.term,
            &a.definition,
            &a.tags.unwrap_or_default(),
            self.post_id,
            self.thread_id,
            status,
        ) {
            Ok(entry_id) => {
                info!(entry_id, term = %a.term, "created glossary entry");
                self.stats.entries_created += 1;
                Ok(Reply::Ok(format!(
                    "<glossary_created entry_id=\"{entry_id}\" term=\"{}\" status=\"{status}\"/>",
                    escape(&a.term)
                )))
            }
            Err(StoreError::DuplicateTerm { term, existing_id }) => Ok(Reply::Domain(format!(
                "DuplicateTerm: term '{term}' already exists (id={existing_id})"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn handle_update(&mut self, args: serde_json::Value) -> Result<Reply, DispatchError> {
        let a: UpdateArgs = match parse_args(args) {
            Ok(a) => a,
            Err(reply) => return Ok(reply),
        };
        let status = match parse_status(a.status.as_deref()) {
            Ok(s) => s,
            Err(reply) => return Ok(reply),
        };
        let patch = EntryPatch {
            term: a.term,
            definition: a.definition,
            tags: a.tags,
            status,
        };
        if patch.is_empty() {
            return Ok(Reply::Domain("InvalidArguments: no fields to update".into()));
        }

        match self.glossary.update(a.entry_id, &patch, self.post_id, self.thread_id) {
            Ok(true) => {
                self.stats.entries_updated += 1;
                let entry = self
                    .glossary
                    .get(a.entry_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("entry {} after update", a.entry_id)))?;
                Ok(Reply::Ok(format!(
                    "<glossary_updated entry_id=\"{}\">\n  {}\n</glossary_updated>",
                    a.entry_id,
                    xml::format_entry(&entry)
                )))
            }
            Ok(false) => Ok(Reply::Domain(format!(
                "EntryNotFound: no entry with id {}",
                a.entry_id
            ))),
            Err(StoreError::DuplicateTerm { term, existing_id }) => Ok(Reply::Domain(format!(
                "DuplicateTerm: term '{term}' already exists (id={existing_id})"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn handle_delete(&mut self, args: serde_json::Value) -> Result<Reply, DispatchError> {
        let a: DeleteArgs = match parse_args(args) {
            Ok(a) => a,
            Err(reply) => return Ok(reply),
        };
        let existing = self.glossary.get(a.entry_id)?;
        match self.glossary.delete(a.entry_id, &a.reason, self.post_id)? {
            true => {
                self.stats.entries_deleted += 1;
                let term = existing.map(|e| e.term).unwrap_or_default();
                info!(entry_id = a.entry_id, term = %term, reason = %a.reason, "deleted glossary entry");
                Ok(Reply::Ok(format!(
                    "<glossary_deleted entry_id=\"{}\" term=\"{}\"/>",
                    a.entry_id,
                    escape(&term)
                )))
            }
            false => Ok(Reply::Domain(format!(
                "EntryNotFound: no entry with id {}",
                a.entry_id
            ))),
        }
    }

    fn handle_read_post(&self, args: serde_json::Value) -> Result<Reply, DispatchError> {
        let a: ReadPostArgs = match parse_args(args) {
            Ok(a) => a,
            Err(reply) => return Ok(reply),
        };
        let post = match self.corpus.get_post(a.post_id)? {
            Some(p) => p,
            None => {
                return Ok(Reply::Domain(format!("PostNotFound: no post with id {}", a.post_id)))
            }
        };

        if a.include_adjacent.unwrap_or(false) {
            let window = self.corpus.get_adjacent_posts(a.post_id, 2, 2)?;
            let mut lines = vec![format!(
                "<corpus_posts post_id=\"{}\" count=\"{}\">",
                a.post_id,
                window.len()
            )];
            for post in &window {
                lines.push(format!("  {}", xml::format_post(post)));
            }
            lines.push("</corpus_posts>".to_string());
            Ok(Reply::Ok(lines.join("\n")))
        } else {
            Ok(Reply::Ok(xml::format_post(&post)))
        }
    }

    fn handle_read_thread_range(&self, args: serde_json::Value) -> Result<Reply, DispatchError> {
        let a: ReadThreadRangeArgs = match parse_args(args) {
            Ok(a) => a,
            Err(reply) => return Ok(reply),
        };
        let posts = self.corpus.get_posts_range(
            a.thread_id,
            a.start_post_id,
            a.end_post_id,
            a.tag_filter.as_deref(),
        )?;
        if posts.is_empty() {
            return Ok(Reply::Domain(format!(
                "EmptyRange: no posts found in thread {}",
                a.thread_id
            )));
        }

        let mut lines = vec![format!(
            "<corpus_thread thread_id=\"{}\" count=\"{}\">",
            a.thread_id,
            posts.len()
        )];
        for post in &posts {
            lines.push(format!("  {}", xml::format_post(post)));
        }
        lines.push("</corpus_thread>".to_string());
        Ok(Reply::Ok(lines.join("\n")))
    }

    async fn handle_summon_snapshot(&mut self, args: serde_json::Value) -> Result<Reply, DispatchError> {
        let a: SummonSnapshotArgs = match parse_args(args) {
            Ok(a) => a,
            Err(reply) => return Ok(reply),
        };
        if let Some(active) = &self.summon {
            return Ok(Reply::Domain(format!(
                "SummonActive: snapshot {} is already summoned; dismiss it first",
                active.snapshot_id
            )));
        }

        let snapshot = match self.snapshots.get(a.snapshot_id)? {
            Some(s) => s,
            None => {
                return Ok(Reply::Domain(format!(
                    "SnapshotNotFound: no snapshot with id {}",
                    a.snapshot_id
                )))
            }
        };
        let context = match self.snapshots.get_context(a.snapshot_id)? {
            Some(c) => c,
            None => {
                return Ok(Reply::Domain(format!(
                    "SnapshotNotFound: snapshot {} has no stored context",
                    a.snapshot_id
                )))
            }
        };
        let entries = self.snapshots.get_entries(a.snapshot_id)?;

        let mut summon = SummonState::new(a.snapshot_id, context, entries);
        let response = match &a.query {
            Some(query) => match summon.converse(self.agent.as_ref(), query).await {
                Ok(answer) => Some(answer),
                Err(e) => {
                    warn!(error = %e, "summon opening query failed");
                    None
                }
            },
            None => None,
        };

        info!(snapshot_id = a.snapshot_id, "summon activated");
        let body = summon.format_activation(&snapshot, response.as_deref());
        self.summon = Some(summon);
        Ok(Reply::Ok(body))
    }

    async fn handle_summon_continue(&mut self, args: serde_json::Value) -> Reply {
        let a: SummonContinueArgs = match parse_args(args) {
            Ok(a) => a,
            Err(reply) => return reply,
        };
        let summon = match self.summon.as_mut() {
            Some(s) => s,
            None => return Reply::Domain("NoActiveSummon: use summon_snapshot first".into()),
        };

        match summon.converse(self.agent.as_ref(), &a.message).await {
            Ok(answer) => Reply::Ok(format!(
                "<summon_response snapshot_id=\"{}\">{}</summon_response>",
                summon.snapshot_id,
                escape(&answer)
            )),
            Err(e) => Reply::Domain(format!("AgentUnavailable: {e}")),
        }
    }

    fn handle_summon_dismiss(&mut self, args: serde_json::Value) -> Result<Reply, DispatchError> {
        let a: SummonDismissArgs = match parse_args(args) {
            Ok(a) => a,
            Err(reply) => return Ok(reply),
        };
        let summon = match self.summon.take() {
            Some(s) => s,
            None => return Ok(Reply::Domain("NoActiveSummon: nothing to dismiss".into())),
        };

        // The dialogue note survives as part of the audit trail.
        self.revisions.log_change(
            None,
            RevisionField::CuratorDecision,
            None,
            &format!("summon_dismiss: {}", a.summary),
            Some(self.post_id),
            Some(summon.snapshot_id),
        )?;

        info!(snapshot_id = summon.snapshot_id, turns = summon.turn_count(), "summon dismissed");
        Ok(Reply::Ok(format!(
            "<summon_dismissed snapshot_id=\"{}\" turns=\"{}\"/>",
            summon.snapshot_id,
            summon.turn_count()
        )))
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: serde_json::Value) -> Result<T, Reply> {
    serde_json::from_value(args).map_err(|e| Reply::Domain(format!("InvalidArguments: {e}")))
}

fn parse_status(raw: Option<&str>) -> Result<Option<EntryStatus>, Reply> {
    match raw {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| Reply::Domain(format!("InvalidArguments: unknown status '{s}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terra_core::snapshot::SnapshotType;
    use terra_llm::{MockAgent, MockResponse};
    use terra_store::{Database, SnapshotContext, SnapshotInput};

    fn seed_corpus(dir: &tempfile::TempDir) -> Arc<CorpusReader> {
        let path = dir.path().join("corpus.db");
        let conn = rusqlite_open(&path);
        conn.execute_batch(
            "CREATE TABLE thread (id INTEGER PRIMARY KEY, title TEXT);
             CREATE TABLE post (
                 thread_id INTEGER NOT NULL, id INTEGER PRIMARY KEY,
                 name TEXT, trip_code TEXT, subject TEXT,
                 time INTEGER, file_url TEXT, file_name TEXT, body TEXT
             );
             CREATE TABLE tag (post_id INTEGER NOT NULL, name TEXT NOT NULL);
             CREATE TABLE link (link_from INTEGER, link_to INTEGER);
             INSERT INTO thread (id, title) VALUES (1, 'Thread One');
             INSERT INTO post (thread_id, id, name, time, body)
                 VALUES (1, 99, 'anon', 1500000099, 'preamble'),
                        (1, 100, 'QM', 1500000100, 'Soma greeted the party'),
                        (1, 101, 'anon', 1500000101, 'reader comment'),
                        (1, 102, 'QM', 1500000102, 'The vatis spoke');
             INSERT INTO tag (post_id, name) VALUES (100, 'qm_post'), (102, 'qm_post');",
        )
        .unwrap();
        drop(conn);
        Arc::new(CorpusReader::open(&path).unwrap())
    }

    fn rusqlite_open(path: &std::path::Path) -> rusqlite::Connection {
        rusqlite::Connection::open(path).unwrap()
    }

    fn dispatcher_with(agent: MockAgent) -> (tempfile::TempDir, Database, ToolDispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().unwrap();
        let corpus = seed_corpus(&dir);
        let mut dispatcher = ToolDispatcher::new(
            GlossaryRepo::new(db.clone()),
            RevisionRepo::new(db.clone()),
            SnapshotRepo::new(db.clone()),
            corpus,
            Arc::new(agent),
        );
        dispatcher.set_position(100, 1);
        (dir, db, dispatcher)
    }

    fn dispatcher() -> (tempfile::TempDir, Database, ToolDispatcher) {
        dispatcher_with(MockAgent::new(vec![]))
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall::new(format!("call_{name}"), name, args)
    }

    async fn run(dispatcher: &mut ToolDispatcher, name: &str, args: serde_json::Value) -> ToolOutcome {
        dispatcher.dispatch(&call(name, args)).await.unwrap()
    }

    fn glossary_hash(db: &Database) -> Vec<(i64, String, String)> {
        db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, term, definition FROM glossary_entry ORDER BY id")
                .unwrap();
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .unwrap();
            Ok(rows.collect::<Result<Vec<_>, _>>().unwrap())
        })
        .unwrap()
    }

    #[tokio::test]
    async fn create_stamps_position_and_counts() {
        let (_dir, db, mut dispatcher) = dispatcher();
        let outcome = run(
            &mut dispatcher,
            "glossary_create",
            serde_json::json!({"term": "Soma", "definition": "Questmaster NPC", "tags": ["character"]}),
        )
        .await;

        assert!(outcome.success);
        assert!(outcome.body.contains("<glossary_created entry_id=\"1\""));
        assert!(outcome.body.contains("status=\"tentative\""));

        let entry = GlossaryRepo::new(db).get(1).unwrap().unwrap();
        assert_eq!(entry.first_seen_post_id, 100);
        assert_eq!(entry.first_seen_thread_id, 1);
        assert_eq!(dispatcher.take_scene_stats().entries_created, 1);
        assert_eq!(dispatcher.take_scene_stats(), SceneStats::default());
    }

    #[tokio::test]
    async fn duplicate_create_returns_tool_error_and_scene_continues() {
        let (_dir, _db, mut dispatcher) = dispatcher();
        run(
            &mut dispatcher,
            "glossary_create",
            serde_json::json!({"term": "Soma", "definition": "Questmaster NPC", "tags": []}),
        )
        .await;

        let outcome = run(
            &mut dispatcher,
            "glossary_create",
            serde_json::json!({"term": "Soma", "definition": "dup", "tags": []}),
        )
        .await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.body,
            "<tool_error name=\"glossary_create\">DuplicateTerm: term 'Soma' already exists (id=1)</tool_error>"
        );

        // The model recovers with an update, as the scene protocol allows.
        let outcome = run(
            &mut dispatcher,
            "glossary_update",
            serde_json::json!({"entry_id": 1, "definition": "Questmaster NPC, leader of the vatis"}),
        )
        .await;
        assert!(outcome.success);
        assert!(outcome.body.contains("<glossary_updated entry_id=\"1\">"));
        assert!(outcome.body.contains("leader of the vatis"));
    }

    #[tokio::test]
    async fn update_missing_entry() {
        let (_dir, _db, mut dispatcher) = dispatcher();
        let outcome = run(
            &mut dispatcher,
            "glossary_update",
            serde_json::json!({"entry_id": 42, "definition": "x"}),
        )
        .await;
        assert!(!outcome.success);
        assert!(outcome.body.contains("EntryNotFound"));
    }

    #[tokio::test]
    async fn delete_requires_reason_and_logs_it() {
        let (_dir, db, mut dispatcher) = dispatcher();
        run(
            &mut dispatcher,
            "glossary_create",
            serde_json::json!({"term": "vatis", "definition": "order of seers", "tags": []}),
        )
        .await;

        // Missing reason is an argument error.
        let outcome = run(&mut dispatcher, "glossary_delete", serde_json::json!({"entry_id": 1})).await;
        assert!(!outcome.success);
        assert!(outcome.body.contains("InvalidArguments"));

        let outcome = run(
            &mut dispatcher,
            "glossary_delete",
            serde_json::json!({"entry_id": 1, "reason": "not actually a term"}),
        )
        .await;
        assert!(outcome.success);
        assert!(outcome.body.contains("<glossary_deleted entry_id=\"1\" term=\"vatis\"/>"));

        let orphaned = RevisionRepo::new(db).history_for_deleted(10).unwrap();
        assert!(orphaned
            .iter()
            .any(|r| r.field_name == RevisionField::CuratorDecision
                && r.new_value.contains("not actually a term")));
    }

    #[tokio::test]
    async fn search_renders_results() {
        let (_dir, _db, mut dispatcher) = dispatcher();
        run(
            &mut dispatcher,
            "glossary_create",
            serde_json::json!({"term": "Soma", "definition": "Questmaster NPC", "tags": ["character"]}),
        )
        .await;

        let outcome = run(
            &mut dispatcher,
            "glossary_search",
            serde_json::json!({"query": "Questmaster"}),
        )
        .await;
        assert!(outcome.success);
        assert!(outcome.body.starts_with("<glossary_results query=\"Questmaster\" count=\"1\">"));
        assert!(outcome.body.contains("term=\"Soma\""));
    }

    #[tokio::test]
    async fn search_expands_references_on_request() {
        let (_dir, _db, mut dispatcher) = dispatcher();
        run(
            &mut dispatcher,
            "glossary_create",
            serde_json::json!({"term": "Vatis", "definition": "Order of seers", "tags": []}),
        )
        .await;
        run(
            &mut dispatcher,
            "glossary_create",
            serde_json::json!({"term": "Soma", "definition": "Leader of the [[Vatis]]", "tags": []}),
        )
        .await;

        let plain = run(
            &mut dispatcher,
            "glossary_search",
            serde_json::json!({"query": "Leader"}),
        )
        .await;
        assert!(!plain.body.contains("referenced_entry"));

        let expanded = run(
            &mut dispatcher,
            "glossary_search",
            serde_json::json!({"query": "Leader", "include_references": true}),
        )
        .await;
        assert!(expanded.body.contains("<referenced_entry id=\"1\" term=\"Vatis\""));
    }

    #[tokio::test]
    async fn read_post_with_and_without_adjacency() {
        let (_dir, _db, mut dispatcher) = dispatcher();
        let single = run(&mut dispatcher, "read_post", serde_json::json!({"post_id": 100})).await;
        assert!(single.success);
        assert!(single.body.starts_with("<corpus_post id=\"100\""));
        assert!(single.body.contains("Soma greeted the party"));

        let window = run(
            &mut dispatcher,
            "read_post",
            serde_json::json!({"post_id": 100, "include_adjacent": true}),
        )
        .await;
        assert!(window.body.starts_with("<corpus_posts post_id=\"100\""));
        assert!(window.body.contains("id=\"99\""));
        assert!(window.body.contains("id=\"102\""));

        let missing = run(&mut dispatcher, "read_post", serde_json::json!({"post_id": 999})).await;
        assert!(!missing.success);
        assert!(missing.body.contains("PostNotFound"));
    }

    #[tokio::test]
    async fn read_thread_range_filters_by_tag() {
        let (_dir, _db, mut dispatcher) = dispatcher();
        let outcome = run(
            &mut dispatcher,
            "read_thread_range",
            serde_json::json!({"thread_id": 1, "tag_filter": "qm_post"}),
        )
        .await;
        assert!(outcome.success);
        assert!(outcome.body.starts_with("<corpus_thread thread_id=\"1\" count=\"2\">"));

        let empty = run(
            &mut dispatcher,
            "read_thread_range",
            serde_json::json!({"thread_id": 7}),
        )
        .await;
        assert!(!empty.success);
        assert!(empty.body.contains("EmptyRange"));
    }

    #[tokio::test]
    async fn unknown_tool_and_malformed_json() {
        let (_dir, _db, mut dispatcher) = dispatcher();
        let outcome = run(&mut dispatcher, "glossary_upsert", serde_json::json!({})).await;
        assert!(!outcome.success);
        assert!(outcome.body.contains("UnknownTool"));

        let mut bad = call("glossary_search", serde_json::json!({}));
        bad.function.arguments = "{not json".to_string();
        let outcome = dispatcher.dispatch(&bad).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.body.contains("InvalidArguments"));
    }

    fn seed_snapshot(db: &Database) -> i64 {
        SnapshotRepo::new(db.clone())
            .create(&SnapshotInput {
                snapshot_type: SnapshotType::Checkpoint,
                last_post_id: 100,
                last_thread_id: 1,
                thread_position: 0,
                token_count: None,
                context: SnapshotContext {
                    system_prompt: "You are the annotator.".into(),
                    cumulative_summary: Some("Soma appeared.".into()),
                    ..Default::default()
                },
                entry_states: vec![],
            })
            .unwrap()
    }

    #[tokio::test]
    async fn summon_dialogue_is_read_only() {
        let agent = MockAgent::new(vec![
            MockResponse::text("Soma is the questmaster."),
            MockResponse::text("No known allies yet."),
        ]);
        let (_dir, db, mut dispatcher) = dispatcher_with(agent);
        run(
            &mut dispatcher,
            "glossary_create",
            serde_json::json!({"term": "Soma", "definition": "Questmaster NPC", "tags": []}),
        )
        .await;
        let snapshot_id = seed_snapshot(&db);
        let hash_before = glossary_hash(&db);
        dispatcher.take_scene_stats();

        let opened = run(
            &mut dispatcher,
            "summon_snapshot",
            serde_json::json!({"snapshot_id": snapshot_id, "query": "who is Soma?"}),
        )
        .await;
        assert!(opened.success);
        assert!(opened.body.contains("<summon_active"));
        assert!(opened.body.contains("Soma is the questmaster."));
        assert!(dispatcher.has_active_summon());

        // A second summon is rejected while one is active.
        let nested = run(
            &mut dispatcher,
            "summon_snapshot",
            serde_json::json!({"snapshot_id": snapshot_id}),
        )
        .await;
        assert!(!nested.success);
        assert!(nested.body.contains("SummonActive"));

        // Writes are blocked without mutating.
        let blocked = run(
            &mut dispatcher,
            "glossary_create",
            serde_json::json!({"term": "Anut", "definition": "rival", "tags": []}),
        )
        .await;
        assert!(!blocked.success);
        assert!(blocked.body.contains("WriteBlockedDuringSummon"));
        let blocked = run(
            &mut dispatcher,
            "glossary_update",
            serde_json::json!({"entry_id": 1, "definition": "changed"}),
        )
        .await;
        assert!(blocked.body.contains("WriteBlockedDuringSummon"));
        let blocked = run(
            &mut dispatcher,
            "glossary_delete",
            serde_json::json!({"entry_id": 1, "reason": "x"}),
        )
        .await;
        assert!(blocked.body.contains("WriteBlockedDuringSummon"));

        // Reads still work.
        let read = run(&mut dispatcher, "read_post", serde_json::json!({"post_id": 100})).await;
        assert!(read.success);

        let follow = run(
            &mut dispatcher,
            "summon_continue",
            serde_json::json!({"message": "any allies?"}),
        )
        .await;
        assert!(follow.success);
        assert!(follow.body.contains("No known allies yet."));

        let dismissed = run(
            &mut dispatcher,
            "summon_dismiss",
            serde_json::json!({"summary": "discussed Soma's role"}),
        )
        .await;
        assert!(dismissed.success);
        assert!(dismissed.body.contains("turns=\"4\""));
        assert!(!dispatcher.has_active_summon());

        // Store unchanged; no mutation counters moved; note recorded.
        assert_eq!(glossary_hash(&db), hash_before);
        assert_eq!(dispatcher.take_scene_stats(), SceneStats::default());
        let notes = RevisionRepo::new(db).history_for_deleted(10).unwrap();
        assert!(notes
            .iter()
            .any(|r| r.new_value.contains("discussed Soma's role")
                && r.snapshot_id == Some(snapshot_id)));
    }

    #[tokio::test]
    async fn summon_requires_existing_snapshot() {
        let (_dir, _db, mut dispatcher) = dispatcher();
        let outcome = run(
            &mut dispatcher,
            "summon_snapshot",
            serde_json::json!({"snapshot_id": 99}),
        )
        .await;
        assert!(!outcome.success);
        assert!(outcome.body.contains("SnapshotNotFound"));

        let outcome = run(
            &mut dispatcher,
            "summon_continue",
            serde_json::json!({"message": "hello?"}),
        )
        .await;
        assert!(outcome.body.contains("NoActiveSummon"));

        let outcome = run(
            &mut dispatcher,
            "summon_dismiss",
            serde_json::json!({"summary": "nothing"}),
        )
        .await;
        assert!(outcome.body.contains("NoActiveSummon"));
    }

    #[tokio::test]
    async fn write_tools_resume_after_dismiss() {
        let agent = MockAgent::new(vec![]);
        let (_dir, db, mut dispatcher) = dispatcher_with(agent);
        let snapshot_id = seed_snapshot(&db);

        run(
            &mut dispatcher,
            "summon_snapshot",
            serde_json::json!({"snapshot_id": snapshot_id}),
        )
        .await;
        run(
            &mut dispatcher,
            "summon_dismiss",
            serde_json::json!({"summary": "looked around"}),
        )
        .await;

        let outcome = run(
            &mut dispatcher,
            "glossary_create",
            serde_json::json!({"term": "Anut", "definition": "rival", "tags": []}),
        )
        .await;
        assert!(outcome.success);
    }
}

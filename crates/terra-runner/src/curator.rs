use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use terra_context::prompts::CURATOR_SYSTEM_PROMPT;
use terra_context::AnnotationContext;
use terra_core::entry::{EntryPatch, EntryStatus, GlossaryEntry, RevisionField};
use terra_core::messages::{ChatMessage, Role};
use terra_core::turn::Turn;
use terra_corpus::CorpusReader;
use terra_llm::{AgentApi, ChatRequest};
use terra_store::{GlossaryRepo, RevisionRepo, SearchOptions};
use terra_tools::xml;

use crate::error::RunnerError;

/// Posts of context shown around an entry's first appearance.
const CONTEXT_POSTS: usize = 3;
const NEIGHBOR_LIMIT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CuratorAction {
    Confirm,
    Reject,
    Merge,
    Revise,
}

impl std::fmt::Display for CuratorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirm => write!(f, "CONFIRM"),
            Self::Reject => write!(f, "REJECT"),
            Self::Merge => write!(f, "MERGE"),
            Self::Revise => write!(f, "REVISE"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CuratorDecision {
    pub entry_id: i64,
    pub entry_term: String,
    pub action: CuratorAction,
    pub target_id: Option<i64>,
    pub revised_definition: Option<String>,
    pub reasoning: String,
}

#[derive(Clone, Debug, Default)]
pub struct CuratorResult {
    pub thread_id: i64,
    pub entries_evaluated: usize,
    pub confirmed: usize,
    pub rejected: usize,
    pub merged: usize,
    pub revised: usize,
    pub decisions: Vec<CuratorDecision>,
}

#[derive(Deserialize)]
struct DecisionPayload {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    target_id: Option<i64>,
    #[serde(default)]
    revised_definition: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// End-of-thread adjudication of tentative entries. Runs against a
/// discarded fork of the annotation context with the curator prompt
/// swapped in; decisions apply to the main glossary in receipt order.
pub struct Curator {
    glossary: GlossaryRepo,
    revisions: RevisionRepo,
    corpus: Arc<CorpusReader>,
    agent: Arc<dyn AgentApi>,
}

impl Curator {
    pub fn new(
        glossary: GlossaryRepo,
        revisions: RevisionRepo,
        corpus: Arc<CorpusReader>,
        agent: Arc<dyn AgentApi>,
    ) -> Self {
        Self {
            glossary,
            revisions,
            corpus,
            agent,
        }
    }

    /// Evaluate every tentative entry first seen in `thread_id`.
    /// `boundary_post_id` stamps the curator's writes. The fork is
    /// mutated freely and dropped by the caller.
    #[instrument(skip(self, fork), fields(thread_id))]
    pub async fn run(
        &self,
        fork: &mut AnnotationContext,
        thread_id: i64,
        boundary_post_id: i64,
    ) -> Result<CuratorResult, RunnerError> {
        fork.system_prompt = CURATOR_SYSTEM_PROMPT.to_string();

        let mut result = CuratorResult {
            thread_id,
            ..Default::default()
        };
        let entries = self.glossary.get_tentative_by_thread(thread_id)?;
        if entries.is_empty() {
            debug!(thread_id, "no tentative entries to curate");
            return Ok(result);
        }
        info!(thread_id, count = entries.len(), "curator evaluating tentative entries");

        for entry in entries {
            result.entries_evaluated += 1;
            let decision = self.evaluate(fork, &entry).await?;
            self.apply(&decision, boundary_post_id, thread_id)?;

            match decision.action {
                CuratorAction::Confirm => result.confirmed += 1,
                CuratorAction::Reject => result.rejected += 1,
                CuratorAction::Merge => result.merged += 1,
                CuratorAction::Revise => result.revised += 1,
            }
            result.decisions.push(decision);
        }

        info!(
            thread_id,
            confirmed = result.confirmed,
            rejected = result.rejected,
            merged = result.merged,
            revised = result.revised,
            "curator complete"
        );
        Ok(result)
    }

    async fn evaluate(
        &self,
        fork: &mut AnnotationContext,
        entry: &GlossaryEntry,
    ) -> Result<CuratorDecision, RunnerError> {
        let payload = self.evaluation_payload(entry)?;
        let messages = vec![
            ChatMessage::system(fork.system_prompt.clone()),
            ChatMessage::user(payload.clone()),
        ];
        let request = ChatRequest::new(messages).with_sampling(0.3, 256);

        let decision = match self.agent.chat(request).await {
            Ok(response) => {
                let content = response.message.content.clone();
                fork.record_turn(Turn::new(Role::User, payload));
                fork.record_turn(Turn::new(Role::Assistant, content.clone()));
                parse_decision(&content, entry)
            }
            Err(e) => {
                // Conservative default: keep the entry.
                warn!(entry_id = entry.id, error = %e, "curator evaluation failed, confirming");
                CuratorDecision {
                    entry_id: entry.id,
                    entry_term: entry.term.clone(),
                    action: CuratorAction::Confirm,
                    target_id: None,
                    revised_definition: None,
                    reasoning: format!("evaluation failed, defaulting to confirm: {e}"),
                }
            }
        };

        debug!(
            entry_id = entry.id,
            term = %entry.term,
            action = %decision.action,
            "curator decision"
        );
        Ok(decision)
    }

    fn evaluation_payload(&self, entry: &GlossaryEntry) -> Result<String, RunnerError> {
        let mut parts = vec![
            "<entry_to_evaluate>".to_string(),
            xml::format_entry(entry),
            "</entry_to_evaluate>".to_string(),
        ];

        let context_posts = self
            .corpus
            .get_adjacent_posts(entry.first_seen_post_id, CONTEXT_POSTS, CONTEXT_POSTS)?;
        if !context_posts.is_empty() {
            parts.push("<first_appearance_context>".to_string());
            for post in &context_posts {
                parts.push(xml::format_post(post));
            }
            parts.push("</first_appearance_context>".to_string());
        }

        let neighbors: Vec<GlossaryEntry> = self
            .glossary
            .search(
                &entry.term,
                &SearchOptions {
                    limit: NEIGHBOR_LIMIT,
                    ..Default::default()
                },
            )?
            .into_iter()
            .filter(|e| e.id != entry.id)
            .collect();
        if neighbors.is_empty() {
            parts.push("<similar_entries>None found</similar_entries>".to_string());
        } else {
            parts.push("<similar_entries>".to_string());
            for neighbor in &neighbors {
                parts.push(xml::format_entry(neighbor));
            }
            parts.push("</similar_entries>".to_string());
        }

        parts.push("Evaluate this entry and reply with your decision as JSON.".to_string());
        Ok(parts.join("\n"))
    }

    /// Apply a decision against the main glossary. Later decisions see
    /// earlier effects; a MERGE whose target vanished degrades to
    /// CONFIRM.
    fn apply(
        &self,
        decision: &CuratorDecision,
        post_id: i64,
        thread_id: i64,
    ) -> Result<(), RunnerError> {
        self.log_decision(decision, post_id)?;

        match decision.action {
            CuratorAction::Confirm => {
                self.confirm(decision.entry_id, post_id, thread_id)?;
            }
            CuratorAction::Reject => {
                self.glossary.delete(
                    decision.entry_id,
                    &format!("curator:reject - {}", decision.reasoning),
                    post_id,
                )?;
            }
            CuratorAction::Merge => {
                let target = match decision.target_id {
                    Some(id) => self.glossary.get(id)?,
                    None => None,
                };
                let source = self.glossary.get(decision.entry_id)?;
                match (source, target) {
                    (Some(source), Some(target)) => {
                        let merged = format!(
                            "{}\n\n[Merged from {}]: {}",
                            target.definition, source.term, source.definition
                        );
                        self.glossary.update(
                            target.id,
                            &EntryPatch {
                                definition: Some(merged),
                                ..Default::default()
                            },
                            post_id,
                            thread_id,
                        )?;
                        self.glossary.delete(
                            source.id,
                            &format!("curator:merge into #{}", target.id),
                            post_id,
                        )?;
                    }
                    _ => {
                        warn!(
                            entry_id = decision.entry_id,
                            target_id = decision.target_id,
                            "merge target unavailable, confirming instead"
                        );
                        self.confirm(decision.entry_id, post_id, thread_id)?;
                    }
                }
            }
            CuratorAction::Revise => match &decision.revised_definition {
                Some(definition) => {
                    self.glossary.update(
                        decision.entry_id,
                        &EntryPatch {
                            definition: Some(definition.clone()),
                            status: Some(EntryStatus::Confirmed),
                            ..Default::default()
                        },
                        post_id,
                        thread_id,
                    )?;
                }
                None => {
                    warn!(
                        entry_id = decision.entry_id,
                        "revise without definition, confirming instead"
                    );
                    self.confirm(decision.entry_id, post_id, thread_id)?;
                }
            },
        }
        Ok(())
    }

    fn confirm(&self, entry_id: i64, post_id: i64, thread_id: i64) -> Result<(), RunnerError> {
        self.glossary.update(
            entry_id,
            &EntryPatch {
                status: Some(EntryStatus::Confirmed),
                ..Default::default()
            },
            post_id,
            thread_id,
        )?;
        Ok(())
    }

    fn log_decision(&self, decision: &CuratorDecision, post_id: i64) -> Result<(), RunnerError> {
        let payload = serde_json::json!({
            "action": decision.action.to_string(),
            "reasoning": decision.reasoning,
            "target_id": decision.target_id,
            "revised_definition": decision.revised_definition,
        });
        self.revisions.log_change(
            Some(decision.entry_id),
            RevisionField::CuratorDecision,
            None,
            &payload.to_string(),
            Some(post_id),
            None,
        )?;
        Ok(())
    }
}

/// Pull the first JSON object out of the reply; anything unusable
/// defaults to CONFIRM.
fn parse_decision(content: &str, entry: &GlossaryEntry) -> CuratorDecision {
    let default = |reasoning: &str| CuratorDecision {
        entry_id: entry.id,
        entry_term: entry.term.clone(),
        action: CuratorAction::Confirm,
        target_id: None,
        revised_definition: None,
        reasoning: reasoning.to_string(),
    };

    let pattern = Regex::new(r"(?s)\{.*?\}").expect("static regex");
    let raw = match pattern.find(content) {
        Some(m) => m.as_str(),
        None => return default("no JSON in response, defaulting to confirm"),
    };
    let payload: DecisionPayload = match serde_json::from_str(raw) {
        Ok(p) => p,
        Err(_) => return default("invalid JSON in response, defaulting to confirm"),
    };

    let action = match payload.action.as_deref().map(str::to_ascii_uppercase).as_deref() {
        Some("CONFIRM") => CuratorAction::Confirm,
        Some("REJECT") => CuratorAction::Reject,
        Some("MERGE") => CuratorAction::Merge,
        Some("REVISE") => CuratorAction::Revise,
        _ => CuratorAction::Confirm,
    };

    CuratorDecision {
        entry_id: entry.id,
        entry_term: entry.term.clone(),
        action,
        target_id: payload.target_id,
        revised_definition: payload.revised_definition,
        reasoning: payload.reasoning.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terra_llm::{MockAgent, MockResponse};
    use terra_store::Database;

    fn seed_corpus(dir: &tempfile::TempDir) -> Arc<CorpusReader> {
        let path = dir.path().join("corpus.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE thread (id INTEGER PRIMARY KEY, title TEXT);
             CREATE TABLE post (
                 thread_id INTEGER NOT NULL, id INTEGER PRIMARY KEY,
                 name TEXT, trip_code TEXT, subject TEXT,
                 time INTEGER, file_url TEXT, file_name TEXT, body TEXT
             );
             CREATE TABLE tag (post_id INTEGER NOT NULL, name TEXT NOT NULL);
             CREATE TABLE link (link_from INTEGER, link_to INTEGER);
             INSERT INTO thread (id, title) VALUES (1, 'One');
             INSERT INTO post (thread_id, id, name, time, body)
                 VALUES (1, 100, 'QM', 1500000100, 'the vatis spoke softly');",
        )
        .unwrap();
        drop(conn);
        Arc::new(CorpusReader::open(&path).unwrap())
    }

    fn setup(responses: Vec<MockResponse>) -> (tempfile::TempDir, Database, Curator) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().unwrap();
        let curator = Curator::new(
            GlossaryRepo::new(db.clone()),
            RevisionRepo::new(db.clone()),
            seed_corpus(&dir),
            Arc::new(MockAgent::new(responses)),
        );
        (dir, db, curator)
    }

    fn entry_for(db: &Database, term: &str) -> i64 {
        GlossaryRepo::new(db.clone())
            .create(term, "uncertain definition", &[], 100, 1, EntryStatus::Tentative)
            .unwrap()
    }

    #[tokio::test]
    async fn reject_deletes_and_audits() {
        let (_dir, db, curator) = setup(vec![MockResponse::text(
            r#"{"action": "REJECT", "reasoning": "one-off phrase, not a term"}"#,
        )]);
        let id = entry_for(&db, "vatis");
        let mut fork = AnnotationContext::new("annotator prompt");

        let result = curator.run(&mut fork, 1, 100).await.unwrap();
        assert_eq!(result.entries_evaluated, 1);
        assert_eq!(result.rejected, 1);

        let glossary = GlossaryRepo::new(db.clone());
        assert!(glossary.get(id).unwrap().is_none());

        // The decision survives the deletion with a nulled entry ref.
        let orphaned = RevisionRepo::new(db).history_for_deleted(20).unwrap();
        assert!(orphaned
            .iter()
            .any(|r| r.field_name == RevisionField::CuratorDecision
                && r.new_value.contains("one-off phrase")));
    }

    #[tokio::test]
    async fn confirm_promotes_status() {
        let (_dir, db, curator) = setup(vec![MockResponse::text(
            r#"{"action": "CONFIRM", "reasoning": "sound"}"#,
        )]);
        let id = entry_for(&db, "Soma");
        let mut fork = AnnotationContext::new("p");

        let result = curator.run(&mut fork, 1, 105).await.unwrap();
        assert_eq!(result.confirmed, 1);

        let entry = GlossaryRepo::new(db).get(id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Confirmed);
        assert_eq!(entry.last_updated_post_id, 105);
    }

    #[tokio::test]
    async fn merge_copies_material_then_deletes_source() {
        let (_dir, db, curator) = setup(vec![MockResponse::text(
            r#"{"action": "MERGE", "target_id": 1, "reasoning": "same being"}"#,
        )]);
        let glossary = GlossaryRepo::new(db.clone());
        let target = glossary
            .create("Soma", "Questmaster NPC", &[], 90, 1, EntryStatus::Confirmed)
            .unwrap();
        let source = entry_for(&db, "The Keeper");
        let mut fork = AnnotationContext::new("p");

        let result = curator.run(&mut fork, 1, 110).await.unwrap();
        assert_eq!(result.merged, 1);

        assert!(glossary.get(source).unwrap().is_none());
        let merged = glossary.get(target).unwrap().unwrap();
        assert!(merged.definition.contains("[Merged from The Keeper]"));
        assert!(merged.definition.contains("uncertain definition"));
    }

    #[tokio::test]
    async fn merge_with_missing_target_degrades_to_confirm() {
        let (_dir, db, curator) = setup(vec![MockResponse::text(
            r#"{"action": "MERGE", "target_id": 99, "reasoning": "dup"}"#,
        )]);
        let id = entry_for(&db, "Anut");
        let mut fork = AnnotationContext::new("p");

        let result = curator.run(&mut fork, 1, 100).await.unwrap();
        assert_eq!(result.merged, 1);
        let entry = GlossaryRepo::new(db).get(id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Confirmed);
    }

    #[tokio::test]
    async fn revise_replaces_definition() {
        let (_dir, db, curator) = setup(vec![MockResponse::text(
            r#"{"action": "REVISE", "revised_definition": "Order of seers serving Soma", "reasoning": "sharper"}"#,
        )]);
        let id = entry_for(&db, "Vatis");
        let mut fork = AnnotationContext::new("p");

        let result = curator.run(&mut fork, 1, 100).await.unwrap();
        assert_eq!(result.revised, 1);
        let entry = GlossaryRepo::new(db).get(id).unwrap().unwrap();
        assert_eq!(entry.definition, "Order of seers serving Soma");
        assert_eq!(entry.status, EntryStatus::Confirmed);
    }

    #[tokio::test]
    async fn garbage_reply_defaults_to_confirm() {
        let (_dir, db, curator) = setup(vec![MockResponse::text("I cannot decide!")]);
        let id = entry_for(&db, "Maybe");
        let mut fork = AnnotationContext::new("p");

        let result = curator.run(&mut fork, 1, 100).await.unwrap();
        assert_eq!(result.confirmed, 1);
        let entry = GlossaryRepo::new(db).get(id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Confirmed);
    }

    #[tokio::test]
    async fn agent_failure_defaults_to_confirm() {
        let (_dir, db, curator) = setup(vec![MockResponse::Error(
            terra_llm::AgentError::Timeout(60),
        )]);
        let id = entry_for(&db, "Shaky");
        let mut fork = AnnotationContext::new("p");

        let result = curator.run(&mut fork, 1, 100).await.unwrap();
        assert_eq!(result.confirmed, 1);
        assert!(result.decisions[0].reasoning.contains("evaluation failed"));
        let entry = GlossaryRepo::new(db).get(id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Confirmed);
    }

    #[tokio::test]
    async fn decisions_apply_in_receipt_order() {
        // Second decision merges into an entry the first decision already
        // confirmed; both land.
        let (_dir, db, curator) = setup(vec![
            MockResponse::text(r#"{"action": "CONFIRM", "reasoning": "keep"}"#),
            MockResponse::text(r#"{"action": "MERGE", "target_id": 1, "reasoning": "dup"}"#),
        ]);
        let glossary = GlossaryRepo::new(db.clone());
        let first = glossary
            .create("Alpha", "first", &[], 100, 1, EntryStatus::Tentative)
            .unwrap();
        let second = glossary
            .create("Beta", "second", &[], 101, 1, EntryStatus::Tentative)
            .unwrap();
        let mut fork = AnnotationContext::new("p");

        let result = curator.run(&mut fork, 1, 110).await.unwrap();
        assert_eq!(result.confirmed, 1);
        assert_eq!(result.merged, 1);

        let alpha = glossary.get(first).unwrap().unwrap();
        assert_eq!(alpha.status, EntryStatus::Confirmed);
        assert!(alpha.definition.contains("[Merged from Beta]"));
        assert!(glossary.get(second).unwrap().is_none());
    }

    #[test]
    fn decision_parsing_variants() {
        let entry = GlossaryEntry {
            id: 7,
            term: "X".into(),
            term_normalized: "x".into(),
            definition: "d".into(),
            status: EntryStatus::Tentative,
            tags: vec![],
            first_seen_post_id: 1,
            first_seen_thread_id: 1,
            last_updated_post_id: 1,
            last_updated_thread_id: 1,
            created_at: "t".into(),
            updated_at: "t".into(),
        };

        let d = parse_decision(r#"prose {"action": "reject", "reasoning": "r"} more"#, &entry);
        assert_eq!(d.action, CuratorAction::Reject);

        let d = parse_decision(r#"{"action": "ESCALATE"}"#, &entry);
        assert_eq!(d.action, CuratorAction::Confirm);

        let d = parse_decision("no json at all", &entry);
        assert_eq!(d.action, CuratorAction::Confirm);
        assert!(d.reasoning.contains("no JSON"));
    }
}

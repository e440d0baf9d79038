use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use terra_core::messages::{ChatMessage, Role};
use terra_core::summary::{ChunkSummary, ThreadSummary};
use terra_core::turn::Turn;
use terra_llm::{AgentApi, ChatRequest};
use terra_store::GlossaryRepo;

use crate::prompts::{CHUNK_SUMMARY_PROMPT, CUMULATIVE_MERGE_PROMPT, THREAD_SUMMARY_PROMPT};

/// Hybrid summary of a completed thread.
#[derive(Clone, Debug)]
pub struct SummaryResult {
    pub thread_id: i64,
    pub text: String,
    pub entries_created: Vec<i64>,
    pub entries_updated: Vec<i64>,
}

impl SummaryResult {
    pub fn into_thread_summary(self, position: i64) -> ThreadSummary {
        ThreadSummary {
            thread_id: self.thread_id,
            position,
            text: self.text,
            entries_created: self.entries_created,
            entries_updated: self.entries_updated,
        }
    }
}

/// Summarization seam. Infallible: implementations degrade to heuristic
/// text when the model is unavailable, so compaction always makes
/// progress. Tests substitute [`StubSummarizer`](crate::StubSummarizer).
#[async_trait]
pub trait Summarize: Send + Sync {
    async fn summarize_thread(&self, thread_id: i64, excerpt: &[Turn]) -> SummaryResult;

    async fn summarize_chunk(
        &self,
        thread_id: i64,
        chunk_index: i64,
        first_scene: i64,
        last_scene: i64,
        excerpt: &[Turn],
    ) -> ChunkSummary;

    /// Fold new text into "the story so far", deduplicating.
    async fn merge_cumulative(&self, cumulative: &str, addition: &str) -> String;
}

/// Summarizer backed by the agent server, with glossary lookups for the
/// entry-id lists.
pub struct LlmSummarizer {
    agent: Arc<dyn AgentApi>,
    glossary: GlossaryRepo,
    max_tokens: u32,
}

impl LlmSummarizer {
    pub fn new(agent: Arc<dyn AgentApi>, glossary: GlossaryRepo) -> Self {
        Self {
            agent,
            glossary,
            max_tokens: 512,
        }
    }

    async fn chat_text(&self, system: String, user: String) -> Option<String> {
        let request = ChatRequest::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
            .with_sampling(0.3, self.max_tokens);
        match self.agent.chat(request).await {
            Ok(response) => {
                let text = response.message.content.trim().to_string();
                (!text.is_empty()).then_some(text)
            }
            Err(e) => {
                warn!(error = %e, "summarization call failed, using heuristic");
                None
            }
        }
    }

    fn excerpt_messages(excerpt: &[Turn], keep: usize) -> String {
        excerpt
            .iter()
            .filter(|t| matches!(t.role, Role::User | Role::Assistant))
            .rev()
            .take(keep)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|t| {
                let content = if t.content.chars().count() > 500 {
                    let cut: String = t.content.chars().take(500).collect();
                    format!("{cut}...")
                } else {
                    t.content.clone()
                };
                format!("[{}] {}", t.role, content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Pull entry ids out of `entry_id="N"` attributes in tool-result turns.
pub fn entry_ids_in_excerpt(excerpt: &[Turn]) -> Vec<i64> {
    let pattern = Regex::new(r#"entry_id="(\d+)""#).expect("static regex");
    let mut ids: Vec<i64> = excerpt
        .iter()
        .filter(|t| t.role == Role::Tool)
        .flat_map(|t| {
            pattern
                .captures_iter(&t.content)
                .filter_map(|c| c[1].parse().ok())
                .collect::<Vec<i64>>()
        })
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

fn term_list(terms: &[String]) -> String {
    if terms.is_empty() {
        return "(none)".to_string();
    }
    let mut out = terms
        .iter()
        .take(10)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if terms.len() > 10 {
        out.push_str(&format!(" (+{} more)", terms.len() - 10));
    }
    out
}

#[async_trait]
impl Summarize for LlmSummarizer {
    async fn summarize_thread(&self, thread_id: i64, excerpt: &[Turn]) -> SummaryResult {
        let created = self.glossary.get_by_thread(thread_id).unwrap_or_default();
        let updated = self.glossary.get_updated_in_thread(thread_id).unwrap_or_default();
        debug!(
            thread_id,
            created = created.len(),
            updated = updated.len(),
            "summarizing thread"
        );

        let created_terms: Vec<String> = created.iter().map(|e| e.term.clone()).collect();
        let updated_terms: Vec<String> = updated.iter().map(|e| e.term.clone()).collect();

        let system = THREAD_SUMMARY_PROMPT
            .replace("{thread_id}", &thread_id.to_string())
            .replace("{entries_created}", &term_list(&created_terms))
            .replace("{entries_updated}", &term_list(&updated_terms));
        let user = format!(
            "{}\n\nSummarize this thread.",
            Self::excerpt_messages(excerpt, 6)
        );

        let text = match self.chat_text(system, user).await {
            Some(text) => text,
            None => {
                info!(thread_id, "using heuristic thread summary");
                heuristic_thread_summary(thread_id, &created_terms, &updated_terms)
            }
        };

        SummaryResult {
            thread_id,
            text,
            entries_created: created.iter().map(|e| e.id).collect(),
            entries_updated: updated.iter().map(|e| e.id).collect(),
        }
    }

    async fn summarize_chunk(
        &self,
        thread_id: i64,
        chunk_index: i64,
        first_scene: i64,
        last_scene: i64,
        excerpt: &[Turn],
    ) -> ChunkSummary {
        let system = CHUNK_SUMMARY_PROMPT
            .replace("{thread_id}", &thread_id.to_string())
            .replace("{first_scene}", &first_scene.to_string())
            .replace("{last_scene}", &last_scene.to_string());
        let user = format!(
            "{}\n\nSummarize these scenes.",
            Self::excerpt_messages(excerpt, 12)
        );

        let text = match self.chat_text(system, user).await {
            Some(text) => text,
            None => format!(
                "Scenes {first_scene}-{last_scene} of thread {thread_id} processed ({} turns).",
                excerpt.len()
            ),
        };

        ChunkSummary {
            thread_id,
            chunk_index,
            first_scene_index: first_scene,
            last_scene_index: last_scene,
            text,
            entry_ids: entry_ids_in_excerpt(excerpt),
        }
    }

    async fn merge_cumulative(&self, cumulative: &str, addition: &str) -> String {
        let system = CUMULATIVE_MERGE_PROMPT
            .replace("{cumulative}", if cumulative.is_empty() { "(none)" } else { cumulative })
            .replace("{summaries}", addition);

        match self.chat_text(system, "Merge these summaries.".to_string()).await {
            Some(text) => text,
            None => {
                if cumulative.is_empty() {
                    addition.to_string()
                } else {
                    format!("{cumulative}\n\n{addition}")
                }
            }
        }
    }
}

fn heuristic_thread_summary(thread_id: i64, created: &[String], updated: &[String]) -> String {
    let mut parts = vec![format!("Thread {thread_id} processed.")];
    if !created.is_empty() {
        parts.push(format!("Created entries: {}.", term_list(created)));
    }
    if !updated.is_empty() {
        parts.push(format!("Updated entries: {}.", term_list(updated)));
    }
    if created.is_empty() && updated.is_empty() {
        parts.push("No glossary changes.".to_string());
    }
    parts.join(" ")
}

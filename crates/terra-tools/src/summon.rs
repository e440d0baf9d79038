use terra_core::messages::{ChatMessage, Role};
use terra_core::snapshot::{Snapshot, SnapshotEntry};
use terra_core::turn::Turn;
use terra_llm::{AgentApi, AgentError, ChatRequest};

use terra_context::{AnnotationContext, MessageInputs};
use terra_store::SnapshotContext;

use crate::xml::escape;

const ENTRY_PREVIEW_LIMIT: usize = 20;
const DEFINITION_PREVIEW_CHARS: usize = 100;

/// A read-only dialogue with a historical annotation context rehydrated
/// from a snapshot. The transient history never leaks back into the live
/// context.
pub struct SummonState {
    pub snapshot_id: i64,
    context: AnnotationContext,
    snapshot_context: SnapshotContext,
    entries: Vec<SnapshotEntry>,
    transient: Vec<Turn>,
}

impl SummonState {
    pub fn new(snapshot_id: i64, snapshot_context: SnapshotContext, entries: Vec<SnapshotEntry>) -> Self {
        let context = AnnotationContext::with_history(
            snapshot_context.system_prompt.clone(),
            snapshot_context.conversation_history.clone(),
        );
        Self {
            snapshot_id,
            context,
            snapshot_context,
            entries,
            transient: Vec::new(),
        }
    }

    pub fn turn_count(&self) -> usize {
        self.transient.len()
    }

    /// Ask the historical context a question; the exchange lands only in
    /// the transient history.
    pub async fn converse(&mut self, agent: &dyn AgentApi, message: &str) -> Result<String, AgentError> {
        let inputs = MessageInputs {
            cumulative_summary: self.snapshot_context.cumulative_summary.as_deref(),
            chunk_summaries: &self.snapshot_context.chunk_summaries,
            thread_summary: self.snapshot_context.thread_summaries.last(),
            current_scene: None,
            relevant_entries: &[],
        };
        let mut messages = self.context.build_messages(&inputs);
        messages.extend(self.transient.iter().map(Turn::to_message));
        messages.push(ChatMessage::user(message));

        let response = agent
            .chat(ChatRequest::new(messages).with_sampling(0.4, 512))
            .await?;
        let answer = response.message.content.clone();

        self.transient.push(Turn::new(Role::User, message));
        self.transient.push(Turn::new(Role::Assistant, answer.clone()));
        Ok(answer)
    }

    /// `<summon_active>` body: snapshot metadata plus a preview of the
    /// captured entry states.
    pub fn format_activation(&self, snapshot: &Snapshot, response: Option<&str>) -> String {
        let mut lines = vec![
            format!("<summon_active snapshot_id=\"{}\">", self.snapshot_id),
            format!(
                "  <snapshot type=\"{}\" thread=\"{}\" post=\"{}\" created=\"{}\"/>",
                snapshot.snapshot_type,
                snapshot.last_thread_id,
                snapshot.last_post_id,
                escape(&snapshot.created_at),
            ),
            format!("  <entries count=\"{}\">", self.entries.len()),
        ];

        for entry in self.entries.iter().take(ENTRY_PREVIEW_LIMIT) {
            let mut definition = entry.definition_at_snapshot.clone();
            if definition.chars().count() > DEFINITION_PREVIEW_CHARS {
                definition = definition.chars().take(DEFINITION_PREVIEW_CHARS).collect();
                definition.push_str("...");
            }
            lines.push(format!(
                "    <entry id=\"{}\" status=\"{}\">{}</entry>",
                entry.entry_id,
                escape(&entry.status_at_snapshot),
                escape(&definition),
            ));
        }
        if self.entries.len() > ENTRY_PREVIEW_LIMIT {
            lines.push(format!(
                "    <note>...and {} more entries</note>",
                self.entries.len() - ENTRY_PREVIEW_LIMIT
            ));
        }
        lines.push("  </entries>".to_string());

        if let Some(text) = response {
            lines.push(format!("  <summon_response>{}</summon_response>", escape(text)));
        }

        lines.push(
            "  <instructions>This is a read-only view. Use summon_continue for follow-up questions and summon_dismiss when done.</instructions>"
                .to_string(),
        );
        lines.push("</summon_active>".to_string());
        lines.join("\n")
    }
}

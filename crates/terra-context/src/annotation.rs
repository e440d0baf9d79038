use terra_core::corpus::Scene;
use terra_core::entry::GlossaryEntry;
use terra_core::messages::{ChatMessage, Role};
use terra_core::summary::{ChunkSummary, ThreadSummary};
use terra_core::turn::Turn;

/// Inputs assembled into a chat request alongside the recorded history.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessageInputs<'a> {
    pub cumulative_summary: Option<&'a str>,
    pub chunk_summaries: &'a [ChunkSummary],
    pub thread_summary: Option<&'a ThreadSummary>,
    pub current_scene: Option<&'a Scene>,
    pub relevant_entries: &'a [GlossaryEntry],
}

/// The durable conversation object: system prompt plus the tagged turn
/// history. Summaries live in the compaction state and are passed in at
/// build time.
#[derive(Clone, Debug, Default)]
pub struct AnnotationContext {
    pub system_prompt: String,
    history: Vec<Turn>,
}

impl AnnotationContext {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            history: Vec::new(),
        }
    }

    pub fn with_history(system_prompt: impl Into<String>, history: Vec<Turn>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            history,
        }
    }

    /// Assemble the ordered message list:
    /// 1. system prompt,
    /// 2. a user message wrapping the summaries in sentinel tags,
    /// 3. the recorded history,
    /// 4. a user message with the current scene and candidate entries.
    pub fn build_messages(&self, inputs: &MessageInputs<'_>) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.system_prompt.clone())];

        if let Some(header) = format_summary_header(inputs) {
            messages.push(ChatMessage::user(header));
        }

        messages.extend(self.history.iter().map(Turn::to_message));

        if let Some(scene) = inputs.current_scene {
            messages.push(ChatMessage::user(format_scene_payload(
                scene,
                inputs.relevant_entries,
            )));
        }

        messages
    }

    pub fn record_turn(&mut self, turn: Turn) {
        self.history.push(turn);
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut Vec<Turn> {
        &mut self.history
    }

    pub fn take_history(self) -> Vec<Turn> {
        self.history
    }

    /// Drop every turn tagged with this thread. Returns the count removed.
    pub fn remove_thread_turns(&mut self, thread_id: i64) -> usize {
        let before = self.history.len();
        self.history.retain(|t| t.thread_id != Some(thread_id));
        before - self.history.len()
    }

    /// Drop turns of one thread within a scene range. Turns without a
    /// scene index are preserved.
    pub fn remove_chunk_turns(&mut self, thread_id: i64, first_scene: i64, last_scene: i64) -> usize {
        let before = self.history.len();
        self.history.retain(|t| {
            if t.thread_id != Some(thread_id) {
                return true;
            }
            match t.scene_index {
                Some(idx) => !(first_scene <= idx && idx <= last_scene),
                None => true,
            }
        });
        before - self.history.len()
    }
}

fn format_summary_header(inputs: &MessageInputs<'_>) -> Option<String> {
    let has_cumulative = inputs.cumulative_summary.is_some_and(|s| !s.is_empty());
    if !has_cumulative && inputs.chunk_summaries.is_empty() && inputs.thread_summary.is_none() {
        return None;
    }

    let mut lines = Vec::new();
    if let Some(cumulative) = inputs.cumulative_summary {
        if !cumulative.is_empty() {
            lines.push(format!("<cumulative_summary>{cumulative}</cumulative_summary>"));
        }
    }

    if !inputs.chunk_summaries.is_empty() {
        lines.push("<chunk_summaries>".to_string());
        for cs in inputs.chunk_summaries {
            let entries_attr = if cs.entry_ids.is_empty() {
                String::new()
            } else {
                format!(" entries=\"{}\"", join_ids(&cs.entry_ids))
            };
            lines.push(format!(
                "<chunk thread=\"{}\" index=\"{}\" scenes=\"{}-{}\"{}>{}</chunk>",
                cs.thread_id, cs.chunk_index, cs.first_scene_index, cs.last_scene_index,
                entries_attr, cs.text,
            ));
        }
        lines.push("</chunk_summaries>".to_string());
    }

    if let Some(ts) = inputs.thread_summary {
        let mut ids = ts.entries_created.clone();
        ids.extend(&ts.entries_updated);
        let entries_attr = if ids.is_empty() {
            String::new()
        } else {
            format!(" entries=\"{}\"", join_ids(&ids))
        };
        lines.push(format!(
            "<thread_summary thread=\"{}\" position=\"{}\"{}>{}</thread_summary>",
            ts.thread_id, ts.position, entries_attr, ts.text,
        ));
    }

    Some(lines.join("\n"))
}

fn format_scene_payload(scene: &Scene, entries: &[GlossaryEntry]) -> String {
    let mut lines = vec!["<story_passages>".to_string()];
    for post in &scene.posts {
        let mut attrs = vec![format!("id=\"{}\"", post.post_id)];
        if let Some(ts) = &post.created_at {
            attrs.push(format!("ts=\"{ts}\""));
        }
        if let Some(author) = &post.author {
            attrs.push(format!("author=\"{author}\""));
        }
        lines.push(format!("<post {}>{}</post>", attrs.join(" "), post.body.trim()));
    }
    lines.push("</story_passages>".to_string());

    if !entries.is_empty() {
        lines.push("<known_glossary>".to_string());
        for entry in entries {
            let tags_attr = if entry.tags.is_empty() {
                String::new()
            } else {
                format!(" tags=\"{}\"", entry.tags.join(","))
            };
            lines.push(format!(
                "<term id=\"{}\" name=\"{}\"{}>{}</term>",
                entry.id, entry.term, tags_attr, entry.definition,
            ));
        }
        lines.push("</known_glossary>".to_string());
    }

    lines.push(
        "<instructions>Annotate this scene: search the glossary, then create or update entries via tools.</instructions>"
            .to_string(),
    );
    lines.join("\n")
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",")
}

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use terra_core::messages::{ChatMessage, Role};
use terra_core::summary::{ChunkSummary, ThreadSummary};
use terra_core::turn::Turn;

use crate::annotation::{AnnotationContext, MessageInputs};
use crate::metrics::CompactionStats;
use crate::summarizer::Summarize;
use crate::tokens::TokenCounter;

const MAX_ITERATIONS: usize = 20;
const THINKING_PRESERVE_RECENT: usize = 4;
const TRUNCATE_MAX_AGE: usize = 8;
const TRUNCATE_MAX_LEN: usize = 500;
const TRUNCATION_MARKER: &str = "... [truncated]";

/// Thresholds over the context budget.
#[derive(Clone, Debug)]
pub struct CompactionConfig {
    pub context_budget: usize,
    pub soft_ratio: f64,
    pub thread_compact_ratio: f64,
    pub emergency_ratio: f64,
    pub target_ratio: f64,
    pub scenes_per_chunk: i64,
    pub preserve_recent_chunks: i64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_budget: 98_304,
            soft_ratio: 0.60,
            thread_compact_ratio: 0.80,
            emergency_ratio: 0.85,
            target_ratio: 0.70,
            scenes_per_chunk: 7,
            preserve_recent_chunks: 2,
        }
    }
}

impl CompactionConfig {
    pub fn with_budget(context_budget: usize) -> Self {
        Self {
            context_budget,
            ..Default::default()
        }
    }

    pub fn soft_threshold(&self) -> usize {
        (self.context_budget as f64 * self.soft_ratio) as usize
    }

    pub fn thread_compact_threshold(&self) -> usize {
        (self.context_budget as f64 * self.thread_compact_ratio) as usize
    }

    pub fn emergency_threshold(&self) -> usize {
        (self.context_budget as f64 * self.emergency_ratio) as usize
    }

    pub fn target(&self) -> usize {
        (self.context_budget as f64 * self.target_ratio) as usize
    }
}

/// Compaction bookkeeping carried across scenes and snapshots.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactionState {
    pub cumulative_summary: String,
    pub chunk_summaries: Vec<ChunkSummary>,
    /// Pending thread summaries awaiting their merge; at most one under
    /// normal operation.
    pub thread_summaries: Vec<ThreadSummary>,
    /// Threads whose turns are still in history, oldest first.
    pub completed_thread_ids: Vec<i64>,
    pub current_thread_id: Option<i64>,
    /// Scenes completed in the current thread.
    pub current_scene_index: i64,
    pub summarized_chunk_indices: Vec<i64>,
    /// Threads whose summaries already folded into the cumulative.
    pub merged_thread_ids: Vec<i64>,
}

impl CompactionState {
    /// Begin tracking a new thread; chunk bookkeeping is per-thread.
    pub fn start_new_thread(&mut self, thread_id: i64) {
        self.current_thread_id = Some(thread_id);
        self.current_scene_index = 0;
        self.chunk_summaries.clear();
        self.summarized_chunk_indices.clear();
    }

    pub fn advance_scene(&mut self) {
        self.current_scene_index += 1;
    }

    pub fn complete_thread(&mut self, thread_id: i64) {
        self.completed_thread_ids.push(thread_id);
    }

    pub fn completed_chunk_count(&self, scenes_per_chunk: i64) -> i64 {
        self.current_scene_index / scenes_per_chunk.max(1)
    }

    /// (chunk_index, first_scene, last_scene) for full chunks not yet
    /// summarized, oldest first.
    pub fn unsummarized_chunks(&self, scenes_per_chunk: i64) -> Vec<(i64, i64, i64)> {
        let spc = scenes_per_chunk.max(1);
        (0..self.completed_chunk_count(spc))
            .filter(|i| !self.summarized_chunk_indices.contains(i))
            .map(|i| (i, i * spc, i * spc + spc - 1))
            .collect()
    }
}

/// What a compaction pass did.
#[derive(Debug)]
pub struct CompactionResult {
    pub messages: Vec<ChatMessage>,
    pub initial_tokens: usize,
    pub final_tokens: usize,
    pub chunks_summarized: usize,
    pub threads_summarized: usize,
    pub thinking_trimmed: bool,
    pub responses_truncated: bool,
    pub target_reached: bool,
    /// True when only the no-progress guard ended the pass.
    pub could_not_compact: bool,
}

/// Tiered rolling compactor.
///
/// Context layout it maintains: cumulative summary ("the story so far"),
/// chunk summaries for the current thread, then the live conversation.
/// Tier 0.5 folds old chunks of the current thread into chunk summaries;
/// tier 1 folds whole completed threads into the cumulative summary;
/// tiers 3 and 4 (emergency only) strip thinking blocks and truncate old
/// responses. Every mutation lands on the backing context, so subsequent
/// scenes see compacted state.
pub struct Compactor {
    counter: Arc<TokenCounter>,
    summarizer: Arc<dyn Summarize>,
    config: CompactionConfig,
    stats: CompactionStats,
}

impl Compactor {
    pub fn new(
        counter: Arc<TokenCounter>,
        summarizer: Arc<dyn Summarize>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            counter,
            summarizer,
            config,
            stats: CompactionStats::default(),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn stats(&self) -> &CompactionStats {
        &self.stats
    }

    /// Messages and token count for the current (state, context) pair.
    pub fn measure(
        &self,
        state: &CompactionState,
        context: &AnnotationContext,
    ) -> (Vec<ChatMessage>, usize) {
        let inputs = MessageInputs {
            cumulative_summary: Some(state.cumulative_summary.as_str()),
            chunk_summaries: &state.chunk_summaries,
            thread_summary: state.thread_summaries.last(),
            current_scene: None,
            relevant_entries: &[],
        };
        let messages = context.build_messages(&inputs);
        let tokens = self.counter.count_messages(&messages);
        (messages, tokens)
    }

    /// Run the tiered loop until under target, or until no tier makes
    /// progress.
    #[instrument(skip(self, state, context))]
    pub async fn compact(
        &mut self,
        state: &mut CompactionState,
        context: &mut AnnotationContext,
    ) -> CompactionResult {
        let (messages, initial_tokens) = self.measure(state, context);
        let usage_pct = if self.config.context_budget > 0 {
            initial_tokens as f64 / self.config.context_budget as f64 * 100.0
        } else {
            0.0
        };
        self.stats.record_usage(usage_pct);

        let mut result = CompactionResult {
            messages,
            initial_tokens,
            final_tokens: initial_tokens,
            chunks_summarized: 0,
            threads_summarized: 0,
            thinking_trimmed: false,
            responses_truncated: false,
            target_reached: false,
            could_not_compact: false,
        };

        if initial_tokens < self.config.soft_threshold() {
            debug!(tokens = initial_tokens, usage_pct, "under soft threshold, skipping compaction");
            result.target_reached = true;
            return result;
        }

        let is_emergency = initial_tokens > self.config.emergency_threshold();
        if is_emergency {
            warn!(
                tokens = initial_tokens,
                threshold = self.config.emergency_threshold(),
                "emergency compaction triggered"
            );
        }

        let target = self.config.target();
        let soft = self.config.soft_threshold();
        let mut current = initial_tokens;
        let mut prev = current + 1;

        for _ in 0..MAX_ITERATIONS {
            if current <= target {
                result.target_reached = true;
                break;
            }
            if current >= prev {
                warn!(tokens = current, "compaction stalled, breaking");
                break;
            }
            prev = current;

            // Tier 0.5: intra-thread chunk compaction, relaxing the
            // preserve count 2 -> 1 -> 0.
            if self.compact_one_chunk(state, context).await {
                result.chunks_summarized += 1;
                self.stats.chunk_compactions += 1;
                current = self.measure(state, context).1;
                if current < soft {
                    result.target_reached = true;
                    break;
                }
                continue;
            }

            // Tier 0.5b: partial-chunk fallback under a negative index.
            if self.compact_partial_chunk(state, context).await {
                result.chunks_summarized += 1;
                self.stats.chunk_compactions += 1;
                current = self.measure(state, context).1;
                if current < soft {
                    result.target_reached = true;
                    break;
                }
                continue;
            }

            // Tier 1: fold the oldest completed thread into the
            // cumulative summary. The newest completed thread keeps its
            // turns for continuity.
            if self.compact_one_thread(state, context).await {
                result.threads_summarized += 1;
                self.stats.thread_compactions += 1;
                current = self.measure(state, context).1;
                if current < soft {
                    result.target_reached = true;
                    break;
                }
                continue;
            }

            if !is_emergency {
                break;
            }

            // Tier 3: strip thinking blocks from older turns.
            let trimmed = trim_thinking(context, THINKING_PRESERVE_RECENT);
            if trimmed > 0 {
                info!(trimmed, "trimmed thinking blocks");
                result.thinking_trimmed = true;
                self.stats.thinking_trims += trimmed as u64;
                current = self.measure(state, context).1;
                continue;
            }

            // Tier 4: truncate old assistant responses.
            let truncated = truncate_responses(context, TRUNCATE_MAX_AGE, TRUNCATE_MAX_LEN);
            if truncated > 0 {
                info!(truncated, "truncated old responses");
                result.responses_truncated = true;
                self.stats.response_truncations += truncated as u64;
                current = self.measure(state, context).1;
                continue;
            }

            warn!(tokens = current, target, "compaction options exhausted");
            break;
        }

        let (messages, final_tokens) = self.measure(state, context);
        result.messages = messages;
        result.final_tokens = final_tokens;
        result.target_reached = final_tokens <= target;
        result.could_not_compact = !result.target_reached;

        if result.chunks_summarized > 0
            || result.threads_summarized > 0
            || result.thinking_trimmed
            || result.responses_truncated
        {
            self.stats.record_compaction(initial_tokens, final_tokens);
        }

        info!(
            initial = initial_tokens,
            compacted = final_tokens,
            chunks = result.chunks_summarized,
            threads = result.threads_summarized,
            target_reached = result.target_reached,
            "compaction pass complete"
        );
        result
    }

    async fn compact_one_chunk(
        &self,
        state: &mut CompactionState,
        context: &mut AnnotationContext,
    ) -> bool {
        let thread_id = match state.current_thread_id {
            Some(id) => id,
            None => return false,
        };

        // Negative (partial-chunk) entries never consumed a full chunk,
        // so they do not count against the preserve budget.
        let full_chunks_summarized = state
            .summarized_chunk_indices
            .iter()
            .filter(|i| **i >= 0)
            .count() as i64;

        for preserve in (0..=self.config.preserve_recent_chunks).rev() {
            let completed = state.completed_chunk_count(self.config.scenes_per_chunk);
            let unsummarized = state.unsummarized_chunks(self.config.scenes_per_chunk);
            let summarizable = completed - preserve - full_chunks_summarized;
            if summarizable <= 0 || unsummarized.is_empty() {
                continue;
            }

            let (chunk_index, first_scene, last_scene) = unsummarized[0];
            info!(
                thread_id,
                chunk_index, first_scene, last_scene, preserve, "summarizing chunk"
            );

            let excerpt = chunk_turns(context, thread_id, first_scene, last_scene);
            let summary = self
                .summarizer
                .summarize_chunk(thread_id, chunk_index, first_scene, last_scene, &excerpt)
                .await;
            state.chunk_summaries.push(summary);
            state.summarized_chunk_indices.push(chunk_index);

            let removed = context.remove_chunk_turns(thread_id, first_scene, last_scene);
            debug!(removed, chunk_index, "removed chunk turns");
            return true;
        }
        false
    }

    /// When no full chunk exists but at least 6 scenes are in progress,
    /// summarize the first half under the next negative index.
    async fn compact_partial_chunk(
        &self,
        state: &mut CompactionState,
        context: &mut AnnotationContext,
    ) -> bool {
        let thread_id = match state.current_thread_id {
            Some(id) => id,
            None => return false,
        };
        if state.current_scene_index < 6 {
            return false;
        }
        let half = state.current_scene_index / 2;
        if half < 3 {
            return false;
        }
        let last_scene = half - 1;

        let excerpt = chunk_turns(context, thread_id, 0, last_scene);
        if excerpt.is_empty() {
            return false;
        }

        let partials = state.summarized_chunk_indices.iter().filter(|i| **i < 0).count();
        let chunk_index = -1 - partials as i64;
        info!(thread_id, chunk_index, last_scene, "summarizing partial chunk");

        let summary = self
            .summarizer
            .summarize_chunk(thread_id, chunk_index, 0, last_scene, &excerpt)
            .await;
        state.chunk_summaries.push(summary);
        state.summarized_chunk_indices.push(chunk_index);
        context.remove_chunk_turns(thread_id, 0, last_scene);
        true
    }

    async fn compact_one_thread(
        &self,
        state: &mut CompactionState,
        context: &mut AnnotationContext,
    ) -> bool {
        if state.completed_thread_ids.len() <= 1 {
            return false;
        }
        let oldest = state.completed_thread_ids.remove(0);
        info!(
            thread_id = oldest,
            remaining = state.completed_thread_ids.len(),
            "folding thread into cumulative summary"
        );

        let pending = state
            .thread_summaries
            .iter()
            .position(|t| t.thread_id == oldest)
            .map(|i| state.thread_summaries.remove(i));

        // A thread already folded in at its boundary only needs its turns
        // dropped; merging again would duplicate the story.
        let summary = match pending {
            Some(summary) => Some(summary),
            None if state.merged_thread_ids.contains(&oldest) => None,
            None => {
                let excerpt: Vec<Turn> = context
                    .history()
                    .iter()
                    .filter(|t| t.thread_id == Some(oldest))
                    .cloned()
                    .collect();
                let position = state.merged_thread_ids.len() as i64;
                Some(
                    self.summarizer
                        .summarize_thread(oldest, &excerpt)
                        .await
                        .into_thread_summary(position),
                )
            }
        };

        if let Some(summary) = summary {
            let addition = format!("Thread {}: {}", summary.thread_id, summary.text);
            state.cumulative_summary = self
                .summarizer
                .merge_cumulative(&state.cumulative_summary, &addition)
                .await;
            if !state.merged_thread_ids.contains(&oldest) {
                state.merged_thread_ids.push(oldest);
            }
        }

        let removed = context.remove_thread_turns(oldest);
        debug!(removed, thread_id = oldest, "removed thread turns");
        true
    }
}

fn chunk_turns(
    context: &AnnotationContext,
    thread_id: i64,
    first_scene: i64,
    last_scene: i64,
) -> Vec<Turn> {
    context
        .history()
        .iter()
        .filter(|t| {
            t.thread_id == Some(thread_id)
                && t.scene_index
                    .is_some_and(|idx| first_scene <= idx && idx <= last_scene)
        })
        .cloned()
        .collect()
}

/// Strip `<thinking>` blocks from assistant turns older than the most
/// recent `preserve_recent`. Returns the number of turns changed.
fn trim_thinking(context: &mut AnnotationContext, preserve_recent: usize) -> usize {
    let pattern = Regex::new(r"(?is)<thinking>.*?</thinking>").expect("static regex");
    let history = context.history_mut();
    let cutoff = history.len().saturating_sub(preserve_recent);
    let mut trimmed = 0;

    for turn in &mut history[..cutoff] {
        if turn.role != Role::Assistant || !turn.content.to_lowercase().contains("<thinking>") {
            continue;
        }
        let replaced = pattern.replace_all(&turn.content, "").trim().to_string();
        if replaced != turn.content {
            turn.content = replaced;
            trimmed += 1;
        }
    }
    trimmed
}

/// Truncate assistant turns older than `max_age` to `max_len` characters.
/// Already-truncated turns are left alone.
fn truncate_responses(context: &mut AnnotationContext, max_age: usize, max_len: usize) -> usize {
    let history = context.history_mut();
    let cutoff = history.len().saturating_sub(max_age);
    let mut truncated = 0;

    for turn in &mut history[..cutoff] {
        if turn.role != Role::Assistant
            || turn.content.ends_with(TRUNCATION_MARKER)
            || turn.content.chars().count() <= max_len
        {
            continue;
        }
        let cut: String = turn.content.chars().take(max_len).collect();
        turn.content = format!("{cut}{TRUNCATION_MARKER}");
        truncated += 1;
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubSummarizer;

    fn compactor(budget: usize) -> Compactor {
        Compactor::new(
            Arc::new(TokenCounter::heuristic()),
            Arc::new(StubSummarizer),
            CompactionConfig::with_budget(budget),
        )
    }

    fn filler(chars: usize) -> String {
        "the party pressed on through the terrarium halls "
            .chars()
            .cycle()
            .take(chars)
            .collect()
    }

    /// Two completed threads plus a current thread with one finished
    /// chunk, sized to ~1040 heuristic tokens.
    fn seeded() -> (CompactionState, AnnotationContext) {
        let mut context = AnnotationContext::new("p");
        let mut state = CompactionState::default();

        for thread in [1i64, 2] {
            for scene in 0..6 {
                context.record_turn(Turn::new(Role::User, filler(88)).tagged(thread, scene));
                context.record_turn(Turn::new(Role::Assistant, filler(88)).tagged(thread, scene));
            }
            state.complete_thread(thread);
        }
        state.start_new_thread(3);
        for scene in 0..8 {
            context.record_turn(Turn::new(Role::User, filler(88)).tagged(3, scene));
            context.record_turn(Turn::new(Role::Assistant, filler(88)).tagged(3, scene));
            state.advance_scene();
        }
        (state, context)
    }

    #[tokio::test]
    async fn under_soft_threshold_is_a_noop() {
        let mut compactor = compactor(100_000);
        let (mut state, mut context) = seeded();
        let history_before = context.history().len();

        let result = compactor.compact(&mut state, &mut context).await;
        assert!(result.target_reached);
        assert_eq!(result.chunks_summarized, 0);
        assert_eq!(result.threads_summarized, 0);
        assert_eq!(result.initial_tokens, result.final_tokens);
        assert_eq!(context.history().len(), history_before);
    }

    #[tokio::test]
    async fn compaction_under_budget_summarizes_chunk_then_thread() {
        let mut compactor = compactor(1000);
        let (mut state, mut context) = seeded();

        let (messages_before, tokens_before) = compactor.measure(&state, &context);
        assert!(tokens_before > 900, "seed should be near budget, got {tokens_before}");

        let result = compactor.compact(&mut state, &mut context).await;

        assert!(result.final_tokens < 700, "got {}", result.final_tokens);
        assert!(result.target_reached);
        assert!(result.final_tokens <= result.initial_tokens);
        assert_eq!(result.chunks_summarized, 1);
        assert_eq!(result.threads_summarized, 1);
        assert!(result.messages.len() < messages_before.len());

        // Chunk bookkeeping grew by one regular chunk.
        assert_eq!(state.chunk_summaries.len(), 1);
        assert_eq!(state.chunk_summaries[0].chunk_index, 0);
        assert_eq!(state.summarized_chunk_indices, vec![0]);

        // The oldest thread merged into the cumulative summary.
        assert!(state.cumulative_summary.contains("Thread 1"));
        assert_eq!(state.completed_thread_ids, vec![2]);

        // Remaining turn tags are consistent: no thread-1 turns, no
        // chunk-0 turns of the current thread.
        for turn in context.history() {
            assert_ne!(turn.thread_id, Some(1));
            if turn.thread_id == Some(3) {
                assert!(turn.scene_index.unwrap() > 6);
            }
        }
    }

    #[tokio::test]
    async fn preserve_count_relaxes_when_pressure_stays() {
        // Current thread has three finished chunks and nothing else to
        // give; the compactor should keep summarizing chunks, relaxing
        // the preserve count, until the target is met or chunks run out.
        let mut compactor = compactor(900);
        let mut context = AnnotationContext::new("p");
        let mut state = CompactionState::default();
        state.start_new_thread(1);
        for scene in 0..21 {
            context.record_turn(Turn::new(Role::User, filler(88)).tagged(1, scene));
            context.record_turn(Turn::new(Role::Assistant, filler(88)).tagged(1, scene));
            state.advance_scene();
        }

        let result = compactor.compact(&mut state, &mut context).await;
        assert!(result.chunks_summarized >= 2, "got {}", result.chunks_summarized);
        assert!(result.final_tokens < result.initial_tokens);
        let indices: Vec<i64> = state.chunk_summaries.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, (0..result.chunks_summarized as i64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn partial_chunk_fallback_uses_negative_index() {
        let mut compactor = compactor(500);
        let mut context = AnnotationContext::new("p");
        let mut state = CompactionState::default();
        state.start_new_thread(1);
        for scene in 0..6 {
            context.record_turn(Turn::new(Role::User, filler(120)).tagged(1, scene));
            context.record_turn(Turn::new(Role::Assistant, filler(120)).tagged(1, scene));
            state.advance_scene();
        }

        let result = compactor.compact(&mut state, &mut context).await;
        assert_eq!(result.chunks_summarized, 1);
        assert_eq!(state.chunk_summaries[0].chunk_index, -1);
        assert_eq!(state.chunk_summaries[0].first_scene_index, 0);
        assert_eq!(state.chunk_summaries[0].last_scene_index, 2);
        assert_eq!(state.summarized_chunk_indices, vec![-1]);
        for turn in context.history() {
            assert!(turn.scene_index.unwrap() >= 3);
        }
    }

    #[tokio::test]
    async fn pending_thread_summary_is_merged_not_recomputed() {
        let mut compactor = compactor(700);
        let mut context = AnnotationContext::new("p");
        let mut state = CompactionState::default();
        for thread in [1i64, 2] {
            for scene in 0..5 {
                context.record_turn(Turn::new(Role::User, filler(200)).tagged(thread, scene));
            }
            state.complete_thread(thread);
        }
        state.thread_summaries.push(ThreadSummary {
            thread_id: 1,
            position: 0,
            text: "pending summary of thread one".into(),
            entries_created: vec![],
            entries_updated: vec![],
        });

        let result = compactor.compact(&mut state, &mut context).await;
        assert!(result.threads_summarized >= 1);
        assert!(state.cumulative_summary.contains("pending summary of thread one"));
        assert!(state.thread_summaries.is_empty());
    }

    #[tokio::test]
    async fn full_chunk_compacts_after_partial_fallback() {
        let mut compactor = compactor(500);
        let mut context = AnnotationContext::new("p");
        let mut state = CompactionState::default();
        state.start_new_thread(1);
        for scene in 0..6 {
            context.record_turn(Turn::new(Role::User, filler(120)).tagged(1, scene));
            context.record_turn(Turn::new(Role::Assistant, filler(120)).tagged(1, scene));
            state.advance_scene();
        }

        // No full chunk yet: the first pass folds scenes 0-2 into a
        // partial under index -1.
        let first = compactor.compact(&mut state, &mut context).await;
        assert_eq!(first.chunks_summarized, 1);
        assert_eq!(state.summarized_chunk_indices, vec![-1]);

        // The thread grows past a full chunk; the partial entry must not
        // count against the preserve budget and block chunk 0.
        for scene in 6..8 {
            context.record_turn(Turn::new(Role::User, filler(120)).tagged(1, scene));
            context.record_turn(Turn::new(Role::Assistant, filler(120)).tagged(1, scene));
            state.advance_scene();
        }
        let second = compactor.compact(&mut state, &mut context).await;
        assert_eq!(second.chunks_summarized, 1);
        assert_eq!(state.summarized_chunk_indices, vec![-1, 0]);

        let chunk = state
            .chunk_summaries
            .iter()
            .find(|c| c.chunk_index == 0)
            .expect("full chunk summarized");
        assert_eq!(chunk.first_scene_index, 0);
        assert_eq!(chunk.last_scene_index, 6);
        for turn in context.history() {
            assert!(turn.scene_index.unwrap() > 6);
        }
    }

    #[tokio::test]
    async fn already_merged_thread_only_drops_turns() {
        let mut compactor = compactor(700);
        let mut context = AnnotationContext::new("p");
        let mut state = CompactionState::default();
        for thread in [1i64, 2] {
            for scene in 0..5 {
                context.record_turn(Turn::new(Role::User, filler(200)).tagged(thread, scene));
            }
            state.complete_thread(thread);
        }
        state.cumulative_summary = "[merged] Thread 1: already folded".into();
        state.merged_thread_ids.push(1);

        let result = compactor.compact(&mut state, &mut context).await;
        assert!(result.threads_summarized >= 1);
        assert_eq!(state.cumulative_summary, "[merged] Thread 1: already folded");
        assert!(context.history().iter().all(|t| t.thread_id != Some(1)));
    }

    #[tokio::test]
    async fn guard_fires_when_nothing_can_compact() {
        let mut compactor = compactor(200);
        let mut context = AnnotationContext::new("p");
        let mut state = CompactionState::default();
        state.start_new_thread(1);
        // Two scenes only: no full chunk, no partial fallback, no
        // completed threads. Over soft, nothing to do.
        for scene in 0..2 {
            context.record_turn(Turn::new(Role::User, filler(300)).tagged(1, scene));
            state.advance_scene();
        }

        let result = compactor.compact(&mut state, &mut context).await;
        assert!(!result.target_reached);
        assert!(result.could_not_compact);
        assert_eq!(result.final_tokens, result.initial_tokens);
    }

    #[tokio::test]
    async fn emergency_trims_thinking_then_truncates() {
        let mut compactor = compactor(300);
        let mut context = AnnotationContext::new("p");
        let mut state = CompactionState::default();
        state.start_new_thread(1);

        // Old assistant turns with thinking blocks and long bodies; the
        // single in-progress scene rules out chunk and thread tiers.
        for _ in 0..6 {
            context.record_turn(
                Turn::new(
                    Role::Assistant,
                    format!("<thinking>{}</thinking>{}", filler(120), filler(700)),
                )
                .tagged(1, 0),
            );
        }
        for _ in 0..4 {
            context.record_turn(Turn::new(Role::User, "recent").tagged(1, 0));
        }
        state.advance_scene();

        let result = compactor.compact(&mut state, &mut context).await;
        assert!(result.thinking_trimmed);
        assert!(result.responses_truncated);
        assert!(result.final_tokens < result.initial_tokens);

        let truncated: Vec<String> = context
            .history()
            .iter()
            .filter(|t| t.content.ends_with(TRUNCATION_MARKER))
            .map(|t| t.content.clone())
            .collect();
        assert!(!truncated.is_empty());
        for content in &truncated {
            assert!(!content.contains("<thinking>"));
            assert!(content.chars().count() <= TRUNCATE_MAX_LEN + TRUNCATION_MARKER.len());
        }

        // A second pass never re-truncates marked turns.
        let marked_before = truncated.len();
        let result2 = compactor.compact(&mut state, &mut context).await;
        assert!(result2.final_tokens <= result2.initial_tokens);
        let marked_after = context
            .history()
            .iter()
            .filter(|t| t.content.ends_with(TRUNCATION_MARKER))
            .count();
        assert_eq!(marked_before, marked_after);
    }

    #[test]
    fn trim_thinking_preserves_recent_turns() {
        let mut context = AnnotationContext::new("p");
        for i in 0..6 {
            context.record_turn(Turn::new(
                Role::Assistant,
                format!("<thinking>hidden {i}</thinking>visible {i}"),
            ));
        }
        let trimmed = trim_thinking(&mut context, 4);
        assert_eq!(trimmed, 2);
        assert_eq!(context.history()[0].content, "visible 0");
        assert!(context.history()[5].content.contains("<thinking>"));
    }

    #[test]
    fn truncate_skips_short_and_marked() {
        let mut context = AnnotationContext::new("p");
        context.record_turn(Turn::new(Role::Assistant, "short"));
        context.record_turn(Turn::new(Role::Assistant, format!("{}... [truncated]", "x".repeat(600))));
        context.record_turn(Turn::new(Role::Assistant, "y".repeat(600)));
        for _ in 0..2 {
            context.record_turn(Turn::new(Role::User, "pad"));
        }
        let truncated = truncate_responses(&mut context, 2, 500);
        assert_eq!(truncated, 1);
    }

    #[test]
    fn unsummarized_chunks_skips_summarized() {
        let mut state = CompactionState::default();
        state.start_new_thread(1);
        state.current_scene_index = 15; // two full chunks of 7
        state.summarized_chunk_indices.push(0);
        assert_eq!(state.unsummarized_chunks(7), vec![(1, 7, 13)]);
    }

    #[test]
    fn thresholds_derived_from_budget() {
        let config = CompactionConfig::with_budget(1000);
        assert_eq!(config.soft_threshold(), 600);
        assert_eq!(config.thread_compact_threshold(), 800);
        assert_eq!(config.emergency_threshold(), 850);
        assert_eq!(config.target(), 700);
    }
}

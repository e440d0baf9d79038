use async_trait::async_trait;

use terra_core::summary::ChunkSummary;
use terra_core::turn::Turn;

use crate::summarizer::{entry_ids_in_excerpt, Summarize, SummaryResult};

/// Deterministic summarizer for compactor tests: fixed-shape text, no
/// model calls, so assertions can be structural.
#[derive(Clone, Copy, Debug, Default)]
pub struct StubSummarizer;

#[async_trait]
impl Summarize for StubSummarizer {
    async fn summarize_thread(&self, thread_id: i64, excerpt: &[Turn]) -> SummaryResult {
        SummaryResult {
            thread_id,
            text: format!("[thread {thread_id} summary: {} turns]", excerpt.len()),
            entries_created: entry_ids_in_excerpt(excerpt),
            entries_updated: Vec::new(),
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
        ChunkSummary {
            thread_id,
            chunk_index,
            first_scene_index: first_scene,
            last_scene_index: last_scene,
            text: format!(
                "[chunk {chunk_index} of thread {thread_id}: scenes {first_scene}-{last_scene}]"
            ),
            entry_ids: entry_ids_in_excerpt(excerpt),
        }
    }

    async fn merge_cumulative(&self, cumulative: &str, addition: &str) -> String {
        if cumulative.is_empty() {
            format!("[merged] {addition}")
        } else {
            format!("{cumulative}\n[merged] {addition}")
        }
    }
}

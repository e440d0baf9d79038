/// Aggregate compaction statistics across a run.
#[derive(Clone, Debug, Default)]
pub struct CompactionStats {
    pub chunk_compactions: u64,
    pub thread_compactions: u64,
    pub thinking_trims: u64,
    pub response_truncations: u64,
    pub total_compactions: u64,
    pub total_tokens_saved: u64,
    usage_samples: Vec<f64>,
}

impl CompactionStats {
    pub fn record_compaction(&mut self, tokens_before: usize, tokens_after: usize) {
        self.total_compactions += 1;
        self.total_tokens_saved += tokens_before.saturating_sub(tokens_after) as u64;
    }

    pub fn record_usage(&mut self, usage_percent: f64) {
        self.usage_samples.push(usage_percent);
    }

    pub fn avg_usage_percent(&self) -> f64 {
        if self.usage_samples.is_empty() {
            return 0.0;
        }
        self.usage_samples.iter().sum::<f64>() / self.usage_samples.len() as f64
    }

    pub fn max_usage_percent(&self) -> f64 {
        self.usage_samples.iter().copied().fold(0.0, f64::max)
    }

    pub fn summary(&self) -> String {
        format!(
            "compactions: {} (chunk={} thread={} thinking={} truncate={}) | tokens saved: {} | avg usage: {:.1}% | max usage: {:.1}%",
            self.total_compactions,
            self.chunk_compactions,
            self.thread_compactions,
            self.thinking_trims,
            self.response_truncations,
            self.total_tokens_saved,
            self.avg_usage_percent(),
            self.max_usage_percent(),
        )
    }
}

use std::path::PathBuf;

/// Tunables for an annotation run.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub corpus_db: PathBuf,
    pub annotator_db: PathBuf,
    pub agent_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    /// Resume from run_state.last_post_id.
    pub resume: bool,
    /// Cap on dispatcher round-trips per scene.
    pub max_tool_rounds: usize,
    pub context_budget: usize,
    /// Corpus reader page size.
    pub batch_size: usize,
    /// Optional advisory checkpoint cadence within a thread; boundaries
    /// always checkpoint.
    pub checkpoint_every_scenes: Option<u32>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            corpus_db: PathBuf::from("corpus.db"),
            annotator_db: PathBuf::from("annotator.db"),
            agent_url: "http://localhost:8080".to_string(),
            temperature: 0.4,
            max_tokens: 768,
            request_timeout_secs: 60,
            resume: true,
            max_tool_rounds: 10,
            context_budget: 98_304,
            batch_size: 256,
            checkpoint_every_scenes: None,
        }
    }
}

/// Counters for a finished (or stopped) run.
#[derive(Clone, Debug, Default)]
pub struct RunResult {
    pub scenes_processed: u64,
    pub posts_processed: u64,
    pub threads_completed: u64,
    pub entries_created: u64,
    pub entries_updated: u64,
    pub tool_calls_total: u64,
    /// True when a stop request ended the run before the corpus did.
    pub stopped_early: bool,
}

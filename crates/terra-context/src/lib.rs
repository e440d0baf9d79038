//! Conversation state for the annotation dialogue: message assembly,
//! token accounting, summarization, and the tiered rolling compactor that
//! keeps a multi-day run inside its context budget.

pub mod annotation;
pub mod compactor;
pub mod metrics;
pub mod prompts;
pub mod stub;
pub mod summarizer;
pub mod tokens;

pub use annotation::{AnnotationContext, MessageInputs};
pub use compactor::{CompactionConfig, CompactionResult, CompactionState, Compactor};
pub use metrics::CompactionStats;
pub use stub::StubSummarizer;
pub use summarizer::{LlmSummarizer, Summarize, SummaryResult};
pub use tokens::TokenCounter;

use terra_corpus::CorpusError;
use terra_llm::AgentError;
use terra_store::StoreError;
use terra_tools::DispatchError;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Persistent agent failure after retries; the runner checkpointed
    /// and halted cleanly.
    #[error("halted on persistent agent failure: {0}")]
    Halted(AgentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Corpus(#[from] CorpusError),
}

impl From<DispatchError> for RunnerError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Store(e) => Self::Store(e),
            DispatchError::Corpus(e) => Self::Corpus(e),
        }
    }
}

impl RunnerError {
    /// Process exit code: 1 for an LLM halt, 2 for storage trouble.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Halted(_) => 1,
            Self::Store(_) | Self::Corpus(_) => 2,
        }
    }
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use terra_core::messages::{ChatMessage, ToolCall};

use crate::client::{AgentApi, ChatRequest, ChatResponse};
use crate::error::AgentError;

/// Pre-programmed chat outcomes for deterministic tests without a server.
pub enum MockResponse {
    Message(ChatMessage),
    Error(AgentError),
}

impl MockResponse {
    pub fn text(content: &str) -> Self {
        Self::Message(ChatMessage::assistant(content))
    }

    pub fn tool_calls(content: &str, calls: Vec<ToolCall>) -> Self {
        let mut msg = ChatMessage::assistant(content);
        msg.tool_calls = Some(calls);
        Self::Message(msg)
    }
}

/// Scripted agent double. Responses are consumed in order; requests are
/// recorded for assertions.
pub struct MockAgent {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
    chat_calls: AtomicUsize,
    tokenize_fails: AtomicBool,
    tokenize_calls: AtomicUsize,
}

impl MockAgent {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            chat_calls: AtomicUsize::new(0),
            tokenize_fails: AtomicBool::new(false),
            tokenize_calls: AtomicUsize::new(0),
        }
    }

    /// Make every tokenize call fail (drives the counter's fallback path).
    pub fn with_failing_tokenize(self) -> Self {
        self.tokenize_fails.store(true, Ordering::Relaxed);
        self
    }

    /// Append another scripted response mid-test.
    pub fn push_response(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::Relaxed)
    }

    pub fn tokenize_calls(&self) -> usize {
        self.tokenize_calls.load(Ordering::Relaxed)
    }

    /// Requests seen so far, oldest first.
    pub fn recorded_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl AgentApi for MockAgent {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, AgentError> {
        self.chat_calls.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request);

        match self.responses.lock().pop_front() {
            Some(MockResponse::Message(message)) => Ok(ChatResponse { message }),
            Some(MockResponse::Error(e)) => Err(e),
            None => Err(AgentError::Malformed(
                "MockAgent: no response scripted for this call".into(),
            )),
        }
    }

    /// Deterministic tokenization: one token per 4 characters, minimum 1.
    async fn tokenize(&self, text: &str) -> Result<Vec<u32>, AgentError> {
        self.tokenize_calls.fetch_add(1, Ordering::Relaxed);
        if self.tokenize_fails.load(Ordering::Relaxed) {
            return Err(AgentError::Connection("tokenize disabled".into()));
        }
        let count = (text.chars().count() / 4).max(1);
        Ok((0..count as u32).collect())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

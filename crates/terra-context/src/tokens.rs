use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use terra_core::messages::ChatMessage;
use terra_llm::AgentApi;

/// Overhead per message for role framing.
const MESSAGE_OVERHEAD: usize = 4;
/// Extra overhead for tool call structure.
const TOOL_CALL_OVERHEAD: usize = 10;

/// Token accounting with the server's tokenize endpoint as the primary
/// source and a character heuristic as fallback.
///
/// The fallback latches: after the first tokenize failure the counter
/// stays on the heuristic for the rest of the run so budget math does not
/// oscillate between sources.
pub struct TokenCounter {
    agent: Option<Arc<dyn AgentApi>>,
    chars_per_token: f64,
    using_fallback: AtomicBool,
    fallback_warned: AtomicBool,
}

impl TokenCounter {
    pub fn new(agent: Arc<dyn AgentApi>) -> Self {
        Self {
            agent: Some(agent),
            chars_per_token: 4.0,
            using_fallback: AtomicBool::new(false),
            fallback_warned: AtomicBool::new(false),
        }
    }

    /// Heuristic-only counter (no server).
    pub fn heuristic() -> Self {
        Self {
            agent: None,
            chars_per_token: 4.0,
            using_fallback: AtomicBool::new(true),
            fallback_warned: AtomicBool::new(false),
        }
    }

    pub fn with_chars_per_token(mut self, chars_per_token: f64) -> Self {
        self.chars_per_token = chars_per_token;
        self
    }

    pub fn using_fallback(&self) -> bool {
        self.using_fallback.load(Ordering::Relaxed)
    }

    /// Count tokens in a text. Downgrades to the heuristic permanently on
    /// the first tokenize failure.
    pub async fn count(&self, text: &str) -> usize {
        if !self.using_fallback() {
            if let Some(agent) = &self.agent {
                match agent.tokenize(text).await {
                    Ok(tokens) => return tokens.len(),
                    Err(e) => {
                        if !self.fallback_warned.swap(true, Ordering::Relaxed) {
                            warn!(error = %e, "tokenize failed, falling back to char heuristic");
                        }
                        self.using_fallback.store(true, Ordering::Relaxed);
                    }
                }
            }
        }
        self.heuristic_count(text)
    }

    /// Count a message list with the heuristic. Cheap enough to call in
    /// the compactor's inner loop without hammering the server.
    pub fn count_messages(&self, messages: &[ChatMessage]) -> usize {
        let mut total = 0;
        for msg in messages {
            if !msg.content.is_empty() {
                total += self.heuristic_count(&msg.content);
            }
            total += MESSAGE_OVERHEAD;
            if let Some(calls) = &msg.tool_calls {
                for call in calls {
                    total += self.heuristic_count(&call.function.name);
                    total += self.heuristic_count(&call.function.arguments);
                    total += TOOL_CALL_OVERHEAD;
                }
            }
        }
        total
    }

    /// Heuristic count, cross-checked against the tokenize endpoint once
    /// usage passes `verify_threshold` tokens. The larger of the two wins
    /// so a drifting heuristic cannot hide real pressure.
    pub async fn count_messages_verified(
        &self,
        messages: &[ChatMessage],
        verify_threshold: usize,
    ) -> usize {
        let estimate = self.count_messages(messages);
        if estimate < verify_threshold || self.using_fallback() {
            return estimate;
        }

        let combined: String = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let remote = self.count(&combined).await;
        if self.using_fallback() {
            return estimate;
        }
        estimate.max(remote + messages.len() * MESSAGE_OVERHEAD)
    }

    /// `ceil(chars / chars_per_token)`, at least 1.
    fn heuristic_count(&self, text: &str) -> usize {
        ((text.chars().count() as f64 / self.chars_per_token).ceil() as usize).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terra_llm::MockAgent;

    #[tokio::test]
    async fn remote_count_used_when_available() {
        let agent = Arc::new(MockAgent::new(vec![]));
        let counter = TokenCounter::new(agent.clone());
        let count = counter.count("abcdefgh").await;
        assert_eq!(count, 2);
        assert!(!counter.using_fallback());
        assert_eq!(agent.tokenize_calls(), 1);
    }

    #[tokio::test]
    async fn fallback_latches_after_first_failure() {
        let agent = Arc::new(MockAgent::new(vec![]).with_failing_tokenize());
        let counter = TokenCounter::new(agent.clone());

        let count = counter.count("abcdefgh").await;
        assert_eq!(count, 2); // ceil(8 / 4)
        assert!(counter.using_fallback());

        // Subsequent counts never touch the endpoint again.
        counter.count("more text").await;
        assert_eq!(agent.tokenize_calls(), 1);
    }

    #[test]
    fn message_count_includes_overheads() {
        let counter = TokenCounter::heuristic();
        let messages = vec![ChatMessage::user("abcdefgh")]; // 2 + 4 overhead
        assert_eq!(counter.count_messages(&messages), 6);

        let empty = vec![ChatMessage::user("")];
        assert_eq!(counter.count_messages(&empty), MESSAGE_OVERHEAD);
    }

    #[test]
    fn tool_calls_add_overhead() {
        let counter = TokenCounter::heuristic();
        let mut msg = ChatMessage::assistant("");
        msg.tool_calls = Some(vec![terra_core::messages::ToolCall::new(
            "call_1",
            "glossary_search",
            serde_json::json!({"query": "soma"}),
        )]);
        let plain = counter.count_messages(&[ChatMessage::assistant("")]);
        let with_call = counter.count_messages(&[msg]);
        assert!(with_call > plain + TOOL_CALL_OVERHEAD);
    }

    #[tokio::test]
    async fn verified_count_below_threshold_skips_server() {
        let agent = Arc::new(MockAgent::new(vec![]));
        let counter = TokenCounter::new(agent.clone());
        let messages = vec![ChatMessage::user("short")];
        counter.count_messages_verified(&messages, 1000).await;
        assert_eq!(agent.tokenize_calls(), 0);
    }

    #[tokio::test]
    async fn verified_count_cross_checks_above_threshold() {
        let agent = Arc::new(MockAgent::new(vec![]));
        let counter = TokenCounter::new(agent.clone());
        let messages = vec![ChatMessage::user("a".repeat(400))];
        let count = counter.count_messages_verified(&messages, 50).await;
        assert_eq!(agent.tokenize_calls(), 1);
        assert!(count >= 100);
    }

    #[test]
    fn heuristic_rounds_up_and_floors_at_one() {
        let counter = TokenCounter::heuristic();
        assert_eq!(counter.count_messages(&[ChatMessage::user("abcde")]), 2 + 4);
        assert_eq!(counter.count_messages(&[ChatMessage::user("a")]), 1 + 4);
    }
}

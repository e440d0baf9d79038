use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use terra_core::messages::{ChatMessage, ToolDefinition};

use crate::error::AgentError;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 3;

/// A chat-completion request.
#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: 0.4,
            max_tokens: 768,
            tools: None,
            tool_choice: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        if !tools.is_empty() {
            self.tools = Some(tools);
            self.tool_choice = Some("auto".to_string());
        }
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }
}

/// The assistant message of the first choice.
#[derive(Clone, Debug, Deserialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct TokenizeBody {
    tokens: Vec<u32>,
}

/// The surface the harness consumes; [`MockAgent`](crate::MockAgent)
/// substitutes in tests.
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, AgentError>;
    async fn tokenize(&self, text: &str) -> Result<Vec<u32>, AgentError>;
    async fn health_check(&self) -> bool;
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: MAX_RETRIES,
        }
    }
}

/// HTTP client for the agent server.
pub struct AgentClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl AgentClient {
    pub fn new(config: ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.timeout)
            .build()
            .expect("failed to build HTTP client");
        Self { http, config }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self::new(ClientConfig {
            base_url: base_url.into(),
            ..Default::default()
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    /// POST with up to `max_retries` attempts; transient failures back off
    /// exponentially (1s, 2s, 4s, ...).
    async fn post_with_retry(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        let url = self.url(endpoint);
        let mut last_error: Option<AgentError> = None;

        for attempt in 0..self.config.max_retries {
            match self.post_once(&url, body).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.config.max_retries => {
                    let delay = Duration::from_secs(1 << attempt);
                    warn!(
                        endpoint,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "agent request failed, retrying"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(AgentError::RetriesExhausted(
            last_error.map(|e| e.to_string()).unwrap_or_else(|| "no attempts".into()),
        ))
    }

    async fn post_once(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        let response = self.http.post(url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::Timeout(self.config.timeout.as_secs())
            } else if e.is_connect() {
                AgentError::Connection(e.to_string())
            } else {
                AgentError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Server { status: status.as_u16(), body });
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Request { status: status.as_u16(), body });
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl AgentApi for AgentClient {
    /// Call `/v1/chat/completions` and return the first choice.
    #[instrument(skip(self, request), fields(messages = request.messages.len()))]
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, AgentError> {
        let body = serde_json::to_value(&request)
            .map_err(|e| AgentError::Malformed(format!("request encode: {e}")))?;
        let data = self.post_with_retry("/v1/chat/completions", &body).await?;

        let parsed: CompletionBody = serde_json::from_value(data)
            .map_err(|e| AgentError::Malformed(format!("completion decode: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Malformed("empty choices".into()))?;
        debug!(has_tool_calls = choice.message.has_tool_calls(), "chat response");
        Ok(ChatResponse { message: choice.message })
    }

    /// Call `/tokenize` and return token ids.
    async fn tokenize(&self, text: &str) -> Result<Vec<u32>, AgentError> {
        let body = serde_json::json!({ "prompt": text });
        let data = self.post_with_retry("/tokenize", &body).await?;
        let parsed: TokenizeBody = serde_json::from_value(data)
            .map_err(|e| AgentError::Malformed(format!("tokenize decode: {e}")))?;
        Ok(parsed.tokens)
    }

    async fn health_check(&self) -> bool {
        self.http
            .get(self.url("/health"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terra_core::messages::ChatMessage;

    #[test]
    fn chat_request_serializes_tools_only_when_present() {
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]);
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("tool_choice").is_none());
        assert_eq!(json["temperature"], 0.4);
        assert_eq!(json["max_tokens"], 768);

        let with_tools = ChatRequest::new(vec![ChatMessage::user("hi")]).with_tools(vec![
            ToolDefinition::function("glossary_search", "search", serde_json::json!({})),
        ]);
        let json = serde_json::to_value(&with_tools).unwrap();
        assert_eq!(json["tool_choice"], "auto");
        assert_eq!(json["tools"][0]["function"]["name"], "glossary_search");
    }

    #[test]
    fn empty_tool_list_is_omitted() {
        let request = ChatRequest::new(vec![]).with_tools(vec![]);
        assert!(request.tools.is_none());
        assert!(request.tool_choice.is_none());
    }

    #[test]
    fn completion_body_parses_first_choice() {
        let raw = serde_json::json!({
            "choices": [
                {"message": {"role": "assistant", "content": "hello"}},
                {"message": {"role": "assistant", "content": "ignored"}}
            ]
        });
        let parsed: CompletionBody = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hello");
    }

    #[test]
    fn url_joins_without_double_slash() {
        let client = AgentClient::with_base_url("http://localhost:8080/");
        assert_eq!(client.url("/tokenize"), "http://localhost:8080/tokenize");
    }

    #[tokio::test]
    async fn unreachable_server_is_connection_error() {
        let client = AgentClient::new(ClientConfig {
            base_url: "http://127.0.0.1:1".into(),
            timeout: Duration::from_millis(200),
            max_retries: 1,
        });
        let err = client.tokenize("hello").await.unwrap_err();
        assert!(
            matches!(err, AgentError::Connection(_) | AgentError::Timeout(_)),
            "got: {err:?}"
        );
        assert!(!client.health_check().await);
    }
}

//! LLM provider abstraction.
//!
//! A unified async trait over chat-completion providers with optional tool
//! calling, concrete Anthropic and OpenAI-compatible implementations, and a
//! mock provider for tests.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur when interacting with an LLM provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// An HTTP-level error (connection failure, DNS, TLS, etc.).
    #[error("http error: {0}")]
    Http(String),

    /// The API returned a non-success status with a message.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Authentication rejected (401/403) after the credential cycle is spent.
    #[error("authentication rejected (status {status})")]
    Auth { status: u16 },

    /// The API indicated rate limiting (HTTP 429).
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// Failed to parse the API response body.
    #[error("parse error: {0}")]
    Parse(String),

    /// A spend ceiling was hit; never retried.
    #[error("budget exceeded: spent ${spent:.2} of ${limit:.2}")]
    BudgetExceeded { spent: f64, limit: f64 },

    /// Client-side validation failure; never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// The provider's circuit breaker is open; calls fast-fail.
    #[error("circuit open for provider {0}")]
    CircuitOpen(String),

    /// Retries and model fallbacks on one provider are exhausted.
    #[error("provider {0} unavailable")]
    ProviderUnavailable(String),

    /// Every configured provider was tried and failed.
    #[error("no provider available")]
    NoProvider,

    /// The requested operation is not supported by this provider.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl LlmError {
    /// Transient errors worth another attempt: network, 5xx, rate limits,
    /// timeouts, and malformed responses a repair pass might fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http(_)
            | LlmError::RateLimited { .. }
            | LlmError::Timeout
            | LlmError::Parse(_) => true,
            LlmError::Api { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }

    /// Fatal per-call errors that must not be retried or failed over.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LlmError::BudgetExceeded { .. } | LlmError::Auth { .. } | LlmError::Validation(_)
        )
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Http(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRole::System => write!(f, "system"),
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
            ChatRole::Tool => write!(f, "tool"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    /// A tool-result message tied back to its originating call.
    pub fn tool(content: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            name: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Schema of a tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as emitted by the model.
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    pub usage: Option<TokenUsage>,
    /// Server-side trace id, when the provider surfaces one.
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl ChatResponse {
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// Configuration for one chat completion request.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
    /// Hard deadline for the call; breaches count as breaker failures.
    pub timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_tokens: 4096,
            temperature: 0.7,
            system_prompt: None,
            timeout: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

/// An async sequence of streamed text chunks.
pub type ChunkStream =
    std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request, optionally advertising tools.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &ChatConfig,
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatResponse>;

    /// Stream a completion chunk-by-chunk. Providers without streaming
    /// support return `Err(LlmError::Unsupported(..))`; callers fall back
    /// to [`chat`](Self::chat).
    async fn stream(
        &self,
        _messages: &[ChatMessage],
        _config: &ChatConfig,
    ) -> Result<ChunkStream> {
        Err(LlmError::Unsupported(format!(
            "streaming not implemented for {}",
            self.name()
        )))
    }

    /// Human-readable provider name (e.g. "anthropic", "openai").
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// KeyRing - round-robin credentials
// ---------------------------------------------------------------------------

/// API keys for one provider. Rate-limit errors advance the cursor; after a
/// full cycle without success the failure propagates to the retry layer.
#[derive(Debug)]
pub struct KeyRing {
    keys: Vec<String>,
    cursor: AtomicUsize,
}

impl KeyRing {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Resolve keys from a list of environment variable names, skipping
    /// unset variables.
    pub fn from_env(var_names: &[String]) -> Self {
        let keys = var_names
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .filter(|k| !k.is_empty())
            .collect();
        Self::new(keys)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn current(&self) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let idx = self.cursor.load(Ordering::Relaxed) % self.keys.len();
        Some(&self.keys[idx])
    }

    /// Move to the next key.
    pub fn advance(&self) {
        if !self.keys.is_empty() {
            self.cursor.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// Provider for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    keys: KeyRing,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(keys: KeyRing) -> Self {
        Self {
            client: reqwest::Client::new(),
            keys,
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    /// Override the base URL (useful for testing with a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn build_request_body(
        messages: &[ChatMessage],
        config: &ChatConfig,
        tools: Option<&[ToolSpec]>,
    ) -> serde_json::Value {
        // System text goes in the top-level `system` field, not the array.
        let mut system_text = config.system_prompt.clone();
        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter_map(|msg| match msg.role {
                ChatRole::System => {
                    match system_text.as_mut() {
                        Some(s) => {
                            s.push('\n');
                            s.push_str(&msg.content);
                        }
                        None => system_text = Some(msg.content.clone()),
                    }
                    None
                }
                ChatRole::Tool => Some(serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id,
                        "content": msg.content,
                    }],
                })),
                _ => Some(serde_json::json!({
                    "role": msg.role.to_string(),
                    "content": msg.content,
                })),
            })
            .collect();

        let mut body = serde_json::json!({
            "model": config.model,
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "messages": api_messages,
        });
        if let Some(system) = system_text {
            body["system"] = serde_json::Value::String(system);
        }
        if let Some(tools) = tools {
            let schemas: Vec<_> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = serde_json::Value::Array(schemas);
        }
        body
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    model: String,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &ChatConfig,
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatResponse> {
        let api_key = self
            .keys
            .current()
            .ok_or_else(|| LlmError::Validation("no Anthropic API key configured".into()))?
            .to_string();

        let body = Self::build_request_body(messages, config, tools);
        let url = format!("{}/v1/messages", self.base_url);

        let resp = self
            .client
            .post(&url)
            .timeout(config.timeout)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let trace_id = resp
            .headers()
            .get("request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(LlmError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if status == 401 || status == 403 {
            return Err(LlmError::Auth { status });
        }
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }

        let api_resp: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in api_resp.content {
            match block.kind.as_str() {
                "text" => {
                    if let Some(text) = block.text {
                        content.push_str(&text);
                    }
                }
                "tool_use" => tool_calls.push(ToolCall {
                    id: block.id.unwrap_or_default(),
                    name: block.name.unwrap_or_default(),
                    arguments: block
                        .input
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "{}".into()),
                }),
                _ => {}
            }
        }

        Ok(ChatResponse {
            content: (!content.is_empty()).then_some(content),
            tool_calls,
            model: api_resp.model,
            usage: Some(TokenUsage {
                input_tokens: api_resp.usage.input_tokens,
                output_tokens: api_resp.usage.output_tokens,
            }),
            trace_id,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

// ---------------------------------------------------------------------------
// OpenAiProvider
// ---------------------------------------------------------------------------

/// Provider for OpenAI-compatible chat completions endpoints.
pub struct OpenAiProvider {
    client: reqwest::Client,
    keys: KeyRing,
    base_url: String,
    provider_name: String,
}

impl OpenAiProvider {
    pub fn new(keys: KeyRing) -> Self {
        Self {
            client: reqwest::Client::new(),
            keys,
            base_url: "https://api.openai.com".to_string(),
            provider_name: "openai".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Rename the provider (e.g. a local OpenAI-compatible server).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.provider_name = name.into();
        self
    }

    pub fn build_request_body(
        messages: &[ChatMessage],
        config: &ChatConfig,
        tools: Option<&[ToolSpec]>,
    ) -> serde_json::Value {
        let mut api_messages: Vec<serde_json::Value> = Vec::new();
        if let Some(ref system) = config.system_prompt {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": system,
            }));
        }
        for msg in messages {
            let mut value = serde_json::json!({
                "role": msg.role.to_string(),
                "content": msg.content,
            });
            if let Some(ref call_id) = msg.tool_call_id {
                value["tool_call_id"] = serde_json::Value::String(call_id.clone());
            }
            api_messages.push(value);
        }

        let mut body = serde_json::json!({
            "model": config.model,
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "messages": api_messages,
        });
        if let Some(tools) = tools {
            let schemas: Vec<_> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = serde_json::Value::Array(schemas);
        }
        body
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    model: String,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageResp,
}

#[derive(Deserialize)]
struct OpenAiMessageResp {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &ChatConfig,
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatResponse> {
        let api_key = self
            .keys
            .current()
            .ok_or_else(|| LlmError::Validation("no OpenAI API key configured".into()))?
            .to_string();

        let body = Self::build_request_body(messages, config, tools);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let resp = self
            .client
            .post(&url)
            .timeout(config.timeout)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let trace_id = resp
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(LlmError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if status == 401 || status == 403 {
            return Err(LlmError::Auth { status });
        }
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }

        let api_resp: OpenAiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        let choice = api_resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Parse("no choices in response".into()))?;

        Ok(ChatResponse {
            content: choice.message.content,
            tool_calls: choice
                .message
                .tool_calls
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect(),
            model: api_resp.model,
            usage: api_resp.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
            trace_id,
        })
    }

    fn name(&self) -> &str {
        &self.provider_name
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// A mock provider for tests. Each call pops the next queued response; an
/// empty queue yields a default response. Requests are captured for
/// assertions.
pub struct MockProvider {
    responses: Mutex<VecDeque<Result<ChatResponse>>>,
    captured: Mutex<Vec<(Vec<ChatMessage>, ChatConfig)>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            captured: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful text response.
    pub fn with_text(self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.responses.lock().unwrap().push_back(Ok(ChatResponse {
            content: Some(text),
            tool_calls: Vec::new(),
            model: "mock-model".into(),
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            }),
            trace_id: None,
        }));
        self
    }

    /// Queue a full response.
    pub fn with_response(self, response: ChatResponse) -> Self {
        self.responses.lock().unwrap().push_back(Ok(response));
        self
    }

    /// Queue an error response.
    pub fn with_error(self, error: LlmError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn captured_requests(&self) -> Vec<(Vec<ChatMessage>, ChatConfig)> {
        self.captured.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.captured.lock().unwrap().len()
    }

    fn default_response(model: &str) -> ChatResponse {
        ChatResponse {
            content: Some("mock response".into()),
            tool_calls: Vec::new(),
            model: model.to_string(),
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            }),
            trace_id: None,
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &ChatConfig,
        _tools: Option<&[ToolSpec]>,
    ) -> Result<ChatResponse> {
        self.captured
            .lock()
            .unwrap()
            .push((messages.to_vec(), config.clone()));

        let mut queue = self.responses.lock().unwrap();
        match queue.pop_front() {
            Some(result) => result,
            None => Ok(Self::default_response(&config.model)),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(LlmError::Http("conn refused".into()).is_retryable());
        assert!(LlmError::Timeout.is_retryable());
        assert!(LlmError::RateLimited {
            retry_after_secs: None
        }
        .is_retryable());
        assert!(LlmError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!LlmError::Api {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!LlmError::Auth { status: 401 }.is_retryable());
        assert!(!LlmError::BudgetExceeded {
            spent: 1.0,
            limit: 1.0
        }
        .is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(LlmError::Auth { status: 403 }.is_fatal());
        assert!(LlmError::Validation("bad".into()).is_fatal());
        assert!(!LlmError::Timeout.is_fatal());
    }

    #[test]
    fn keyring_rotates_round_robin() {
        let ring = KeyRing::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(ring.current(), Some("a"));
        ring.advance();
        assert_eq!(ring.current(), Some("b"));
        ring.advance();
        ring.advance();
        assert_eq!(ring.current(), Some("a"));
    }

    #[test]
    fn empty_keyring_has_no_current() {
        let ring = KeyRing::new(Vec::new());
        assert!(ring.current().is_none());
        ring.advance(); // no panic
    }

    #[test]
    fn anthropic_body_hoists_system_messages() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
        ];
        let config = ChatConfig {
            model: "m".into(),
            ..ChatConfig::default()
        };
        let body = AnthropicProvider::build_request_body(&messages, &config, None);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn anthropic_body_encodes_tool_results() {
        let messages = vec![ChatMessage::tool("{\"ok\":true}", "call_1")];
        let body =
            AnthropicProvider::build_request_body(&messages, &ChatConfig::default(), None);
        let first = &body["messages"][0];
        assert_eq!(first["role"], "user");
        assert_eq!(first["content"][0]["type"], "tool_result");
        assert_eq!(first["content"][0]["tool_use_id"], "call_1");
    }

    #[test]
    fn openai_body_includes_tool_schemas() {
        let tools = vec![ToolSpec {
            name: "shell".into(),
            description: "run a command".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let body = OpenAiProvider::build_request_body(
            &[ChatMessage::user("go")],
            &ChatConfig::default(),
            Some(&tools),
        );
        assert_eq!(body["tools"][0]["function"]["name"], "shell");
    }

    #[tokio::test]
    async fn streaming_defaults_to_unsupported() {
        let provider = MockProvider::new();
        let result = provider.stream(&[], &ChatConfig::default()).await;
        match result {
            Err(err) => assert!(matches!(err, LlmError::Unsupported(_))),
            Ok(_) => panic!("expected stream() to return an error"),
        }
    }

    #[tokio::test]
    async fn mock_pops_queued_responses_then_defaults() {
        let provider = MockProvider::new()
            .with_text("first")
            .with_error(LlmError::Timeout);

        let config = ChatConfig {
            model: "m".into(),
            ..ChatConfig::default()
        };
        let messages = vec![ChatMessage::user("x")];

        let first = provider.chat(&messages, &config, None).await.unwrap();
        assert_eq!(first.text(), "first");

        assert!(matches!(
            provider.chat(&messages, &config, None).await,
            Err(LlmError::Timeout)
        ));

        let third = provider.chat(&messages, &config, None).await.unwrap();
        assert_eq!(third.text(), "mock response");
        assert_eq!(provider.call_count(), 3);
    }
}

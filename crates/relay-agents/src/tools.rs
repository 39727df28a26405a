//! Tool dispatcher seam.
//!
//! The core routes tool calls and feeds results back into the model
//! conversation; it never interprets tool semantics. Real tools (shell,
//! browser, filesystem) live behind [`ToolDispatcher`] implementations
//! registered by the embedding application.

use async_trait::async_trait;
use serde_json::Value;

use relay_llm::provider::{ChatResponse, ToolCall, ToolSpec};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),

    #[error("invalid params for {tool}: {detail}")]
    InvalidParams { tool: String, detail: String },

    #[error("tool {tool} failed ({kind}): {message}")]
    Failed {
        tool: String,
        kind: String,
        message: String,
    },
}

impl ToolError {
    /// Category string surfaced to users (never stack traces).
    pub fn kind(&self) -> &str {
        match self {
            ToolError::NotFound(_) => "not_found",
            ToolError::InvalidParams { .. } => "invalid_params",
            ToolError::Failed { kind, .. } => kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Invoke a tool by name with JSON params.
    async fn invoke(&self, name: &str, params: Value) -> Result<Value, ToolError>;

    /// Registered tool schemas, advertised to the model.
    fn catalog(&self) -> Vec<ToolSpec>;
}

/// Dispatcher with no tools; every invocation is `NotFound`.
pub struct NoopDispatcher;

#[async_trait]
impl ToolDispatcher for NoopDispatcher {
    async fn invoke(&self, name: &str, _params: Value) -> Result<Value, ToolError> {
        Err(ToolError::NotFound(name.to_string()))
    }

    fn catalog(&self) -> Vec<ToolSpec> {
        Vec::new()
    }
}

/// Test dispatcher exposing a single `echo` tool that returns its params.
pub struct EchoDispatcher;

#[async_trait]
impl ToolDispatcher for EchoDispatcher {
    async fn invoke(&self, name: &str, params: Value) -> Result<Value, ToolError> {
        match name {
            "echo" => Ok(serde_json::json!({ "echo": params })),
            other => Err(ToolError::NotFound(other.to_string())),
        }
    }

    fn catalog(&self) -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "echo".into(),
            description: "Echo the given params back".into(),
            parameters: serde_json::json!({"type": "object"}),
        }]
    }
}

// ---------------------------------------------------------------------------
// Call extraction
// ---------------------------------------------------------------------------

/// All tool calls in a response: the structured ones, plus any legacy
/// fenced ```` ```tool ```` JSON blocks older models emit in plain text.
pub fn extract_tool_calls(response: &ChatResponse) -> Vec<ToolCall> {
    let mut calls = response.tool_calls.clone();
    if let Some(content) = &response.content {
        calls.extend(parse_inline_tool_calls(content));
    }
    calls
}

/// Parse fenced ```` ```tool ```` blocks of the form
/// `{"name": "...", "params": {...}}`.
fn parse_inline_tool_calls(content: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut rest = content;
    let mut counter = 0;

    while let Some(open) = rest.find("```tool") {
        let after = &rest[open + "```tool".len()..];
        let Some(close) = after.find("```") else { break };
        let raw = after[..close].trim();

        if let Ok(value) = serde_json::from_str::<Value>(raw) {
            if let Some(name) = value.get("name").and_then(Value::as_str) {
                counter += 1;
                calls.push(ToolCall {
                    id: format!("inline-{counter}"),
                    name: name.to_string(),
                    arguments: value
                        .get("params")
                        .cloned()
                        .unwrap_or(Value::Object(Default::default()))
                        .to_string(),
                });
            }
        }
        rest = &after[close + 3..];
    }
    calls
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_content(content: &str) -> ChatResponse {
        ChatResponse {
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
            model: "m".into(),
            usage: None,
            trace_id: None,
        }
    }

    #[tokio::test]
    async fn echo_dispatcher_round_trips() {
        let dispatcher = EchoDispatcher;
        let result = dispatcher
            .invoke("echo", serde_json::json!({"msg": "hi"}))
            .await
            .unwrap();
        assert_eq!(result["echo"]["msg"], "hi");

        let err = dispatcher.invoke("shell", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn inline_tool_blocks_are_parsed() {
        let response = response_with_content(
            "Let me check.\n```tool\n{\"name\": \"search\", \"params\": {\"q\": \"rust\"}}\n```",
        );
        let calls = extract_tool_calls(&response);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
        assert!(calls[0].arguments.contains("rust"));
    }

    #[test]
    fn structured_and_inline_calls_combine() {
        let mut response = response_with_content(
            "```tool\n{\"name\": \"b\", \"params\": {}}\n```",
        );
        response.tool_calls.push(ToolCall {
            id: "s1".into(),
            name: "a".into(),
            arguments: "{}".into(),
        });
        let calls = extract_tool_calls(&response);
        let names: Vec<_> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn malformed_inline_blocks_are_ignored() {
        let response = response_with_content("```tool\nnot json\n```");
        assert!(extract_tool_calls(&response).is_empty());
    }
}

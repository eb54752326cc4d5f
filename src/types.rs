//! Core type definitions for the orchestration engine.
//!
//! The type system is organized into three main categories:
//!
//! # Conversation Model
//!
//! - [`Message`]: one entry in a task's ordered conversation log
//! - [`MessageRole`]: who sent the message (System, User, Assistant, Tool)
//! - [`MessageTag`]: engine-internal marker (tool result, summary, demoted)
//!
//! The orchestrator exclusively owns its `Vec<Message>` for the lifetime of
//! one task. Messages are append-only except for the explicit pop performed
//! during rollback.
//!
//! # Tool Invocation Model
//!
//! - [`ToolCall`]: a parsed request to invoke a remote tool
//! - [`ToolResult`]: the normalized outcome, carrying [`ErrorKind`]
//! - [`ToolCatalogEntry`]: one `(server, tool, schema)` entry shown to the LLM
//!
//! # OpenAI API Compatibility
//!
//! Wire types for talking to the upstream completion endpoint
//! ([`OpenAIRequest`], [`OpenAIResponse`], [`OpenAIChunk`]) and for the
//! requests this service accepts ([`ChatCompletionRequest`]).

use serde::{Deserialize, Serialize};

// ============================================================================
// CONVERSATION MODEL
// ============================================================================

/// Identifies the sender/role of a message in the conversation.
///
/// Serializes to lowercase strings via serde (`"system"`, `"user"`, etc.)
/// to match OpenAI API format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message that establishes agent behavior and context.
    System,

    /// User message: the task text, a tool result, or a summary prompt.
    User,

    /// Response from the model.
    Assistant,

    /// Reserved for providers that carry tool output under a distinct role.
    /// This engine carries tool output as `User` messages; the variant exists
    /// for wire compatibility when accepting requests.
    Tool,
}

/// Engine-internal classification of a message, never serialized to the wire.
///
/// The sliding-window context strategy needs to find tool-result messages in
/// the history, and the compaction strategy needs to recognize its own
/// summaries. Tagging at append time avoids re-parsing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageTag {
    /// Ordinary prompt or response text.
    #[default]
    Plain,

    /// A tool result carried as a user-role message.
    ToolResult,

    /// A tool result that the sliding window replaced with a placeholder.
    DemotedToolResult,

    /// A compressed-history summary produced by the summarizer.
    Summary,
}

/// One entry in a task's conversation log.
#[derive(Debug, Clone)]
pub struct Message {
    /// Who produced this message.
    pub role: MessageRole,
    /// Text content. Tool output is carried verbatim here.
    pub content: String,
    /// Engine-internal marker; not part of the wire format.
    pub tag: MessageTag,
}

impl Message {
    /// Create a message with an explicit role and tag.
    pub fn new(role: MessageRole, content: impl Into<String>, tag: MessageTag) -> Self {
        Self {
            role,
            content: content.into(),
            tag,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content, MessageTag::Plain)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content, MessageTag::Plain)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content, MessageTag::Plain)
    }

    /// Create a user-role message carrying a tool result.
    pub fn tool_result(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content, MessageTag::ToolResult)
    }

    /// Convert to the OpenAI wire representation.
    pub fn to_wire(&self) -> OpenAIMessage {
        OpenAIMessage {
            role: match self.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::Tool => "tool",
            }
            .to_string(),
            content: self.content.clone(),
        }
    }
}

/// Which loop an orchestrator instance is running.
///
/// The role selects the objective section of the system prompt, the summary
/// prompt wording, and the per-role turn budget from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    /// The top-level research loop.
    Main,
    /// A nested browsing loop spawned as a tool call of the main agent.
    SubBrowsing,
}

impl AgentRole {
    /// Stable identifier used in the duplicate-query index and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Main => "main",
            AgentRole::SubBrowsing => "sub-browsing",
        }
    }
}

// ============================================================================
// TOOL INVOCATION MODEL
// ============================================================================

/// A parsed request to invoke a remote tool, produced by the response parser.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// MCP server the tool lives on.
    pub server_name: String,
    /// Tool name within that server.
    pub tool_name: String,
    /// JSON arguments object.
    pub arguments: serde_json::Value,
}

/// Category of a failed tool invocation.
///
/// `Transport` and `RateLimited` are transient and surfaced verbatim to the
/// orchestrator; `Schema` is fatal for the call but not for the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No error.
    None,
    /// Network-level failure reaching the tool server.
    Transport,
    /// The tool server reported throttling.
    RateLimited,
    /// Unknown tool/server or arguments rejected by the declared schema.
    Schema,
    /// The tool server executed the call and reported an internal error.
    Server,
    /// The call did not complete within its deadline.
    Timeout,
}

/// Normalized outcome of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Tool that produced this result.
    pub tool_name: String,
    /// Textual payload (tool output, or the error message on failure).
    pub content: String,
    /// Whether the invocation failed.
    pub is_error: bool,
    /// Failure category; `ErrorKind::None` on success.
    pub error_kind: ErrorKind,
}

impl ToolResult {
    /// Successful result.
    pub fn ok(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            content: content.into(),
            is_error: false,
            error_kind: ErrorKind::None,
        }
    }

    /// Failed result with a category.
    pub fn err(
        tool_name: impl Into<String>,
        message: impl Into<String>,
        kind: ErrorKind,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            content: message.into(),
            is_error: true,
            error_kind: kind,
        }
    }
}

/// One entry of the tool catalog loaded from MCP servers at task start.
///
/// The catalog is rendered into the system prompt so the LLM knows which
/// `(server, tool)` pairs exist and what arguments they accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCatalogEntry {
    /// Server the tool belongs to.
    pub server_name: String,
    /// Tool name.
    pub tool_name: String,
    /// Human-readable description from the server.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's arguments.
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

// ============================================================================
// LLM COMPLETION MODEL
// ============================================================================

/// A full completion returned by the LLM client, with token usage.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    /// The generated text.
    pub text: String,
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Tokens generated.
    pub completion_tokens: u32,
}

// ============================================================================
// OPENAI WIRE FORMAT (upstream client)
// ============================================================================

/// Message in OpenAI wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// Request payload for `/chat/completions` on the upstream endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct OpenAIRequest {
    pub model: String,
    pub messages: Vec<OpenAIMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Token usage block reported by the upstream endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAIUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

/// Non-streaming completion response.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIResponse {
    pub choices: Vec<OpenAIResponseChoice>,
    #[serde(default)]
    pub usage: Option<OpenAIUsage>,
}

/// One choice of a non-streaming response.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIResponseChoice {
    pub message: OpenAIMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Streaming response chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIChunk {
    #[serde(default)]
    pub choices: Vec<OpenAIChoice>,
    #[serde(default)]
    pub usage: Option<OpenAIUsage>,
}

/// One choice of a streaming chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIChoice {
    pub delta: OpenAIDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Incremental delta inside a streaming chunk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAIDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

// ============================================================================
// SERVICE REQUEST FORMAT (downstream server)
// ============================================================================

/// Request body accepted by `/v1/chat/completions` and `/v2/chat/completions`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<OpenAIMessage>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_stream() -> bool {
    true
}

impl ChatCompletionRequest {
    /// The task text: content of the last user-role message.
    pub fn task_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let sys = Message::system("be helpful");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.tag, MessageTag::Plain);

        let result = Message::tool_result("output");
        assert_eq!(result.role, MessageRole::User);
        assert_eq!(result.tag, MessageTag::ToolResult);
    }

    #[test]
    fn test_message_to_wire() {
        let msg = Message::assistant("hello");
        let wire = msg.to_wire();
        assert_eq!(wire.role, "assistant");
        assert_eq!(wire.content, "hello");
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&MessageRole::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");
    }

    #[test]
    fn test_tool_result_constructors() {
        let ok = ToolResult::ok("google_search", "results");
        assert!(!ok.is_error);
        assert_eq!(ok.error_kind, ErrorKind::None);

        let err = ToolResult::err("scrape", "connection refused", ErrorKind::Transport);
        assert!(err.is_error);
        assert_eq!(err.error_kind, ErrorKind::Transport);
    }

    #[test]
    fn test_chat_request_task_text() {
        let body = serde_json::json!({
            "model": "agent",
            "messages": [
                {"role": "system", "content": "ignored"},
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "mid"},
                {"role": "user", "content": "What is 2+2?"}
            ]
        });
        let req: ChatCompletionRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.task_text(), Some("What is 2+2?"));
        assert!(req.stream);
    }

    #[test]
    fn test_chunk_deserialization() {
        let data = r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        let chunk: OpenAIChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
    }
}

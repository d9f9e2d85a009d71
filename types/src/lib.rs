//! Core domain types for crag.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

mod index;
mod model;

pub use index::{BatchStatus, FileDiff, FileIndex, FileRecord};
pub use model::{ApiKey, EnumKind, EnumParseError, ModelInfo, Provider, ReasoningEffort};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// What gets sent as the request input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum WindowInput {
    /// Ordered role/content messages.
    Messages(Vec<ChatMessage>),
    /// Provider-issued compacted items, passed through verbatim. New turns are
    /// appended as `{role, content}` items.
    Compacted(Vec<Value>),
}

/// The conversation state a chat session sends each turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationWindow {
    input: WindowInput,
    /// Id of the last completed response, if the provider keeps server-side state.
    continuation: Option<String>,
}

impl Default for ConversationWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationWindow {
    #[must_use]
    pub fn new() -> Self {
        Self {
            input: WindowInput::Messages(Vec::new()),
            continuation: None,
        }
    }

    #[must_use]
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            input: WindowInput::Messages(messages),
            continuation: None,
        }
    }

    #[must_use]
    pub fn input(&self) -> &WindowInput {
        &self.input
    }

    #[must_use]
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    pub fn set_continuation(&mut self, id: Option<String>) {
        self.continuation = id.filter(|id| !id.is_empty());
    }

    pub fn push(&mut self, message: ChatMessage) {
        match &mut self.input {
            WindowInput::Messages(messages) => messages.push(message),
            WindowInput::Compacted(items) => items.push(json!({
                "role": message.role.as_str(),
                "content": message.content,
            })),
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::assistant(content));
    }

    /// Replace the window with a compacted representation. The continuation
    /// token is dropped so the next turn sends the compacted items as input.
    pub fn replace_with_compacted(&mut self, items: Vec<Value>) {
        self.input = WindowInput::Compacted(items);
        self.continuation = None;
    }

    #[must_use]
    pub fn is_compacted(&self) -> bool {
        matches!(self.input, WindowInput::Compacted(_))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match &self.input {
            WindowInput::Messages(messages) => messages.len(),
            WindowInput::Compacted(items) => items.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent user turn, used when resuming from a continuation token.
    #[must_use]
    pub fn last_user_message(&self) -> Option<ChatMessage> {
        match &self.input {
            WindowInput::Messages(messages) => messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .cloned(),
            WindowInput::Compacted(items) => items
                .iter()
                .rev()
                .find(|item| item.get("role").and_then(Value::as_str) == Some("user"))
                .and_then(|item| item.get("content").and_then(Value::as_str))
                .map(ChatMessage::user),
        }
    }
}

// ============================================================================
// Tool Calling Types
// ============================================================================

/// Definition of a function tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A finalized tool call awaiting a result.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    /// Build a call from accumulated argument text. Malformed or empty
    /// argument JSON becomes an empty object.
    pub fn from_raw_arguments(
        call_id: impl Into<String>,
        name: impl Into<String>,
        raw: &str,
    ) -> Self {
        let arguments = match serde_json::from_str::<Value>(raw) {
            Ok(value @ Value::Object(_)) => value,
            _ => Value::Object(serde_json::Map::new()),
        };
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        }
    }
}

// ============================================================================
// Chat Configuration
// ============================================================================

pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 32;

/// Per-turn request settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub model: String,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// When set, a retrieval tool over this knowledge store is attached.
    pub knowledge_store_id: Option<String>,
    /// Continuation token from the previous completed response.
    pub previous_response_id: Option<String>,
    pub tools: Vec<ToolDefinition>,
    /// Upper bound on tool-call round trips within one `send`.
    pub max_tool_rounds: u32,
}

impl ChatConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            reasoning_effort: None,
            knowledge_store_id: None,
            previous_response_id: None,
            tools: Vec::new(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    #[must_use]
    pub fn with_reasoning_effort(mut self, effort: Option<ReasoningEffort>) -> Self {
        self.reasoning_effort = effort;
        self
    }

    #[must_use]
    pub fn with_knowledge_store(mut self, store_id: Option<String>) -> Self {
        self.knowledge_store_id = store_id.filter(|id| !id.is_empty());
        self
    }

    #[must_use]
    pub fn with_previous_response(mut self, id: Option<String>) -> Self {
        self.previous_response_id = id.filter(|id| !id.is_empty());
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }
}

// ============================================================================
// Streaming Events
// ============================================================================

/// Token consumption for one or more responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub reasoning_tokens: u32,
}

impl Usage {
    #[must_use]
    pub const fn new(input_tokens: u32, output_tokens: u32, reasoning_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            reasoning_tokens,
        }
    }

    pub fn accumulate(&mut self, other: Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.reasoning_tokens = self.reasoning_tokens.saturating_add(other.reasoning_tokens);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Normalized stream event, independent of provider wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Response created; carries the continuation token.
    Created { id: String },
    TextDelta(String),
    ToolCallStarted { call_id: String, name: String },
    ToolCallArgsDelta(String),
    ToolCallDone {
        call_id: String,
        name: String,
        arguments: String,
    },
    Usage(Usage),
    Error(String),
    Completed,
}

/// Outcome of one `send`. Created fresh per call and never retained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamResult {
    /// Continuation token of the last completed response.
    pub response_id: Option<String>,
    /// Usage summed across every tool-loop iteration.
    pub usage: Usage,
    /// Input tokens of the final request: how full the context window is now.
    pub last_input_tokens: u32,
    pub cancelled: bool,
}

impl StreamResult {
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_falls_back_to_empty_object() {
        let call = ToolCall::from_raw_arguments("c1", "lookup", "{\"q\": \"x\"");
        assert_eq!(call.arguments, json!({}));

        let call = ToolCall::from_raw_arguments("c1", "lookup", "");
        assert_eq!(call.arguments, json!({}));

        let call = ToolCall::from_raw_arguments("c1", "lookup", "{\"q\":\"x\"}");
        assert_eq!(call.arguments, json!({"q": "x"}));
    }

    #[test]
    fn usage_accumulates_additively() {
        let mut total = Usage::new(10, 5, 1);
        total.accumulate(Usage::new(20, 7, 2));
        assert_eq!(total, Usage::new(30, 12, 3));
    }

    #[test]
    fn last_user_message_skips_assistant_turns() {
        let mut window = ConversationWindow::new();
        window.push_user("first");
        window.push_assistant("reply");
        window.push_user("second");
        window.push_assistant("reply two");
        assert_eq!(window.last_user_message().unwrap().content, "second");
    }

    #[test]
    fn compaction_clears_continuation_and_accepts_new_turns() {
        let mut window = ConversationWindow::new();
        window.push_user("hello");
        window.set_continuation(Some("resp_1".to_string()));

        window.replace_with_compacted(vec![json!({"type": "compaction", "encrypted_content": "x"})]);
        assert!(window.is_compacted());
        assert_eq!(window.continuation(), None);

        window.push_user("next");
        assert_eq!(window.len(), 2);
        assert_eq!(window.last_user_message().unwrap().content, "next");
    }

    #[test]
    fn empty_continuation_is_treated_as_absent() {
        let mut window = ConversationWindow::new();
        window.set_continuation(Some(String::new()));
        assert_eq!(window.continuation(), None);
    }
}

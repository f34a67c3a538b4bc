//! Canonical conversation messages.
//!
//! A [`Message`] is the provider-agnostic unit of history. Assistant messages
//! may carry [`ToolCall`]s; every `tool` message answers exactly one of them
//! through `tool_call_id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::ToolCallId;

// ─────────────────────────────────────────────────────────────────────────────
// Roles and content
// ─────────────────────────────────────────────────────────────────────────────

/// Author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End user.
    User,
    /// Model output.
    Assistant,
    /// Result of a tool invocation.
    Tool,
}

impl Role {
    /// Wire name of the role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// One typed piece of multi-part content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Image reference (remote URL or `data:` URL).
    Image {
        /// Location of the image.
        url: String,
        /// MIME type when known.
        #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl ContentPart {
    /// Text part shorthand.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Message content: plain text or an ordered list of parts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text.
    Text(String),
    /// Ordered typed parts.
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl MessageContent {
    /// Concatenated text of all text parts.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// True when there is no text and no image.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }

    /// Content as a list of parts.
    #[must_use]
    pub fn parts(&self) -> Vec<ContentPart> {
        match self {
            Self::Text(text) if text.is_empty() => Vec::new(),
            Self::Text(text) => vec![ContentPart::text(text.clone())],
            Self::Parts(parts) => parts.clone(),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool calls and outputs
// ─────────────────────────────────────────────────────────────────────────────

/// A tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Call identifier echoed back by the matching tool message.
    pub id: ToolCallId,
    /// Position of the call within its assistant turn.
    #[serde(default)]
    pub index: u32,
    /// Tool name.
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
    /// Characters of assistant text that preceded this call.
    #[serde(default)]
    pub text_offset: usize,
}

impl ToolCall {
    /// Decode the arguments as a JSON object. Non-object JSON yields `None`.
    #[must_use]
    pub fn arguments_map(&self) -> Option<Map<String, Value>> {
        match serde_json::from_str::<Value>(&self.arguments) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// Same id, name and arguments; positional metadata is ignored.
    #[must_use]
    pub fn same_call(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name && self.arguments == other.arguments
    }
}

/// Outcome of a tool invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// The tool returned normally.
    Success,
    /// The tool raised an error.
    Error,
    /// The tool exceeded its time budget.
    Timeout,
}

/// Result of executing one [`ToolCall`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    /// The call this output answers.
    pub tool_call_id: ToolCallId,
    /// Text fed back to the model.
    pub output: String,
    /// Execution status.
    pub status: ToolStatus,
}

impl ToolOutput {
    /// Successful output.
    #[must_use]
    pub fn success(tool_call_id: ToolCallId, output: impl Into<String>) -> Self {
        Self {
            tool_call_id,
            output: output.into(),
            status: ToolStatus::Success,
        }
    }

    /// Failed output, formatted as `"<tool> failed: <message>"`.
    #[must_use]
    pub fn failure(tool_call_id: ToolCallId, tool_name: &str, message: &str) -> Self {
        Self {
            tool_call_id,
            output: format!("{tool_name} failed: {message}"),
            status: ToolStatus::Error,
        }
    }

    /// Output for a tool that ran out of time.
    #[must_use]
    pub fn timeout(tool_call_id: ToolCallId, tool_name: &str, after_ms: u64) -> Self {
        Self {
            tool_call_id,
            output: format!("{tool_name} timed out after {after_ms}ms"),
            status: ToolStatus::Timeout,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message
// ─────────────────────────────────────────────────────────────────────────────

/// A canonical conversation message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Author.
    pub role: Role,
    /// Text or parts.
    #[serde(default)]
    pub content: MessageContent,
    /// Tool calls requested in this (assistant) message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For `tool` messages, the call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<ToolCallId>,
    /// Opaque reasoning blocks (signed thinking) produced with this
    /// assistant message, replayed to upstreams that require them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<Value>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            reasoning_details: None,
        }
    }

    /// System message.
    #[must_use]
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// User message.
    #[must_use]
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Assistant message without tool calls.
    #[must_use]
    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Assistant message carrying tool calls.
    #[must_use]
    pub fn assistant_with_tools(content: impl Into<MessageContent>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    /// Attach reasoning blocks.
    #[must_use]
    pub fn with_reasoning_details(mut self, details: Option<Value>) -> Self {
        self.reasoning_details = details;
        self
    }

    /// Tool message answering `output.tool_call_id`.
    #[must_use]
    pub fn tool(output: &ToolOutput) -> Self {
        Self {
            tool_call_id: Some(output.tool_call_id.clone()),
            ..Self::with_role(Role::Tool, output.output.clone())
        }
    }

    /// Concatenated text content.
    #[must_use]
    pub fn text(&self) -> String {
        self.content.text()
    }

    /// Whether two messages hold the same role and content.
    ///
    /// Tool calls count as content for assistant messages; their
    /// `index`/`text_offset` bookkeeping does not, and neither do
    /// reasoning blocks.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.role == other.role
            && self.content == other.content
            && self.tool_call_id == other.tool_call_id
            && self.tool_calls.len() == other.tool_calls.len()
            && self
                .tool_calls
                .iter()
                .zip(&other.tool_calls)
                .all(|(a, b)| a.same_call(b))
    }
}

/// Token usage reported by an upstream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    /// Input tokens.
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Output tokens.
    #[serde(default)]
    pub completion_tokens: u64,
    /// Sum reported by the upstream (or computed).
    #[serde(default)]
    pub total_tokens: u64,
    /// Reasoning tokens, when the upstream reports them separately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
}

impl Usage {
    /// Build usage, computing the total when the upstream omits it.
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: Option<u64>) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: total_tokens.unwrap_or(prompt_tokens + completion_tokens),
            reasoning_tokens: None,
        }
    }

    /// Attach a reasoning token count.
    #[must_use]
    pub fn with_reasoning_tokens(mut self, tokens: Option<u64>) -> Self {
        self.reasoning_tokens = tokens;
        self
    }

    /// Add another report's counts to this one.
    pub fn accumulate(&mut self, other: &Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.reasoning_tokens = match (self.reasoning_tokens, other.reasoning_tokens) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str, args: &str) -> ToolCall {
        ToolCall {
            id: ToolCallId::from(id),
            index: 0,
            name: "web_search".into(),
            arguments: args.into(),
            text_offset: 0,
        }
    }

    #[test]
    fn text_content_serializes_as_string() {
        let msg = Message::user("hi");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn parts_content_deserializes() {
        let msg: Message = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "look at "},
                {"type": "image", "url": "https://x/y.png"},
                {"type": "text", "text": "this"}
            ]
        }))
        .unwrap();
        assert_eq!(msg.text(), "look at this");
        assert_eq!(msg.content.parts().len(), 3);
    }

    #[test]
    fn tool_message_references_call() {
        let out = ToolOutput::success(ToolCallId::from("call_1"), "42");
        let msg = Message::tool(&out);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.text(), "42");
    }

    #[test]
    fn failure_output_format() {
        let out = ToolOutput::failure(ToolCallId::from("c"), "web_search", "boom");
        assert_eq!(out.output, "web_search failed: boom");
        assert_eq!(out.status, ToolStatus::Error);
    }

    #[test]
    fn same_content_ignores_offsets() {
        let mut a = call("c1", "{}");
        let b = call("c1", "{}");
        a.text_offset = 17;
        a.index = 3;
        let ma = Message::assistant_with_tools("x", vec![a]);
        let mb = Message::assistant_with_tools("x", vec![b]);
        assert!(ma.same_content(&mb));
    }

    #[test]
    fn same_content_detects_changed_arguments() {
        let ma = Message::assistant_with_tools("x", vec![call("c1", "{}")]);
        let mb = Message::assistant_with_tools("x", vec![call("c1", "{\"q\":1}")]);
        assert!(!ma.same_content(&mb));
    }

    #[test]
    fn arguments_map_requires_object() {
        assert!(call("c", "{\"a\":1}").arguments_map().is_some());
        assert!(call("c", "[1]").arguments_map().is_none());
        assert!(call("c", "{bad").arguments_map().is_none());
    }

    #[test]
    fn usage_total_computed_when_missing() {
        let usage = Usage::new(10, 5, None);
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(Usage::new(10, 5, Some(20)).total_tokens, 20);
    }

    #[test]
    fn usage_accumulates_across_reports() {
        let mut total = Usage::new(10, 5, None);
        total.accumulate(&Usage::new(20, 4, Some(30)).with_reasoning_tokens(Some(3)));
        assert_eq!(total, Usage::new(30, 9, Some(45)).with_reasoning_tokens(Some(3)));

        let mut plain = Usage::default();
        plain.accumulate(&Usage::new(1, 1, None));
        assert_eq!(plain.reasoning_tokens, None);
    }

    #[test]
    fn same_content_ignores_reasoning_blocks() {
        let plain = Message::assistant_with_tools("x", vec![call("c1", "{}")]);
        let signed = plain
            .clone()
            .with_reasoning_details(Some(json!([{"type": "thinking", "thinking": "hm", "signature": "s"}])));
        assert!(plain.same_content(&signed));
        assert_ne!(plain, signed);
    }
}

//! Canonical chat request.
//!
//! Common knobs are typed fields. Anything else the client sent is kept in
//! [`ChatRequest::extra`]; adapters forward only the keys on their own
//! allow-list, so bookkeeping fields never leak upstream.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::messages::Message;

/// A function the model may call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name.
    pub name: String,
    /// What the tool does.
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the arguments object.
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolSpec {
    /// Build a spec.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Tool selection mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    /// Model decides.
    Auto,
    /// Never call tools.
    None,
    /// Must call at least one tool.
    Required,
}

/// Tool choice: a mode or one named tool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// `"auto"`, `"none"` or `"required"`.
    Mode(ToolChoiceMode),
    /// Force a specific tool.
    Named {
        /// Tool name.
        name: String,
    },
}

/// Reasoning effort requested from reasoning-capable models.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    /// Smallest budget.
    Minimal,
    /// Low budget.
    Low,
    /// Medium budget.
    Medium,
    /// High budget.
    High,
}

impl ReasoningEffort {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Thinking-token budget for providers that take a budget instead of a level.
    #[must_use]
    pub fn budget_tokens(self) -> u32 {
        match self {
            Self::Minimal | Self::Low => 1024,
            Self::Medium => 4096,
            Self::High => 16_384,
        }
    }
}

/// Output verbosity for models that support it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Terse.
    Low,
    /// Default.
    Medium,
    /// Detailed.
    High,
}

impl Verbosity {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

fn default_stream() -> bool {
    true
}

/// Provider-agnostic chat completion request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Model; the provider default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Conversation so far.
    pub messages: Vec<Message>,
    /// Stream the response (default true).
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Tools offered to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    /// Tool selection.
    #[serde(default, alias = "tool_choice", skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling.
    #[serde(default, alias = "top_p", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Output token limit.
    #[serde(default, alias = "max_tokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Stop sequences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Reasoning effort (gated per model).
    #[serde(default, alias = "reasoning_effort", skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Verbosity (gated per model).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<Verbosity>,
    /// Chain onto a prior upstream response instead of resending history.
    #[serde(default, alias = "previous_response_id", skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    /// Everything else the client sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    /// Streaming request over `messages` with no extras.
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            messages,
            stream: true,
            tools: None,
            tool_choice: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            reasoning_effort: None,
            verbosity: None,
            previous_response_id: None,
            extra: Map::new(),
        }
    }

    /// Requested model, or `default` when none was given.
    #[must_use]
    pub fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.model.as_deref().filter(|m| !m.is_empty()).unwrap_or(default)
    }

    /// Extra parameters whose keys appear in `allow`.
    #[must_use]
    pub fn allowed_extras(&self, allow: &[&str]) -> Map<String, Value> {
        self.extra
            .iter()
            .filter(|(k, v)| allow.contains(&k.as_str()) && !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Non-empty tool list, if any.
    #[must_use]
    pub fn tool_specs(&self) -> Option<&[ToolSpec]> {
        self.tools.as_deref().filter(|t| !t.is_empty())
    }
}

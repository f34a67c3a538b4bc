//! Canonical stream events.
//!
//! [`CanonicalEvent`] is the vocabulary every provider adapter produces and
//! every consumer understands. Adapters emit `ToolCallDelta` fragments; the
//! orchestrator consolidates them into exactly one `ToolCall` per call before
//! anything reaches the client.
//!
//! On the wire each event is one SSE frame, `data: <json>\n\n`, and the
//! stream ends with `data: [DONE]\n\n`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::{ToolCall, ToolOutput, Usage};

/// SSE terminator frame.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// How an orchestration (or a single upstream turn) ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    /// Model finished normally.
    Completed,
    /// Stopped at the tool iteration cap.
    Truncated,
    /// Aborted by a stop request.
    Cancelled,
    /// Failed with a fatal error.
    Error,
}

impl CompletionStatus {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Truncated => "truncated",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

/// Provider-agnostic unit of streamed output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CanonicalEvent {
    /// Assistant text fragment.
    Text {
        /// Fragment.
        delta: String,
    },

    /// Reasoning/thinking fragment.
    Reasoning {
        /// Fragment.
        delta: String,
    },

    /// Partial tool call, keyed by `index`. Never forwarded to clients.
    ToolCallDelta {
        /// Upstream position of the call.
        index: u32,
        /// Call id, if this fragment carries it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Tool name, if this fragment carries it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Argument JSON fragment.
        #[serde(default)]
        arguments: String,
    },

    /// Consolidated tool call.
    ToolCall {
        /// The call.
        #[serde(rename = "toolCall")]
        tool_call: ToolCall,
    },

    /// Result of running a tool.
    ToolOutput {
        /// The output.
        output: ToolOutput,
    },

    /// Token usage.
    Usage {
        /// Counts.
        usage: Usage,
    },

    /// Out-of-band metadata seen mid-stream.
    ConversationMeta {
        /// Upstream response id (chainable for the Responses API).
        #[serde(default, rename = "responseId", skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        /// Opaque reasoning blocks to persist alongside the message.
        #[serde(default, rename = "reasoningDetails", skip_serializing_if = "Option::is_none")]
        reasoning_details: Option<Value>,
    },

    /// End of a turn (from adapters) or of the orchestration (from the orchestrator).
    Final {
        /// Full assistant text, set by the orchestrator.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// Upstream finish reason.
        #[serde(default, rename = "finishReason", skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
        /// Completion status.
        status: CompletionStatus,
    },

    /// Fatal error surfaced to the client.
    Error {
        /// Human-readable message.
        message: String,
        /// Whether retrying the request could succeed.
        retryable: bool,
    },

    /// Stream terminator.
    Done,
}

impl CanonicalEvent {
    /// Text delta shorthand.
    #[must_use]
    pub fn text(delta: impl Into<String>) -> Self {
        Self::Text { delta: delta.into() }
    }

    /// Reasoning delta shorthand.
    #[must_use]
    pub fn reasoning(delta: impl Into<String>) -> Self {
        Self::Reasoning { delta: delta.into() }
    }

    /// Adapter-level end of turn.
    #[must_use]
    pub fn finished(finish_reason: Option<String>) -> Self {
        Self::Final {
            content: None,
            finish_reason,
            status: CompletionStatus::Completed,
        }
    }

    /// Response id metadata.
    #[must_use]
    pub fn response_id(id: impl Into<String>) -> Self {
        Self::ConversationMeta {
            response_id: Some(id.into()),
            reasoning_details: None,
        }
    }

    /// Wire name of the event type.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Reasoning { .. } => "reasoning",
            Self::ToolCallDelta { .. } => "toolCallDelta",
            Self::ToolCall { .. } => "toolCall",
            Self::ToolOutput { .. } => "toolOutput",
            Self::Usage { .. } => "usage",
            Self::ConversationMeta { .. } => "conversationMeta",
            Self::Final { .. } => "final",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    /// Encode as one SSE frame. `Done` becomes the `[DONE]` terminator.
    pub fn to_sse_frame(&self) -> Result<String, serde_json::Error> {
        if matches!(self, Self::Done) {
            return Ok(DONE_FRAME.to_owned());
        }
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ToolCallId;
    use serde_json::json;

    #[test]
    fn text_frame_shape() {
        let frame = CanonicalEvent::text("hi").to_sse_frame().unwrap();
        assert_eq!(frame, "data: {\"type\":\"text\",\"delta\":\"hi\"}\n\n");
    }

    #[test]
    fn done_is_sentinel() {
        assert_eq!(CanonicalEvent::Done.to_sse_frame().unwrap(), "data: [DONE]\n\n");
    }

    #[test]
    fn tool_call_event_uses_camel_case() {
        let event = CanonicalEvent::ToolCall {
            tool_call: ToolCall {
                id: ToolCallId::from("call_1"),
                index: 0,
                name: "web_search".into(),
                arguments: "{}".into(),
                text_offset: 4,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "toolCall");
        assert_eq!(value["toolCall"]["textOffset"], 4);
    }

    #[test]
    fn final_event_round_trip() {
        let value = json!({"type": "final", "content": "ok", "status": "cancelled"});
        let event: CanonicalEvent = serde_json::from_value(value).unwrap();
        assert_eq!(
            event,
            CanonicalEvent::Final {
                content: Some("ok".into()),
                finish_reason: None,
                status: CompletionStatus::Cancelled,
            }
        );
        assert_eq!(event.kind(), "final");
    }

    #[test]
    fn meta_omits_empty_fields() {
        let value = serde_json::to_value(CanonicalEvent::response_id("resp_1")).unwrap();
        assert_eq!(value, json!({"type": "conversationMeta", "responseId": "resp_1"}));
    }
}

//! Tool-call delta accumulation.
//!
//! Upstreams stream tool calls as fragments keyed by `index`; the id may
//! arrive late or never. The accumulator records the assistant-text length
//! when an index is first seen (that becomes the call's `text_offset` and is
//! never updated), keeps the first non-empty name, and concatenates argument
//! fragments in arrival order.

use std::collections::BTreeMap;

use relay_core::ids::ToolCallId;
use relay_core::messages::ToolCall;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
    text_offset: usize,
}

/// Buffers tool-call deltas for one assistant turn.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialToolCall>,
}

impl ToolCallAccumulator {
    /// Empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one delta in. `text_len` is the assistant text length so far.
    pub fn apply(
        &mut self,
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: &str,
        text_len: usize,
    ) {
        let call = self.calls.entry(index).or_insert_with(|| PartialToolCall {
            text_offset: text_len,
            ..PartialToolCall::default()
        });
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            if call.id.is_none() {
                call.id = Some(id.to_owned());
            }
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            if call.name.is_empty() {
                call.name = name.to_owned();
            }
        }
        call.arguments.push_str(arguments);
    }

    /// Number of distinct indices seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no delta has been applied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Finalize into tool calls ordered by index.
    ///
    /// Missing ids are generated. Empty or invalid argument JSON becomes
    /// `"{}"`. Calls that never received a name are dropped.
    #[must_use]
    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter_map(|(index, partial)| {
                if partial.name.is_empty() {
                    warn!(index, "dropping tool call without a name");
                    return None;
                }
                let arguments = normalize_arguments(&partial.name, partial.arguments);
                Some(ToolCall {
                    id: partial.id.map_or_else(ToolCallId::new, ToolCallId::from),
                    index,
                    name: partial.name,
                    arguments,
                    text_offset: partial.text_offset,
                })
            })
            .collect()
    }
}

/// Validate accumulated argument JSON, failing open to `"{}"`.
pub fn normalize_arguments(tool_name: &str, arguments: String) -> String {
    let trimmed = arguments.trim();
    if trimmed.is_empty() {
        return "{}".to_owned();
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(_)) => arguments,
        Ok(other) => {
            warn!(tool_name, kind = json_kind(&other), "tool arguments are not an object, using {{}}");
            "{}".to_owned()
        }
        Err(e) => {
            warn!(
                tool_name,
                error = %e,
                preview = %relay_core::text::truncate_str(trimmed, 200),
                "invalid tool arguments JSON, using {{}}"
            );
            "{}".to_owned()
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

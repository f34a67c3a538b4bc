//! OpenAI adapters: Chat Completions and Responses.
//!
//! Both share credentials, base URL and model heuristics; they differ in
//! message shape and in stream vocabulary. Compatible third-party endpoints
//! use the Chat Completions adapter with a custom base URL.

pub mod chat;
pub mod responses;

pub use chat::OpenAiChatAdapter;
pub use responses::OpenAiResponsesAdapter;

use relay_core::messages::Usage;
use relay_core::request::{ToolChoice, ToolChoiceMode};
use serde_json::{Value, json};

use crate::adapter::u64_at;

/// Default API base.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
/// Model used when neither request nor settings name one.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Normalize a Chat (`prompt_tokens`) or Responses (`input_tokens`) usage block.
pub(crate) fn parse_usage(usage: &Value) -> Option<Usage> {
    if !usage.is_object() {
        return None;
    }
    let prompt = u64_at(usage, "prompt_tokens").or_else(|| u64_at(usage, "input_tokens"))?;
    let completion = u64_at(usage, "completion_tokens")
        .or_else(|| u64_at(usage, "output_tokens"))
        .unwrap_or(0);
    let reasoning = usage
        .get("completion_tokens_details")
        .or_else(|| usage.get("output_tokens_details"))
        .and_then(|d| u64_at(d, "reasoning_tokens"));
    Some(Usage::new(prompt, completion, u64_at(usage, "total_tokens")).with_reasoning_tokens(reasoning))
}

/// `"auto"`/`"none"`/`"required"` as-is; named tools in the family's shape.
pub(crate) fn tool_choice_value(choice: &ToolChoice, nested_function: bool) -> Value {
    match choice {
        ToolChoice::Mode(ToolChoiceMode::Auto) => json!("auto"),
        ToolChoice::Mode(ToolChoiceMode::None) => json!("none"),
        ToolChoice::Mode(ToolChoiceMode::Required) => json!("required"),
        ToolChoice::Named { name } if nested_function => {
            json!({"type": "function", "function": {"name": name}})
        }
        ToolChoice::Named { name } => json!({"type": "function", "name": name}),
    }
}

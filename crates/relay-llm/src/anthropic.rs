//! # Anthropic Messages Adapter
//!
//! Translates canonical requests to `POST /v1/messages` and the named SSE
//! events (`message_start`, `content_block_delta`, ...) back to canonical
//! events.
//!
//! - system messages are lifted into the top-level `system` string
//! - tool results become `tool_result` blocks inside a user turn; consecutive
//!   results share one turn
//! - extended thinking is enabled only for models that support it, and then
//!   sampling parameters are dropped
//! - signed thinking blocks are surfaced as reasoning details and replayed
//!   first in their assistant turn; thinking stays off when an assistant
//!   tool turn in the history has no signed block to replay

use relay_core::events::CanonicalEvent;
use relay_core::messages::{ContentPart, Message, MessageContent, Role, ToolCall, Usage};
use relay_core::provider::{ProviderSettings, ProviderType};
use relay_core::request::{ChatRequest, ToolChoice, ToolChoiceMode};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::adapter::{AuthScheme, ProviderAdapter, StreamState, UpstreamRequest, base_url, set_opt, str_at, u64_at};
use crate::models;
use crate::provider::ProviderResult;

/// Default API base.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
/// Model used when neither request nor settings name one.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
/// Pinned API version header value.
pub const API_VERSION: &str = "2023-06-01";
/// `max_tokens` is mandatory upstream; used when the client sends none.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

const ALLOWED_EXTRAS: &[&str] = &["top_k", "metadata"];

/// Anthropic Messages adapter.
#[derive(Clone, Debug)]
pub struct AnthropicAdapter {
    settings: ProviderSettings,
}

impl AnthropicAdapter {
    /// Build from settings.
    #[must_use]
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request conversion
// ─────────────────────────────────────────────────────────────────────────────

/// `data:<mime>;base64,<data>` becomes an inline source; anything else is a URL source.
fn image_source(url: &str, mime_type: Option<&str>) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(',') {
            let media_type = meta.strip_suffix(";base64").unwrap_or(meta);
            let media_type = if media_type.is_empty() {
                mime_type.unwrap_or("image/png")
            } else {
                media_type
            };
            return json!({"type": "base64", "media_type": media_type, "data": data});
        }
    }
    json!({"type": "url", "url": url})
}

fn content_blocks(content: &MessageContent) -> Vec<Value> {
    content
        .parts()
        .into_iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if text.is_empty() => None,
            ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
            ContentPart::Image { url, mime_type } => Some(json!({
                "type": "image",
                "source": image_source(&url, mime_type.as_deref()),
            })),
        })
        .collect()
}

fn tool_use_block(call: &ToolCall) -> Value {
    let input = call.arguments_map().map_or_else(|| json!({}), Value::Object);
    json!({"type": "tool_use", "id": call.id, "name": call.name, "input": input})
}

/// Signed `thinking` and `redacted_thinking` blocks stored on an assistant message.
fn thinking_blocks(msg: &Message) -> Vec<Value> {
    msg.reasoning_details
        .as_ref()
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|block| match block["type"].as_str() {
            Some("thinking") => str_at(block, "signature").map(|signature| {
                json!({
                    "type": "thinking",
                    "thinking": block["thinking"].as_str().unwrap_or_default(),
                    "signature": signature,
                })
            }),
            Some("redacted_thinking") => {
                str_at(block, "data").map(|data| json!({"type": "redacted_thinking", "data": data}))
            }
            _ => None,
        })
        .collect()
}

/// Every assistant tool turn can replay its thinking.
fn thinking_replayable(messages: &[Message]) -> bool {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
        .all(|m| !thinking_blocks(m).is_empty())
}

fn is_tool_result_turn(message: &Value) -> bool {
    message["role"] == "user"
        && message["content"]
            .as_array()
            .and_then(|blocks| blocks.first())
            .is_some_and(|b| b["type"] == "tool_result")
}

/// Split out the system prompt and convert the remaining turns.
fn convert_messages(messages: &[Message], replay_thinking: bool) -> (Option<String>, Vec<Value>) {
    let mut system: Vec<String> = Vec::new();
    let mut out: Vec<Value> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                let text = msg.text();
                if !text.is_empty() {
                    system.push(text);
                }
            }
            Role::User => match &msg.content {
                MessageContent::Text(text) => out.push(json!({"role": "user", "content": text})),
                MessageContent::Parts(_) => {
                    out.push(json!({"role": "user", "content": content_blocks(&msg.content)}));
                }
            },
            Role::Assistant => {
                let mut blocks = if replay_thinking { thinking_blocks(msg) } else { Vec::new() };
                blocks.extend(content_blocks(&msg.content));
                blocks.extend(msg.tool_calls.iter().map(tool_use_block));
                if blocks.is_empty() {
                    continue;
                }
                out.push(json!({"role": "assistant", "content": blocks}));
            }
            Role::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id,
                    "content": msg.text(),
                });
                match out.last_mut() {
                    Some(last) if is_tool_result_turn(last) => {
                        if let Some(blocks) = last["content"].as_array_mut() {
                            blocks.push(block);
                        }
                    }
                    _ => out.push(json!({"role": "user", "content": [block]})),
                }
            }
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, out)
}

fn tool_choice_value(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Mode(ToolChoiceMode::Auto) => json!({"type": "auto"}),
        ToolChoice::Mode(ToolChoiceMode::Required) => json!({"type": "any"}),
        ToolChoice::Mode(ToolChoiceMode::None) => json!({"type": "none"}),
        ToolChoice::Named { name } => json!({"type": "tool", "name": name}),
    }
}

fn parse_usage(usage: &Value) -> Option<Usage> {
    let input = u64_at(usage, "input_tokens");
    let output = u64_at(usage, "output_tokens");
    if input.is_none() && output.is_none() {
        return None;
    }
    Some(Usage::new(input.unwrap_or(0), output.unwrap_or(0), None))
}

/// Merge a later usage report into what the stream has seen so far.
fn merge_usage(held: Option<Usage>, update: &Value) -> Option<Usage> {
    let Some(prev) = held else {
        return parse_usage(update);
    };
    let input = u64_at(update, "input_tokens").unwrap_or(prev.prompt_tokens);
    let output = u64_at(update, "output_tokens").unwrap_or(prev.completion_tokens);
    Some(Usage::new(input, output, None))
}

fn reasoning_meta(block: Value) -> CanonicalEvent {
    CanonicalEvent::ConversationMeta {
        response_id: None,
        reasoning_details: Some(Value::Array(vec![block])),
    }
}

fn error_event(error: &Value) -> CanonicalEvent {
    let kind = error["type"].as_str().unwrap_or_default();
    CanonicalEvent::Error {
        message: str_at(error, "message").unwrap_or("upstream error").to_owned(),
        retryable: matches!(kind, "overloaded_error" | "api_error" | "rate_limit_error"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────────────────────────

impl ProviderAdapter for AnthropicAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    fn default_model(&self) -> &str {
        self.settings.default_model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    fn supports_reasoning_controls(&self, model: &str) -> bool {
        models::anthropic_supports_thinking(model)
    }

    fn auth_scheme(&self) -> AuthScheme {
        AuthScheme::Header("x-api-key")
    }

    fn translate_request(&self, request: &ChatRequest) -> ProviderResult<UpstreamRequest> {
        let model = request.model_or(self.default_model()).to_owned();
        let mut thinking_budget = request
            .reasoning_effort
            .filter(|_| self.supports_reasoning_controls(&model))
            .map(|effort| effort.budget_tokens());
        if thinking_budget.is_some() && !thinking_replayable(&request.messages) {
            debug!(model = %model, "assistant tool turn without signed thinking, thinking disabled");
            thinking_budget = None;
        }
        let (system, messages) = convert_messages(&request.messages, thinking_budget.is_some());

        let mut body = request.allowed_extras(ALLOWED_EXTRAS);
        let _ = body.insert("model".into(), json!(model));
        let _ = body.insert("messages".into(), Value::Array(messages));
        let _ = body.insert("stream".into(), json!(request.stream));
        set_opt(&mut body, "system", system);
        set_opt(&mut body, "stop_sequences", request.stop.as_ref());

        let mut max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        if let Some(budget) = thinking_budget {
            if max_tokens <= budget {
                max_tokens = budget + DEFAULT_MAX_TOKENS;
            }
            let _ = body.insert("thinking".into(), json!({"type": "enabled", "budget_tokens": budget}));
            let _ = body.remove("top_k");
        } else {
            set_opt(&mut body, "temperature", request.temperature);
            set_opt(&mut body, "top_p", request.top_p);
        }
        let _ = body.insert("max_tokens".into(), json!(max_tokens));

        if let Some(tools) = request.tool_specs() {
            let specs: Vec<Value> = tools
                .iter()
                .map(|t| json!({"name": t.name, "description": t.description, "input_schema": t.parameters}))
                .collect();
            let _ = body.insert("tools".into(), Value::Array(specs));
            set_opt(&mut body, "tool_choice", request.tool_choice.as_ref().map(tool_choice_value));
        }

        debug!(model = %model, thinking = thinking_budget.is_some(), "translated messages request");
        Ok(UpstreamRequest {
            url: format!("{}/v1/messages", base_url(&self.settings, DEFAULT_BASE_URL)),
            body: Value::Object(body),
            stream: request.stream,
            model,
            headers: vec![("anthropic-version", API_VERSION.to_owned())],
        })
    }

    fn translate_response(&self, body: &Value) -> Vec<CanonicalEvent> {
        let mut events = Vec::new();
        if let Some(id) = str_at(body, "id") {
            events.push(CanonicalEvent::response_id(id));
        }
        let mut next_index = 0u32;
        for block in body["content"].as_array().into_iter().flatten() {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(text) = str_at(block, "text") {
                        events.push(CanonicalEvent::text(text));
                    }
                }
                Some("thinking") => {
                    if let Some(text) = str_at(block, "thinking") {
                        events.push(CanonicalEvent::reasoning(text));
                    }
                    if block.get("signature").is_some() {
                        events.push(reasoning_meta(block.clone()));
                    }
                }
                Some("redacted_thinking") => events.push(reasoning_meta(block.clone())),
                Some("tool_use") => {
                    events.push(CanonicalEvent::ToolCallDelta {
                        index: next_index,
                        id: str_at(block, "id").map(str::to_owned),
                        name: str_at(block, "name").map(str::to_owned),
                        arguments: block.get("input").map_or_else(|| "{}".to_owned(), Value::to_string),
                    });
                    next_index += 1;
                }
                _ => {}
            }
        }
        if let Some(usage) = parse_usage(&body["usage"]) {
            events.push(CanonicalEvent::Usage { usage });
        }
        events.push(CanonicalEvent::finished(str_at(body, "stop_reason").map(str::to_owned)));
        events
    }

    fn translate_stream_chunk(
        &self,
        chunk: &Value,
        event: Option<&str>,
        state: &mut StreamState,
    ) -> Vec<CanonicalEvent> {
        let kind = event.or_else(|| chunk["type"].as_str()).unwrap_or_default();
        let mut events = Vec::new();
        match kind {
            "message_start" => {
                let message = &chunk["message"];
                state.usage = parse_usage(&message["usage"]);
                if let Some(id) = str_at(message, "id") {
                    state.response_id_seen = true;
                    events.push(CanonicalEvent::response_id(id));
                }
            }
            "content_block_start" => {
                let block = &chunk["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => {
                        let key = chunk["index"].to_string();
                        events.push(CanonicalEvent::ToolCallDelta {
                            index: state.tool_index_for(&key),
                            id: str_at(block, "id").map(str::to_owned),
                            name: str_at(block, "name").map(str::to_owned),
                            arguments: String::new(),
                        });
                    }
                    Some("thinking") => state.reasoning_text.clear(),
                    Some("redacted_thinking") => events.push(reasoning_meta(block.clone())),
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta = &chunk["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = str_at(delta, "text") {
                            events.push(CanonicalEvent::text(text));
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = str_at(delta, "thinking") {
                            state.reasoning_text.push_str(text);
                            events.push(CanonicalEvent::reasoning(text));
                        }
                    }
                    Some("signature_delta") => {
                        if let Some(signature) = str_at(delta, "signature") {
                            let thinking = std::mem::take(&mut state.reasoning_text);
                            events.push(reasoning_meta(
                                json!({"type": "thinking", "thinking": thinking, "signature": signature}),
                            ));
                        }
                    }
                    Some("input_json_delta") => {
                        let key = chunk["index"].to_string();
                        match state.existing_tool_index(&key) {
                            Some(index) => events.push(CanonicalEvent::ToolCallDelta {
                                index,
                                id: None,
                                name: None,
                                arguments: delta["partial_json"].as_str().unwrap_or_default().to_owned(),
                            }),
                            None => warn!(block = %key, "input delta for unknown tool_use block"),
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = str_at(&chunk["delta"], "stop_reason") {
                    state.finish_reason = Some(reason.to_owned());
                }
                state.usage = merge_usage(state.usage.take(), &chunk["usage"]);
            }
            "message_stop" => {
                if let Some(usage) = state.usage.take() {
                    events.push(CanonicalEvent::Usage { usage });
                }
                events.extend(state.final_event(None));
            }
            "error" => events.push(error_event(&chunk["error"])),
            _ => {}
        }
        events
    }
}

//! OpenAI Responses adapter (`/responses`).
//!
//! System messages become `instructions`; the rest of the history becomes
//! typed input items. Streams are named events (`response.created`,
//! `response.output_text.delta`, ...). Function calls are keyed by output
//! item id, which the adapter maps onto dense tool indices.

use relay_core::events::CanonicalEvent;
use relay_core::messages::{ContentPart, Message, MessageContent, Role};
use relay_core::provider::{ProviderSettings, ProviderType};
use relay_core::request::ChatRequest;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{DEFAULT_BASE_URL, DEFAULT_MODEL, parse_usage, tool_choice_value};
use crate::adapter::{AuthScheme, ProviderAdapter, StreamState, UpstreamRequest, base_url, set_opt, str_at};
use crate::models;
use crate::provider::ProviderResult;

const ALLOWED_EXTRAS: &[&str] = &[
    "parallel_tool_calls",
    "user",
    "metadata",
    "store",
    "truncation",
    "service_tier",
    "include",
];

/// Responses API adapter.
#[derive(Clone, Debug)]
pub struct OpenAiResponsesAdapter {
    settings: ProviderSettings,
}

impl OpenAiResponsesAdapter {
    /// Build from settings.
    #[must_use]
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }
}

fn input_content(content: &MessageContent, assistant: bool) -> Value {
    let text_type = if assistant { "output_text" } else { "input_text" };
    let parts: Vec<Value> = content
        .parts()
        .into_iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({"type": text_type, "text": text}),
            ContentPart::Image { url, .. } => json!({"type": "input_image", "image_url": url}),
        })
        .collect();
    Value::Array(parts)
}

fn input_items(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut instructions: Vec<String> = Vec::new();
    let mut items = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => instructions.push(msg.text()),
            Role::User => items.push(json!({
                "type": "message",
                "role": "user",
                "content": input_content(&msg.content, false),
            })),
            Role::Assistant => {
                if !msg.content.is_empty() {
                    items.push(json!({
                        "type": "message",
                        "role": "assistant",
                        "content": input_content(&msg.content, true),
                    }));
                }
                for call in &msg.tool_calls {
                    items.push(json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.name,
                        "arguments": call.arguments,
                    }));
                }
            }
            Role::Tool => items.push(json!({
                "type": "function_call_output",
                "call_id": msg.tool_call_id,
                "output": msg.text(),
            })),
        }
    }
    let instructions = instructions.into_iter().filter(|s| !s.is_empty()).collect::<Vec<_>>();
    let instructions = (!instructions.is_empty()).then(|| instructions.join("\n\n"));
    (instructions, items)
}

fn function_call_delta(item: &Value, state: &mut StreamState) -> Option<CanonicalEvent> {
    if item["type"] != "function_call" {
        return None;
    }
    let key = str_at(item, "id").or_else(|| str_at(item, "call_id"))?;
    let index = state.tool_index_for(key);
    Some(CanonicalEvent::ToolCallDelta {
        index,
        id: str_at(item, "call_id").map(str::to_owned),
        name: str_at(item, "name").map(str::to_owned),
        arguments: item["arguments"].as_str().unwrap_or_default().to_owned(),
    })
}

impl ProviderAdapter for OpenAiResponsesAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAi
    }

    fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    fn default_model(&self) -> &str {
        self.settings.default_model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    fn supports_reasoning_controls(&self, model: &str) -> bool {
        models::openai_supports_reasoning(model)
    }

    fn supports_response_chaining(&self) -> bool {
        true
    }

    fn auth_scheme(&self) -> AuthScheme {
        AuthScheme::Bearer
    }

    fn translate_request(&self, request: &ChatRequest) -> ProviderResult<UpstreamRequest> {
        let model = request.model_or(self.default_model()).to_owned();
        let reasoning = self.supports_reasoning_controls(&model);
        let (instructions, input) = input_items(&request.messages);

        let mut body = request.allowed_extras(ALLOWED_EXTRAS);
        let _ = body.insert("model".into(), json!(model));
        let _ = body.insert("input".into(), Value::Array(input));
        let _ = body.insert("stream".into(), json!(request.stream));
        set_opt(&mut body, "instructions", instructions);
        set_opt(&mut body, "previous_response_id", request.previous_response_id.as_deref());
        set_opt(&mut body, "max_output_tokens", request.max_tokens);

        if let Some(tools) = request.tool_specs() {
            let specs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            let _ = body.insert("tools".into(), Value::Array(specs));
            set_opt(&mut body, "tool_choice", request.tool_choice.as_ref().map(|c| tool_choice_value(c, false)));
        } else {
            let _ = body.remove("parallel_tool_calls");
        }

        if reasoning {
            if let Some(effort) = request.reasoning_effort {
                let _ = body.insert("reasoning".into(), json!({"effort": effort.as_str(), "summary": "auto"}));
            }
            if let Some(verbosity) = request.verbosity.filter(|_| models::openai_supports_verbosity(&model)) {
                let _ = body.insert("text".into(), json!({"verbosity": verbosity.as_str()}));
            }
        } else {
            set_opt(&mut body, "temperature", request.temperature);
            set_opt(&mut body, "top_p", request.top_p);
        }

        debug!(model = %model, chained = request.previous_response_id.is_some(), "translated responses request");
        Ok(UpstreamRequest {
            url: format!("{}/responses", base_url(&self.settings, DEFAULT_BASE_URL)),
            body: Value::Object(body),
            stream: request.stream,
            model,
            headers: Vec::new(),
        })
    }

    fn translate_response(&self, body: &Value) -> Vec<CanonicalEvent> {
        let mut events = Vec::new();
        let mut state = StreamState::default();
        if let Some(id) = str_at(body, "id") {
            events.push(CanonicalEvent::response_id(id));
        }
        for item in body["output"].as_array().into_iter().flatten() {
            match item["type"].as_str() {
                Some("message") => {
                    for part in item["content"].as_array().into_iter().flatten() {
                        if let Some(text) = str_at(part, "text") {
                            events.push(CanonicalEvent::text(text));
                        }
                    }
                }
                Some("reasoning") => {
                    for part in item["summary"].as_array().into_iter().flatten() {
                        if let Some(text) = str_at(part, "text") {
                            events.push(CanonicalEvent::reasoning(text));
                        }
                    }
                }
                _ => events.extend(function_call_delta(item, &mut state)),
            }
        }
        if let Some(usage) = parse_usage(&body["usage"]) {
            events.push(CanonicalEvent::Usage { usage });
        }
        events.push(CanonicalEvent::finished(finish_reason(body)));
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
            "response.created" => {
                if let Some(id) = str_at(&chunk["response"], "id").filter(|_| !state.response_id_seen) {
                    state.response_id_seen = true;
                    events.push(CanonicalEvent::response_id(id));
                }
            }
            "response.output_text.delta" => {
                if let Some(delta) = str_at(chunk, "delta") {
                    events.push(CanonicalEvent::text(delta));
                }
            }
            "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
                if let Some(delta) = str_at(chunk, "delta") {
                    events.push(CanonicalEvent::reasoning(delta));
                }
            }
            "response.output_item.added" => {
                events.extend(function_call_delta(&chunk["item"], state));
            }
            "response.function_call_arguments.delta" => {
                let Some(item_id) = str_at(chunk, "item_id") else {
                    return events;
                };
                match state.existing_tool_index(item_id) {
                    Some(index) => events.push(CanonicalEvent::ToolCallDelta {
                        index,
                        id: None,
                        name: None,
                        arguments: chunk["delta"].as_str().unwrap_or_default().to_owned(),
                    }),
                    None => warn!(item_id, "arguments delta for unknown function call"),
                }
            }
            "response.output_item.done" => {
                let item = &chunk["item"];
                if item["type"] == "reasoning" {
                    events.push(CanonicalEvent::ConversationMeta {
                        response_id: None,
                        reasoning_details: Some(item.clone()),
                    });
                }
            }
            "response.completed" | "response.incomplete" => {
                let response = &chunk["response"];
                if let Some(usage) = parse_usage(&response["usage"]) {
                    events.push(CanonicalEvent::Usage { usage });
                }
                if let Some(id) = str_at(response, "id").filter(|_| !state.response_id_seen) {
                    state.response_id_seen = true;
                    events.push(CanonicalEvent::response_id(id));
                }
                events.extend(state.final_event(finish_reason(response)));
            }
            "response.failed" | "error" => {
                let message = str_at(&chunk["response"]["error"], "message")
                    .or_else(|| str_at(chunk, "message"))
                    .or_else(|| str_at(&chunk["error"], "message"))
                    .unwrap_or("response failed");
                events.push(CanonicalEvent::Error {
                    message: message.to_owned(),
                    retryable: false,
                });
            }
            _ => {}
        }
        events
    }
}

/// `incomplete_details.reason` for truncated responses, `"stop"` otherwise.
fn finish_reason(response: &Value) -> Option<String> {
    match response["status"].as_str() {
        Some("incomplete") => Some(
            str_at(&response["incomplete_details"], "reason")
                .unwrap_or("length")
                .to_owned(),
        ),
        Some("completed") => Some("stop".to_owned()),
        _ => None,
    }
}

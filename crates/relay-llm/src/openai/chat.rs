//! OpenAI Chat Completions adapter (`/chat/completions`).
//!
//! Streaming frames carry `choices[0].delta` with `content`,
//! `reasoning_content` (or `reasoning`) and index-keyed `tool_calls`
//! fragments. Usage arrives in a trailing chunk with empty `choices`.

use relay_core::events::CanonicalEvent;
use relay_core::messages::{ContentPart, Message, MessageContent, Role};
use relay_core::provider::{ProviderSettings, ProviderType};
use relay_core::request::ChatRequest;
use serde_json::{Map, Value, json};
use tracing::debug;

use super::{DEFAULT_BASE_URL, DEFAULT_MODEL, parse_usage, tool_choice_value};
use crate::adapter::{AuthScheme, ProviderAdapter, StreamState, UpstreamRequest, base_url, set_opt, str_at};
use crate::models;
use crate::provider::ProviderResult;

/// Optional client parameters forwarded verbatim.
const ALLOWED_EXTRAS: &[&str] = &[
    "seed",
    "presence_penalty",
    "frequency_penalty",
    "logit_bias",
    "logprobs",
    "top_logprobs",
    "user",
    "parallel_tool_calls",
    "response_format",
    "service_tier",
    "metadata",
];

/// Chat Completions adapter.
#[derive(Clone, Debug)]
pub struct OpenAiChatAdapter {
    settings: ProviderSettings,
}

impl OpenAiChatAdapter {
    /// Build from settings.
    #[must_use]
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }
}

fn content_value(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Parts(parts) => Value::Array(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::Image { url, .. } => {
                        json!({"type": "image_url", "image_url": {"url": url}})
                    }
                })
                .collect(),
        ),
    }
}

fn message_value(msg: &Message) -> Value {
    match msg.role {
        Role::System | Role::User => json!({
            "role": msg.role.as_str(),
            "content": content_value(&msg.content),
        }),
        Role::Assistant => {
            let mut out = Map::new();
            let _ = out.insert("role".into(), json!("assistant"));
            let content = if msg.content.is_empty() && !msg.tool_calls.is_empty() {
                Value::Null
            } else {
                Value::String(msg.text())
            };
            let _ = out.insert("content".into(), content);
            if !msg.tool_calls.is_empty() {
                let calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {"name": c.name, "arguments": c.arguments},
                        })
                    })
                    .collect();
                let _ = out.insert("tool_calls".into(), Value::Array(calls));
            }
            Value::Object(out)
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id,
            "content": msg.text(),
        }),
    }
}

impl ProviderAdapter for OpenAiChatAdapter {
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

    fn auth_scheme(&self) -> AuthScheme {
        AuthScheme::Bearer
    }

    fn translate_request(&self, request: &ChatRequest) -> ProviderResult<UpstreamRequest> {
        let model = request.model_or(self.default_model()).to_owned();
        let reasoning = self.supports_reasoning_controls(&model);

        let mut body = request.allowed_extras(ALLOWED_EXTRAS);
        let _ = body.insert("model".into(), json!(model));
        let messages: Vec<Value> = request.messages.iter().map(message_value).collect();
        let _ = body.insert("messages".into(), Value::Array(messages));
        let _ = body.insert("stream".into(), json!(request.stream));
        if request.stream {
            let _ = body.insert("stream_options".into(), json!({"include_usage": true}));
        }

        if let Some(tools) = request.tool_specs().filter(|_| self.supports_tools()) {
            let specs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            let _ = body.insert("tools".into(), Value::Array(specs));
            set_opt(&mut body, "tool_choice", request.tool_choice.as_ref().map(|c| tool_choice_value(c, true)));
        } else {
            let _ = body.remove("parallel_tool_calls");
        }

        set_opt(&mut body, "stop", request.stop.as_ref());
        if reasoning {
            // Reasoning models reject sampling parameters and `max_tokens`.
            set_opt(&mut body, "max_completion_tokens", request.max_tokens);
            set_opt(&mut body, "reasoning_effort", request.reasoning_effort.map(|e| e.as_str()));
            if models::openai_supports_verbosity(&model) {
                set_opt(&mut body, "verbosity", request.verbosity.map(|v| v.as_str()));
            }
            let _ = body.remove("logprobs");
            let _ = body.remove("top_logprobs");
        } else {
            set_opt(&mut body, "temperature", request.temperature);
            set_opt(&mut body, "top_p", request.top_p);
            set_opt(&mut body, "max_tokens", request.max_tokens);
        }

        debug!(model = %model, stream = request.stream, reasoning, "translated chat completions request");
        Ok(UpstreamRequest {
            url: format!("{}/chat/completions", base_url(&self.settings, DEFAULT_BASE_URL)),
            body: Value::Object(body),
            stream: request.stream,
            model,
            headers: Vec::new(),
        })
    }

    fn translate_response(&self, body: &Value) -> Vec<CanonicalEvent> {
        let mut events = Vec::new();
        let choice = &body["choices"][0];
        let message = &choice["message"];

        if let Some(reasoning) = str_at(message, "reasoning_content").or_else(|| str_at(message, "reasoning")) {
            events.push(CanonicalEvent::reasoning(reasoning));
        }
        if let Some(text) = str_at(message, "content") {
            events.push(CanonicalEvent::text(text));
        }
        if let Some(calls) = message["tool_calls"].as_array() {
            for (position, call) in calls.iter().enumerate() {
                events.push(CanonicalEvent::ToolCallDelta {
                    index: u32::try_from(position).unwrap_or(u32::MAX),
                    id: str_at(call, "id").map(str::to_owned),
                    name: str_at(&call["function"], "name").map(str::to_owned),
                    arguments: call["function"]["arguments"].as_str().unwrap_or_default().to_owned(),
                });
            }
        }
        if let Some(usage) = parse_usage(&body["usage"]) {
            events.push(CanonicalEvent::Usage { usage });
        }
        events.push(CanonicalEvent::finished(str_at(choice, "finish_reason").map(str::to_owned)));
        events
    }

    fn translate_stream_chunk(
        &self,
        chunk: &Value,
        _event: Option<&str>,
        state: &mut StreamState,
    ) -> Vec<CanonicalEvent> {
        let mut events = Vec::new();

        if let Some(message) = chunk["error"]["message"].as_str() {
            events.push(CanonicalEvent::Error {
                message: message.to_owned(),
                retryable: false,
            });
            return events;
        }

        let choice = &chunk["choices"][0];
        let delta = &choice["delta"];

        if let Some(reasoning) = str_at(delta, "reasoning_content").or_else(|| str_at(delta, "reasoning")) {
            events.push(CanonicalEvent::reasoning(reasoning));
        }
        if let Some(details) = delta.get("reasoning_details").filter(|d| d.as_array().is_some_and(|a| !a.is_empty())) {
            events.push(CanonicalEvent::ConversationMeta {
                response_id: None,
                reasoning_details: Some(details.clone()),
            });
        }
        if let Some(text) = str_at(delta, "content") {
            events.push(CanonicalEvent::text(text));
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for (position, call) in calls.iter().enumerate() {
                let index = call["index"]
                    .as_u64()
                    .and_then(|i| u32::try_from(i).ok())
                    .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX));
                events.push(CanonicalEvent::ToolCallDelta {
                    index,
                    id: str_at(call, "id").map(str::to_owned),
                    name: str_at(&call["function"], "name").map(str::to_owned),
                    arguments: call["function"]["arguments"].as_str().unwrap_or_default().to_owned(),
                });
            }
        }
        if let Some(reason) = str_at(choice, "finish_reason") {
            state.finish_reason = Some(reason.to_owned());
        }
        if let Some(usage) = parse_usage(&chunk["usage"]) {
            events.push(CanonicalEvent::Usage { usage });
        }
        events
    }
}

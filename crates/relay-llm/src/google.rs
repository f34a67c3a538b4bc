//! # Gemini Adapter
//!
//! `generateContent` / `streamGenerateContent?alt=sse`. The model and the
//! streaming mode live in the URL, not the body. Every stream frame is a
//! complete `GenerateContentResponse` slice; function calls arrive whole, so
//! each one gets a fresh tool index.

use std::collections::HashMap;

use relay_core::events::CanonicalEvent;
use relay_core::messages::{ContentPart, Message, MessageContent, Role, Usage};
use relay_core::provider::{ProviderSettings, ProviderType};
use relay_core::request::{ChatRequest, ToolChoice, ToolChoiceMode};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::adapter::{AuthScheme, ProviderAdapter, StreamState, UpstreamRequest, base_url, set_opt, str_at, u64_at};
use crate::error_parsing::parse_retry_delay;
use crate::models;
use crate::provider::ProviderResult;

/// Default API base.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
/// Model used when neither request nor settings name one.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Schema keywords the function-declaration dialect rejects.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "additionalProperties"];

/// Gemini adapter.
#[derive(Clone, Debug)]
pub struct GoogleAdapter {
    settings: ProviderSettings,
}

impl GoogleAdapter {
    /// Build from settings.
    #[must_use]
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }
}

/// Drop schema keywords Gemini refuses, recursively.
fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), sanitize_schema(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn image_part(url: &str, mime_type: Option<&str>) -> Value {
    if let Some((meta, data)) = url.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
        let mime = meta.strip_suffix(";base64").unwrap_or(meta);
        let mime = if mime.is_empty() { mime_type.unwrap_or("image/png") } else { mime };
        return json!({"inlineData": {"mimeType": mime, "data": data}});
    }
    json!({"fileData": {"mimeType": mime_type.unwrap_or("image/jpeg"), "fileUri": url}})
}

fn parts(content: &MessageContent) -> Vec<Value> {
    content
        .parts()
        .into_iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if text.is_empty() => None,
            ContentPart::Text { text } => Some(json!({"text": text})),
            ContentPart::Image { url, mime_type } => Some(image_part(&url, mime_type.as_deref())),
        })
        .collect()
}

fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Vec<String> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    // Function responses carry the tool name, not the call id.
    let mut names: HashMap<&str, &str> = HashMap::new();
    let mut last_was_tool = false;

    for msg in messages {
        let is_tool = msg.role == Role::Tool;
        match msg.role {
            Role::System => {
                let text = msg.text();
                if !text.is_empty() {
                    system.push(text);
                }
            }
            Role::User => contents.push(json!({"role": "user", "parts": parts(&msg.content)})),
            Role::Assistant => {
                let mut out = parts(&msg.content);
                for call in &msg.tool_calls {
                    let _ = names.insert(call.id.as_str(), call.name.as_str());
                    let args = call.arguments_map().map_or_else(|| json!({}), Value::Object);
                    out.push(json!({"functionCall": {"name": call.name, "args": args}}));
                }
                if !out.is_empty() {
                    contents.push(json!({"role": "model", "parts": out}));
                }
            }
            Role::Tool => {
                let id = msg.tool_call_id.as_ref().map(|id| id.as_str()).unwrap_or_default();
                let name = names.get(id).copied().unwrap_or(id);
                let part = json!({
                    "functionResponse": {"name": name, "response": {"output": msg.text()}}
                });
                match contents.last_mut().filter(|_| last_was_tool) {
                    Some(last) => {
                        if let Some(existing) = last["parts"].as_array_mut() {
                            existing.push(part);
                        }
                    }
                    None => contents.push(json!({"role": "user", "parts": [part]})),
                }
            }
        }
        last_was_tool = is_tool;
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, contents)
}

fn tool_config(choice: &ToolChoice) -> Value {
    let config = match choice {
        ToolChoice::Mode(ToolChoiceMode::Auto) => json!({"mode": "AUTO"}),
        ToolChoice::Mode(ToolChoiceMode::Required) => json!({"mode": "ANY"}),
        ToolChoice::Mode(ToolChoiceMode::None) => json!({"mode": "NONE"}),
        ToolChoice::Named { name } => json!({"mode": "ANY", "allowedFunctionNames": [name]}),
    };
    json!({"functionCallingConfig": config})
}

fn parse_usage(meta: &Value) -> Option<Usage> {
    let prompt = u64_at(meta, "promptTokenCount")?;
    let completion = u64_at(meta, "candidatesTokenCount").unwrap_or(0);
    Some(Usage::new(prompt, completion, u64_at(meta, "totalTokenCount")).with_reasoning_tokens(u64_at(meta, "thoughtsTokenCount")))
}

fn extra<'a>(request: &'a ChatRequest, snake: &str, camel: &str) -> Option<&'a Value> {
    request.extra.get(snake).or_else(|| request.extra.get(camel))
}

impl ProviderAdapter for GoogleAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Google
    }

    fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    fn default_model(&self) -> &str {
        self.settings.default_model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    fn supports_reasoning_controls(&self, model: &str) -> bool {
        models::gemini_supports_thinking(model)
    }

    fn auth_scheme(&self) -> AuthScheme {
        AuthScheme::Header("x-goog-api-key")
    }

    fn translate_request(&self, request: &ChatRequest) -> ProviderResult<UpstreamRequest> {
        let model = request.model_or(self.default_model()).to_owned();
        let model_path = model.strip_prefix("models/").unwrap_or(&model);
        let (system, contents) = convert_messages(&request.messages);

        let mut body = Map::new();
        let _ = body.insert("contents".into(), Value::Array(contents));
        if let Some(system) = system {
            let _ = body.insert("systemInstruction".into(), json!({"parts": [{"text": system}]}));
        }

        if let Some(tools) = request.tool_specs() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": sanitize_schema(&t.parameters),
                    })
                })
                .collect();
            let _ = body.insert("tools".into(), json!([{"functionDeclarations": declarations}]));
            set_opt(&mut body, "toolConfig", request.tool_choice.as_ref().map(tool_config));
        }

        let mut generation = Map::new();
        set_opt(&mut generation, "temperature", request.temperature);
        set_opt(&mut generation, "topP", request.top_p);
        set_opt(&mut generation, "maxOutputTokens", request.max_tokens);
        set_opt(&mut generation, "stopSequences", request.stop.as_ref());
        set_opt(&mut generation, "topK", extra(request, "top_k", "topK"));
        set_opt(&mut generation, "seed", extra(request, "seed", "seed"));
        if let Some(effort) = request.reasoning_effort.filter(|_| self.supports_reasoning_controls(&model)) {
            let _ = generation.insert(
                "thinkingConfig".into(),
                json!({"thinkingBudget": effort.budget_tokens(), "includeThoughts": true}),
            );
        }
        if !generation.is_empty() {
            let _ = body.insert("generationConfig".into(), Value::Object(generation));
        }

        let base = base_url(&self.settings, DEFAULT_BASE_URL);
        let url = if request.stream {
            format!("{base}/models/{model_path}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}/models/{model_path}:generateContent")
        };
        debug!(model = %model, stream = request.stream, "translated generateContent request");
        Ok(UpstreamRequest {
            url,
            body: Value::Object(body),
            stream: request.stream,
            model,
            headers: Vec::new(),
        })
    }

    fn translate_response(&self, body: &Value) -> Vec<CanonicalEvent> {
        let mut state = StreamState::default();
        let mut events = self.translate_stream_chunk(body, None, &mut state);
        events.extend(self.finish_stream(&mut state));
        events
    }

    fn translate_stream_chunk(
        &self,
        chunk: &Value,
        _event: Option<&str>,
        state: &mut StreamState,
    ) -> Vec<CanonicalEvent> {
        let mut events = Vec::new();

        if let Some(message) = str_at(&chunk["error"], "message") {
            events.push(CanonicalEvent::Error {
                message: message.to_owned(),
                retryable: chunk["error"]["code"].as_u64().is_some_and(|c| c == 429 || c >= 500),
            });
            return events;
        }
        if let Some(reason) = str_at(&chunk["promptFeedback"], "blockReason") {
            events.push(CanonicalEvent::Error {
                message: format!("prompt blocked: {reason}"),
                retryable: false,
            });
            return events;
        }

        if let Some(id) = str_at(chunk, "responseId").filter(|_| !state.response_id_seen) {
            state.response_id_seen = true;
            events.push(CanonicalEvent::response_id(id));
        }
        if let Some(usage) = parse_usage(&chunk["usageMetadata"]) {
            state.usage = Some(usage);
        }

        let candidate = &chunk["candidates"][0];
        for part in candidate["content"]["parts"].as_array().into_iter().flatten() {
            if let Some(call) = part.get("functionCall") {
                events.push(CanonicalEvent::ToolCallDelta {
                    index: state.allocate_tool_index(),
                    id: str_at(call, "id").map(str::to_owned),
                    name: str_at(call, "name").map(str::to_owned),
                    arguments: call.get("args").map_or_else(|| "{}".to_owned(), Value::to_string),
                });
            } else if let Some(text) = str_at(part, "text") {
                if part["thought"].as_bool() == Some(true) {
                    events.push(CanonicalEvent::reasoning(text));
                } else {
                    events.push(CanonicalEvent::text(text));
                }
            }
        }

        if let Some(reason) = str_at(candidate, "finishReason") {
            if let Some(usage) = state.usage.take() {
                events.push(CanonicalEvent::Usage { usage });
            }
            events.extend(state.final_event(Some(reason.to_owned())));
        }
        events
    }

    fn retry_hint_from_body(&self, body: &str) -> Option<u64> {
        parse_retry_delay(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use relay_core::ids::ToolCallId;
    use relay_core::messages::{ToolCall, ToolOutput};
    use relay_core::request::{ReasoningEffort, ToolSpec};

    fn adapter() -> GoogleAdapter {
        GoogleAdapter::new(ProviderSettings::new(ProviderType::Google, "g-key"))
    }

    #[test]
    fn url_carries_model_and_mode() {
        let mut req = ChatRequest::new(vec![Message::user("hi")]);
        req.model = Some("gemini-2.0-flash".into());
        let up = adapter().translate_request(&req).unwrap();
        assert_eq!(
            up.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
        assert!(up.body.get("model").is_none());
        assert!(up.body.get("stream").is_none());

        req.stream = false;
        let up = adapter().translate_request(&req).unwrap();
        assert!(up.url.ends_with("/models/gemini-2.0-flash:generateContent"));
    }

    #[test]
    fn function_responses_named_and_merged() {
        let calls = vec![
            ToolCall { id: ToolCallId::from("c1"), index: 0, name: "weather".into(), arguments: "{\"city\":\"Oslo\"}".into(), text_offset: 0 },
            ToolCall { id: ToolCallId::from("c2"), index: 1, name: "time".into(), arguments: "{}".into(), text_offset: 0 },
        ];
        let req = ChatRequest::new(vec![
            Message::system("sys"),
            Message::user("q"),
            Message::assistant_with_tools("", calls),
            Message::tool(&ToolOutput::success(ToolCallId::from("c1"), "rain")),
            Message::tool(&ToolOutput::success(ToolCallId::from("c2"), "noon")),
        ]);
        let body = adapter().translate_request(&req).unwrap().body;
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["args"]["city"], "Oslo");
        let responses = contents[2]["parts"].as_array().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["functionResponse"]["name"], "weather");
        assert_eq!(responses[1]["functionResponse"]["response"]["output"], "noon");
    }

    #[test]
    fn schema_sanitized_and_config_built() {
        let mut req = ChatRequest::new(vec![Message::user("q")]);
        req.model = Some("gemini-2.5-pro".into());
        req.tools = Some(vec![ToolSpec::new(
            "f",
            "d",
            json!({"$schema": "x", "type": "object", "additionalProperties": false,
                   "properties": {"a": {"type": "object", "additionalProperties": true}}}),
        )]);
        req.tool_choice = Some(ToolChoice::Named { name: "f".into() });
        req.reasoning_effort = Some(ReasoningEffort::Medium);
        req.temperature = Some(0.1);
        let _ = req.extra.insert("top_k".into(), json!(40));
        let body = adapter().translate_request(&req).unwrap().body;

        let params = &body["tools"][0]["functionDeclarations"][0]["parameters"];
        assert_eq!(params, &json!({"type": "object", "properties": {"a": {"type": "object"}}}));
        assert_eq!(body["toolConfig"]["functionCallingConfig"], json!({"mode": "ANY", "allowedFunctionNames": ["f"]}));
        let gen_config = &body["generationConfig"];
        assert_eq!(gen_config["thinkingConfig"]["thinkingBudget"], 4096);
        assert_eq!(gen_config["temperature"], 0.1);
        assert_eq!(gen_config["topK"], 40);
    }

    #[test]
    fn stream_frames_normalize() {
        let a = adapter();
        let mut state = StreamState::default();
        let first = a.translate_stream_chunk(
            &json!({"responseId": "r1", "candidates": [{"content": {"parts": [
                {"text": "pondering", "thought": true},
                {"text": "Hello"}
            ]}}]}),
            None,
            &mut state,
        );
        assert_eq!(
            first,
            vec![CanonicalEvent::response_id("r1"), CanonicalEvent::reasoning("pondering"), CanonicalEvent::text("Hello")]
        );

        let last = a.translate_stream_chunk(
            &json!({"responseId": "r1", "candidates": [{
                "content": {"parts": [{"functionCall": {"name": "lookup", "args": {"q": "x"}}}]},
                "finishReason": "STOP"
            }], "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 9, "thoughtsTokenCount": 2}}),
            None,
            &mut state,
        );
        assert_matches!(&last[0], CanonicalEvent::ToolCallDelta { index: 0, id: None, arguments, .. } if arguments == "{\"q\":\"x\"}");
        assert_matches!(&last[1], CanonicalEvent::Usage { usage } if usage.total_tokens == 9 && usage.reasoning_tokens == Some(2));
        assert_eq!(last[2], CanonicalEvent::finished(Some("STOP".into())));
        assert!(a.finish_stream(&mut state).is_empty());
    }

    #[test]
    fn blocked_prompt_is_error() {
        let events = adapter().translate_stream_chunk(
            &json!({"promptFeedback": {"blockReason": "SAFETY"}}),
            None,
            &mut StreamState::default(),
        );
        assert_matches!(&events[0], CanonicalEvent::Error { message, retryable: false } if message.contains("SAFETY"));
    }

    #[test]
    fn retry_delay_from_body() {
        let body = r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED","message":"quota",
            "details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"2.5s"}]}}"#;
        assert_eq!(adapter().retry_hint_from_body(body), Some(2500));
    }

    #[test]
    fn non_streaming_emits_final_without_finish_reason() {
        let events = adapter().translate_response(&json!({"candidates": [{"content": {"parts": [{"text": "ok"}]}}]}));
        assert_eq!(events, vec![CanonicalEvent::text("ok"), CanonicalEvent::finished(None)]);
    }
}

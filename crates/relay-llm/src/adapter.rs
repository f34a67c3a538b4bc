//! # Provider Adapters
//!
//! One [`ProviderAdapter`] per upstream family translates the canonical
//! request into upstream JSON and upstream JSON back into
//! [`CanonicalEvent`]s. Adapters do no I/O; the
//! [`ProviderClient`](crate::client::ProviderClient) owns the transport.
//!
//! [`create_adapter`] picks the family from [`ProviderSettings`].

use std::collections::HashMap;
use std::sync::Arc;

use relay_core::events::CanonicalEvent;
use relay_core::messages::Usage;
use relay_core::provider::{ProviderSettings, ProviderType};
use relay_core::request::ChatRequest;
use serde_json::Value;

use crate::anthropic::AnthropicAdapter;
use crate::google::GoogleAdapter;
use crate::openai::{OpenAiChatAdapter, OpenAiResponsesAdapter};
use crate::provider::ProviderResult;

/// Translated request, ready for the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamRequest {
    /// Absolute URL (Gemini puts model and streaming mode here).
    pub url: String,
    /// JSON body.
    pub body: Value,
    /// Whether an SSE response is expected.
    pub stream: bool,
    /// Resolved model.
    pub model: String,
    /// Fixed headers required by the family (e.g. `anthropic-version`).
    pub headers: Vec<(&'static str, String)>,
}

/// How credentials are presented.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`.
    Bearer,
    /// Key sent verbatim in the named header.
    Header(&'static str),
}

/// Per-stream scratch state shared by all families.
#[derive(Debug, Default)]
pub struct StreamState {
    tool_indices: HashMap<String, u32>,
    next_tool_index: u32,
    /// Finish reason seen before the stream's final frame.
    pub finish_reason: Option<String>,
    /// Usage held back until it is complete.
    pub usage: Option<Usage>,
    /// Response id already reported.
    pub response_id_seen: bool,
    /// An adapter-level `Final` was emitted.
    pub saw_final: bool,
    /// Text of the reasoning block currently streaming, for upstreams that
    /// sign whole blocks.
    pub reasoning_text: String,
}

impl StreamState {
    /// Dense tool index for an upstream key (item id, block index), assigned on first use.
    pub fn tool_index_for(&mut self, key: &str) -> u32 {
        if let Some(index) = self.tool_indices.get(key) {
            return *index;
        }
        let index = self.allocate_tool_index();
        let _ = self.tool_indices.insert(key.to_owned(), index);
        index
    }

    /// Index previously assigned to `key`.
    #[must_use]
    pub fn existing_tool_index(&self, key: &str) -> Option<u32> {
        self.tool_indices.get(key).copied()
    }

    /// Next unused tool index, for upstreams that send whole calls at once.
    pub fn allocate_tool_index(&mut self) -> u32 {
        let index = self.next_tool_index;
        self.next_tool_index += 1;
        index
    }

    /// Adapter-level end of turn, emitted at most once.
    pub fn final_event(&mut self, finish_reason: Option<String>) -> Option<CanonicalEvent> {
        if self.saw_final {
            return None;
        }
        self.saw_final = true;
        Some(CanonicalEvent::finished(finish_reason.or_else(|| self.finish_reason.take())))
    }
}

/// Translation between the canonical contract and one upstream family.
pub trait ProviderAdapter: Send + Sync {
    /// Family.
    fn provider_type(&self) -> ProviderType;

    /// Settings this adapter was built from.
    fn settings(&self) -> &ProviderSettings;

    /// Model used when the request names none.
    fn default_model(&self) -> &str;

    /// Whether tool specs are sent upstream.
    fn supports_tools(&self) -> bool {
        true
    }

    /// Whether reasoning/verbosity parameters are accepted by `model`.
    fn supports_reasoning_controls(&self, model: &str) -> bool;

    /// Whether `previous_response_id` chaining is available.
    fn supports_response_chaining(&self) -> bool {
        false
    }

    /// How the API key is sent.
    fn auth_scheme(&self) -> AuthScheme;

    /// A usable credential is configured.
    fn is_configured(&self) -> bool {
        self.settings().is_configured()
    }

    /// Canonical request to upstream request.
    fn translate_request(&self, request: &ChatRequest) -> ProviderResult<UpstreamRequest>;

    /// Complete (non-streaming) upstream body to events.
    fn translate_response(&self, body: &Value) -> Vec<CanonicalEvent>;

    /// One upstream stream frame to events.
    fn translate_stream_chunk(
        &self,
        chunk: &Value,
        event: Option<&str>,
        state: &mut StreamState,
    ) -> Vec<CanonicalEvent>;

    /// Events owed when the stream ends (held-back usage, a missing final).
    fn finish_stream(&self, state: &mut StreamState) -> Vec<CanonicalEvent> {
        let mut events = Vec::new();
        if let Some(usage) = state.usage.take() {
            events.push(CanonicalEvent::Usage { usage });
        }
        events.extend(state.final_event(None));
        events
    }

    /// Retry delay embedded in an error body, in milliseconds.
    fn retry_hint_from_body(&self, _body: &str) -> Option<u64> {
        None
    }
}

/// Build the adapter for `settings`.
pub fn create_adapter(settings: ProviderSettings) -> Arc<dyn ProviderAdapter> {
    match settings.provider_type {
        ProviderType::OpenAi if settings.responses_api_enabled => {
            Arc::new(OpenAiResponsesAdapter::new(settings))
        }
        ProviderType::OpenAi => Arc::new(OpenAiChatAdapter::new(settings)),
        ProviderType::Anthropic => Arc::new(AnthropicAdapter::new(settings)),
        ProviderType::Google => Arc::new(GoogleAdapter::new(settings)),
    }
}

/// `settings.base_url` or `default`, without a trailing slash.
pub(crate) fn base_url(settings: &ProviderSettings, default: &str) -> String {
    settings
        .base_url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_owned()
}

/// Insert `value` under `key` when present.
pub(crate) fn set_opt<T: serde::Serialize>(body: &mut serde_json::Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(v) = value.and_then(|v| serde_json::to_value(v).ok()) {
        let _ = body.insert(key.to_owned(), v);
    }
}

/// Read a token count that may be absent.
pub(crate) fn u64_at(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(Value::as_u64)
}

/// Non-empty string at `key`.
pub(crate) fn str_at<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

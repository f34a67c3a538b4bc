//! # Provider Client
//!
//! Owns the transport for one adapter. A call goes through these steps:
//!
//! 1. Fail fast when there is no transport or no usable credential.
//! 2. Translate the canonical request via the adapter.
//! 3. POST with retry on 429/5xx. A `Retry-After` header or a delay hint in
//!    the error body replaces the backoff curve. Cancellation is honored
//!    between and during attempts.
//! 4. Tee the body for debug logging, then apply the idle timeout.
//! 5. Parse SSE frames (or the whole JSON body) into canonical events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use relay_core::events::CanonicalEvent;
use relay_core::provider::{ProviderSettings, ProviderType};
use relay_core::request::ChatRequest;
use relay_core::retry::{RetryConfig, parse_retry_after_header};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::adapter::{AuthScheme, ProviderAdapter, StreamState, UpstreamRequest, create_adapter};
use crate::byte_stream::{collect_body, tee_for_logging, with_idle_timeout};
use crate::provider::{CanonicalEventStream, ProviderError, ProviderResult};
use crate::sse::{SseFrame, sse_frames};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

/// Error bodies are read up to this many bytes.
const ERROR_BODY_LIMIT: usize = 64 * 1024;
/// Non-streaming bodies are read up to this many bytes.
const RESPONSE_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Stream-level knobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamOptions {
    /// Fail a read that waits longer than this. `None` disables.
    pub idle_timeout: Option<Duration>,
    /// Bytes of each response copied to the debug log.
    pub log_capture_bytes: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(60)),
            log_capture_bytes: 128 * 1024,
        }
    }
}

/// Something that can stream one canonical turn.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Upstream family.
    fn provider_type(&self) -> ProviderType;

    /// Model used when the request names none.
    fn default_model(&self) -> String;

    /// Whether tool specs are sent upstream.
    fn supports_tools(&self) -> bool;

    /// Whether `previous_response_id` chaining is available.
    fn supports_response_chaining(&self) -> bool;

    /// Run one upstream turn.
    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> ProviderResult<CanonicalEventStream>;
}

/// Delay before retry number `attempt + 1`: the upstream hint when given, otherwise backoff.
#[must_use]
pub fn retry_delay_ms(retry: &RetryConfig, attempt: u32, hint_ms: Option<u64>, random: f64) -> u64 {
    hint_ms.unwrap_or_else(|| retry.backoff_ms(attempt, random))
}

/// Adapter plus transport plus retry policy.
#[derive(Clone)]
pub struct ProviderClient {
    adapter: Arc<dyn ProviderAdapter>,
    transport: Option<Arc<dyn HttpTransport>>,
    retry: RetryConfig,
    options: StreamOptions,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("provider", &self.adapter.provider_type())
            .field("has_transport", &self.transport.is_some())
            .field("retry", &self.retry)
            .field("options", &self.options)
            .finish()
    }
}

impl ProviderClient {
    /// Build from parts. `transport` may be `None`; calls then fail with
    /// [`ProviderError::NoHttpClient`].
    #[must_use]
    pub fn new(adapter: Arc<dyn ProviderAdapter>, transport: Option<Arc<dyn HttpTransport>>) -> Self {
        Self {
            adapter,
            transport,
            retry: RetryConfig::default(),
            options: StreamOptions::default(),
        }
    }

    /// Adapter for `settings` over a fresh reqwest transport.
    pub fn from_settings(settings: ProviderSettings) -> ProviderResult<Self> {
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new()?);
        Ok(Self::new(create_adapter(settings), Some(transport)))
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the stream options.
    #[must_use]
    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// The adapter in use.
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    fn check_ready(&self) -> ProviderResult<&Arc<dyn HttpTransport>> {
        let transport = self.transport.as_ref().ok_or(ProviderError::NoHttpClient)?;
        if !self.adapter.is_configured() {
            return Err(ProviderError::NotConfigured {
                provider: self.adapter.provider_type(),
                reason: "no API key or auth header".into(),
            });
        }
        Ok(transport)
    }

    /// Content negotiation, configured headers, family headers, then auth.
    ///
    /// Configured headers win over everything the client would add itself.
    fn build_headers(&self, upstream: &UpstreamRequest) -> ProviderResult<HeaderMap> {
        let settings = self.adapter.settings();
        let invalid = |what: &str| ProviderError::NotConfigured {
            provider: settings.provider_type,
            reason: format!("invalid header {what}"),
        };

        let mut headers = HeaderMap::new();
        let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let accept = if upstream.stream { "text/event-stream" } else { "application/json" };
        let _ = headers.insert(ACCEPT, HeaderValue::from_static(accept));

        for (name, value) in &settings.headers {
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid(name.as_str()))?;
            let value = HeaderValue::from_str(value).map_err(|_| invalid(name.as_str()))?;
            let _ = headers.insert(header, value);
        }
        for &(name, ref value) in &upstream.headers {
            let header = HeaderName::from_static(name);
            if !headers.contains_key(&header) {
                let value = HeaderValue::from_str(value).map_err(|_| invalid(name))?;
                let _ = headers.insert(header, value);
            }
        }

        if let Some(key) = settings.api_key.as_deref().filter(|k| !k.is_empty()) {
            let (header, value) = match self.adapter.auth_scheme() {
                AuthScheme::Bearer => (AUTHORIZATION, format!("Bearer {key}")),
                AuthScheme::Header(name) => (HeaderName::from_static(name), key.to_owned()),
            };
            if !headers.contains_key(&header) {
                let mut value = HeaderValue::from_str(&value).map_err(|_| invalid("api key"))?;
                value.set_sensitive(true);
                let _ = headers.insert(header, value);
            }
        }
        Ok(headers)
    }

    /// POST `upstream`, retrying 429/5xx responses.
    #[instrument(skip_all, fields(provider = %self.adapter.provider_type(), model = %upstream.model))]
    pub async fn make_http_request(
        &self,
        upstream: &UpstreamRequest,
        cancel: &CancellationToken,
    ) -> ProviderResult<HttpResponse> {
        let transport = self.check_ready()?;
        let request = HttpRequest {
            url: upstream.url.clone(),
            headers: self.build_headers(upstream)?,
            body: Bytes::from(serde_json::to_vec(&upstream.body)?),
        };

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                response = transport.send(request.clone()) => response?,
            };
            if response.is_success() {
                return Ok(response);
            }

            let status = response.status;
            let header_hint = response
                .headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after_header);
            let body = collect_body(response.body, ERROR_BODY_LIMIT).await.unwrap_or_default();
            let body = String::from_utf8_lossy(&body);
            let hint = header_hint.or_else(|| self.adapter.retry_hint_from_body(&body));
            let error = ProviderError::from_status(status, &body, hint);

            if !error.is_retryable_status() || attempt >= self.retry.max_retries {
                return Err(error);
            }

            let delay_ms = retry_delay_ms(&self.retry, attempt, hint, rand::random::<f64>());
            attempt += 1;
            warn!(
                status,
                attempt,
                max_retries = self.retry.max_retries,
                delay_ms,
                hinted = hint.is_some(),
                error = %error,
                "retrying upstream request"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                () = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
        }
    }

    /// Run one turn and return its canonical events.
    #[instrument(skip_all, fields(provider = %self.adapter.provider_type()))]
    pub async fn stream_events(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> ProviderResult<CanonicalEventStream> {
        let _ = self.check_ready()?;
        let upstream = self.adapter.translate_request(request)?;
        debug!(
            url = %upstream.url,
            model = %upstream.model,
            stream = upstream.stream,
            messages = request.messages.len(),
            "sending upstream request"
        );

        let response = self.make_http_request(&upstream, cancel).await?;
        let label = format!("{} {}", self.adapter.provider_type(), upstream.model);
        let mut body = tee_for_logging(response.body, self.options.log_capture_bytes, label);
        if let Some(idle) = self.options.idle_timeout {
            body = with_idle_timeout(body, idle);
        }

        let adapter = Arc::clone(&self.adapter);
        let cancel = cancel.clone();

        if !upstream.stream {
            let stream = async_stream::try_stream! {
                let bytes = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(ProviderError::Cancelled),
                    bytes = collect_body(body, RESPONSE_BODY_LIMIT) => bytes,
                }?;
                let json: Value = serde_json::from_slice(&bytes)?;
                for event in adapter.translate_response(&json) {
                    yield event;
                }
            };
            return Ok(Box::pin(stream));
        }

        let stream = async_stream::try_stream! {
            let mut state = StreamState::default();
            let frames = sse_frames(body);
            futures::pin_mut!(frames);
            loop {
                let frame = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Some(Err(ProviderError::Cancelled)),
                    frame = frames.next() => frame,
                };
                let Some(frame) = frame else { break };
                match frame? {
                    SseFrame::Event { event, data } => {
                        for out in adapter.translate_stream_chunk(&data, event.as_deref(), &mut state) {
                            yield out;
                        }
                    }
                    SseFrame::Done => break,
                    SseFrame::Malformed { .. } => {}
                }
            }
            for out in adapter.finish_stream(&mut state) {
                yield out;
            }
        };
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ModelClient for ProviderClient {
    fn provider_type(&self) -> ProviderType {
        self.adapter.provider_type()
    }

    fn default_model(&self) -> String {
        self.adapter.default_model().to_owned()
    }

    fn supports_tools(&self) -> bool {
        self.adapter.supports_tools()
    }

    fn supports_response_chaining(&self) -> bool {
        self.adapter.supports_response_chaining()
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> ProviderResult<CanonicalEventStream> {
        self.stream_events(request, cancel).await
    }
}

/// Events of a finished stream, for tests and non-streaming callers.
pub async fn collect_events(mut stream: CanonicalEventStream) -> ProviderResult<Vec<CanonicalEvent>> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event?);
    }
    Ok(events)
}

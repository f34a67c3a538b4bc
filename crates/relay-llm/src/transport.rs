//! HTTP transport seam.
//!
//! The client talks to upstreams only through [`HttpTransport`], which must
//! return its body as a [`ByteStream`]. [`ReqwestTransport`] is the
//! production implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;

use crate::byte_stream::{self, ByteStream};
use crate::provider::{ProviderError, ProviderResult};

/// Connect timeout for upstream calls.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// An outgoing POST.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    /// Absolute URL.
    pub url: String,
    /// Complete header set.
    pub headers: HeaderMap,
    /// Serialized JSON body.
    pub body: Bytes,
}

/// Status, headers and a streaming body.
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Body chunks.
    pub body: ByteStream,
}

impl HttpResponse {
    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Sends one HTTP request.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST `request` and return as soon as the response head arrives.
    async fn send(&self, request: HttpRequest) -> ProviderResult<HttpResponse>;
}

/// reqwest-backed transport.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build with a fresh client.
    pub fn new() -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Reuse an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> ProviderResult<HttpResponse> {
        let response = self
            .client
            .post(&request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(ProviderError::from)?;

        Ok(HttpResponse {
            status: response.status().as_u16(),
            headers: response.headers().clone(),
            body: byte_stream::from_reqwest(response),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{CONTENT_TYPE, HeaderValue};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn reqwest_transport_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({"a": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_string("data: {}\n\n"))
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let transport = ReqwestTransport::new().unwrap();
        let response = transport
            .send(HttpRequest {
                url: format!("{}/v1/chat", server.uri()),
                headers,
                body: Bytes::from_static(br#"{"a":1}"#),
            })
            .await
            .unwrap();

        assert!(response.is_success());
        let body = byte_stream::collect_body(response.body, 1024).await.unwrap();
        assert_eq!(body, b"data: {}\n\n");
    }

    #[tokio::test]
    async fn reqwest_transport_returns_error_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let response = ReqwestTransport::new()
            .unwrap()
            .send(HttpRequest {
                url: server.uri(),
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
            .await
            .unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(response.headers.get("retry-after").unwrap(), "2");
    }
}

//! Provider error taxonomy and stream aliases.

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use relay_core::events::CanonicalEvent;
use relay_core::provider::ProviderType;

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Boxed stream of canonical events from one upstream turn.
pub type CanonicalEventStream =
    Pin<Box<dyn Stream<Item = Result<CanonicalEvent, ProviderError>> + Send>>;

/// Errors raised while talking to an upstream.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request failed below the status-code level.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Provider lacks credentials or other required settings.
    #[error("{provider} provider is not configured: {reason}")]
    NotConfigured {
        /// Provider family.
        provider: ProviderType,
        /// What is missing.
        reason: String,
    },

    /// No HTTP transport was supplied.
    #[error("no HTTP client available")]
    NoHttpClient,

    /// Upstream answered 429.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Delay hint from `Retry-After` or the error body.
        retry_after_ms: Option<u64>,
        /// Upstream message.
        message: String,
    },

    /// Upstream answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Upstream message.
        message: String,
        /// Provider-specific code.
        code: Option<String>,
        /// 5xx responses are retryable.
        retryable: bool,
        /// Delay hint, if any.
        retry_after_ms: Option<u64>,
    },

    /// No bytes arrived within the idle timeout.
    #[error("upstream stream idle for {}ms", .0.as_millis())]
    IdleTimeout(Duration),

    /// The upstream reported an error inside the stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// The request was aborted.
    #[error("request cancelled")]
    Cancelled,

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Build the error for a non-success HTTP status.
    #[must_use]
    pub fn from_status(status: u16, body: &str, retry_after_ms: Option<u64>) -> Self {
        let info = crate::error_parsing::parse_api_error(body, status);
        if status == 429 {
            Self::RateLimited {
                retry_after_ms,
                message: info.message,
            }
        } else {
            Self::Api {
                status,
                message: info.message,
                code: info.code,
                retryable: info.retryable,
                retry_after_ms,
            }
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::Api { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether the transport retry loop should try again (429 and 5xx only).
    pub fn is_retryable_status(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Api { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether a fresh request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::IdleTimeout(_) => true,
            Self::RateLimited { .. } | Self::Api { .. } => self.is_retryable_status(),
            Self::Json(_)
            | Self::NotConfigured { .. }
            | Self::NoHttpClient
            | Self::Stream(_)
            | Self::Cancelled
            | Self::Other(_) => false,
        }
    }

    /// Delay hint in milliseconds, if the upstream supplied one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms, .. } | Self::Api { retry_after_ms, .. } => {
                *retry_after_ms
            }
            _ => None,
        }
    }

    /// Error category string for logs and error events.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Http(_) => "network",
            Self::Json(_) => "parse",
            Self::NotConfigured { .. } | Self::NoHttpClient => "configuration",
            Self::RateLimited { .. } => "rate_limit",
            Self::Api { .. } | Self::Stream(_) => "api",
            Self::IdleTimeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Other(_) => "unknown",
        }
    }
}

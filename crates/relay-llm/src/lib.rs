//! # relay-llm
//!
//! Everything between the canonical request and the upstream HTTP API.
//!
//! - [`sse`]: incremental SSE frame parser with `[DONE]` and malformed-frame handling
//! - [`byte_stream`]: the [`byte_stream::ByteStream`] abstraction, idle timeout and logging tee
//! - [`transport`]: [`transport::HttpTransport`] and its reqwest implementation
//! - [`adapter`]: the [`adapter::ProviderAdapter`] trait; [`openai`], [`anthropic`] and [`google`] implement it
//! - [`tool_calls`]: accumulation of index-keyed tool-call deltas
//! - [`client`]: [`client::ProviderClient`] with retry/backoff and canonical event streaming
//! - [`abort`]: process-wide registry of cancellable in-flight requests

#![deny(unsafe_code)]

pub mod abort;
pub mod adapter;
pub mod anthropic;
pub mod byte_stream;
pub mod client;
pub mod error_parsing;
pub mod google;
pub mod models;
pub mod openai;
pub mod provider;
pub mod sse;
pub mod tool_calls;
pub mod transport;

pub use abort::{AbortEntry, AbortGuard, AbortRegistry};
pub use adapter::{ProviderAdapter, create_adapter};
pub use client::{ModelClient, ProviderClient, StreamOptions};
pub use provider::{CanonicalEventStream, ProviderError, ProviderResult};

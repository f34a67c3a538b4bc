//! # relay-core
//!
//! Shared vocabulary for the relay gateway.
//!
//! - **Messages**: [`messages::Message`] with text or multi-part content, tool calls and tool outputs
//! - **Canonical events**: [`events::CanonicalEvent`], the provider-agnostic stream unit, plus SSE wire framing
//! - **Requests**: [`request::ChatRequest`] with typed common parameters and a flattened extras map
//! - **Provider settings**: [`provider::ProviderSettings`] and the [`provider::ProviderSettingsResolver`] seam
//! - **Branded IDs**: `RequestId`, `ConversationId`, `ToolCallId`
//! - **Retry math**: backoff with jitter, `Retry-After` and `retryDelay` parsing
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod events;
pub mod ids;
pub mod logging;
pub mod messages;
pub mod provider;
pub mod request;
pub mod retry;
pub mod text;

//! Provider settings and the resolver seam.
//!
//! Settings are resolved once per request and treated as immutable for its
//! duration. Where they come from (a settings file, a database row) is the
//! resolver's business.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Upstream API family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderType {
    /// OpenAI and compatible Chat Completions / Responses APIs.
    #[serde(rename = "openai", alias = "openai-compatible")]
    OpenAi,
    /// Anthropic Messages API.
    #[serde(rename = "anthropic")]
    Anthropic,
    /// Google Gemini `generateContent` API.
    #[serde(rename = "google", alias = "gemini")]
    Google,
}

impl ProviderType {
    /// Canonical string key.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Headers that count as credentials when supplied in [`ProviderSettings::headers`].
const AUTH_HEADERS: &[&str] = &["authorization", "x-api-key", "x-goog-api-key", "api-key"];

/// Resolved connection settings for one provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    /// API family.
    pub provider_type: ProviderType,
    /// Override of the family's default base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Extra headers sent with every request.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Model used when the request names none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Route OpenAI traffic through the Responses API.
    #[serde(default)]
    pub responses_api_enabled: bool,
}

impl ProviderSettings {
    /// Settings with only a type and key.
    #[must_use]
    pub fn new(provider_type: ProviderType, api_key: impl Into<String>) -> Self {
        Self {
            provider_type,
            base_url: None,
            api_key: Some(api_key.into()),
            headers: BTreeMap::new(),
            default_model: None,
            responses_api_enabled: false,
        }
    }

    /// Whether `name` is among the configured extra headers (case-insensitive).
    #[must_use]
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.keys().any(|k| k.eq_ignore_ascii_case(name))
    }

    /// A usable credential is present, either as a key or as an auth header.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
            || AUTH_HEADERS.iter().any(|h| self.has_header(h))
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("provider_type", &self.provider_type)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("default_model", &self.default_model)
            .field("responses_api_enabled", &self.responses_api_enabled)
            .finish()
    }
}

/// Why provider resolution failed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// No provider with that id.
    #[error("provider not found: {0}")]
    NotFound(String),
    /// The provider exists but is disabled.
    #[error("provider is disabled: {0}")]
    Disabled(String),
    /// No id requested and nothing enabled.
    #[error("no enabled provider configured")]
    NoneEnabled,
}

/// Picks provider settings for a request.
pub trait ProviderSettingsResolver: Send + Sync {
    /// Resolve `requested`, or the most recently updated enabled provider when `None`.
    fn resolve(&self, requested: Option<&str>) -> Result<ProviderSettings, ResolveError>;
}

//! Configured provider registry.

use chrono::{DateTime, Utc};
use relay_core::provider::{ProviderSettings, ProviderSettingsResolver, ResolveError};
use serde::{Deserialize, Serialize};

fn default_enabled() -> bool {
    true
}

/// One row of the provider registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEntry {
    /// Registry key.
    pub id: String,
    /// Disabled rows are never selected.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Last modification; the newest enabled row is the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Connection settings.
    #[serde(flatten)]
    pub settings: ProviderSettings,
}

/// Resolver over a fixed list of [`ProviderEntry`] rows.
#[derive(Clone, Debug, Default)]
pub struct ConfiguredProviders {
    entries: Vec<ProviderEntry>,
}

impl ConfiguredProviders {
    /// Wrap a list of entries.
    #[must_use]
    pub fn new(entries: Vec<ProviderEntry>) -> Self {
        Self { entries }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ProviderSettingsResolver for ConfiguredProviders {
    fn resolve(&self, requested: Option<&str>) -> Result<ProviderSettings, ResolveError> {
        if let Some(id) = requested {
            let entry = self
                .entries
                .iter()
                .find(|e| e.id == id)
                .ok_or_else(|| ResolveError::NotFound(id.to_owned()))?;
            if !entry.enabled {
                return Err(ResolveError::Disabled(id.to_owned()));
            }
            return Ok(entry.settings.clone());
        }

        // Rows without a timestamp sort oldest; ties keep the first listed.
        self.entries
            .iter()
            .filter(|e| e.enabled)
            .rev()
            .max_by_key(|e| e.updated_at)
            .map(|e| e.settings.clone())
            .ok_or(ResolveError::NoneEnabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::provider::ProviderType;

    fn entry(id: &str, enabled: bool, updated: Option<&str>, kind: ProviderType) -> ProviderEntry {
        ProviderEntry {
            id: id.into(),
            enabled,
            updated_at: updated.map(|s| s.parse().unwrap()),
            settings: ProviderSettings::new(kind, format!("key-{id}")),
        }
    }

    #[test]
    fn resolves_requested_id() {
        let reg = ConfiguredProviders::new(vec![
            entry("a", true, None, ProviderType::OpenAi),
            entry("b", true, None, ProviderType::Anthropic),
        ]);
        let s = reg.resolve(Some("b")).unwrap();
        assert_eq!(s.provider_type, ProviderType::Anthropic);
    }

    #[test]
    fn unknown_and_disabled_ids_fail() {
        let reg = ConfiguredProviders::new(vec![entry("a", false, None, ProviderType::OpenAi)]);
        assert_eq!(reg.resolve(Some("zz")), Err(ResolveError::NotFound("zz".into())));
        assert_eq!(reg.resolve(Some("a")), Err(ResolveError::Disabled("a".into())));
        assert_eq!(reg.resolve(None), Err(ResolveError::NoneEnabled));
    }

    #[test]
    fn default_is_most_recently_updated_enabled() {
        let reg = ConfiguredProviders::new(vec![
            entry("old", true, Some("2025-01-01T00:00:00Z"), ProviderType::OpenAi),
            entry("newest-disabled", false, Some("2026-06-01T00:00:00Z"), ProviderType::Google),
            entry("new", true, Some("2026-01-01T00:00:00Z"), ProviderType::Anthropic),
            entry("undated", true, None, ProviderType::Google),
        ]);
        let s = reg.resolve(None).unwrap();
        assert_eq!(s.api_key.as_deref(), Some("key-new"));
    }

    #[test]
    fn ties_prefer_first_listed() {
        let reg = ConfiguredProviders::new(vec![
            entry("first", true, None, ProviderType::OpenAi),
            entry("second", true, None, ProviderType::Google),
        ]);
        assert_eq!(reg.resolve(None).unwrap().api_key.as_deref(), Some("key-first"));
    }

    #[test]
    fn entry_json_is_flat() {
        let e: ProviderEntry = serde_json::from_str(
            r#"{"id":"g","providerType":"gemini","apiKey":"k","defaultModel":"gemini-2.5-flash"}"#,
        )
        .unwrap();
        assert!(e.enabled);
        assert_eq!(e.settings.provider_type, ProviderType::Google);
        assert_eq!(e.settings.default_model.as_deref(), Some("gemini-2.5-flash"));
    }
}

//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `RELAY_*` environment overrides (highest priority)
//!
//! Deep merge rules: objects merge per key, arrays and primitives are
//! replaced, and `null` in the file keeps the default.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::RelaySettings;

/// `~/.relay/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load from the default path with env overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with env overrides. A missing file yields defaults.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of `source` over `target`.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RELAY_*` overrides read through `lookup`.
///
/// Out-of-range or unparsable values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let read_u64 = |name: &str, min: u64, max: u64| {
        let raw = lookup(name).filter(|v| !v.is_empty())?;
        let parsed = parse_u64_range(&raw, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %raw, "invalid numeric env var, ignoring");
        }
        parsed
    };

    if let Some(v) = read_u64("RELAY_MAX_RETRIES", 0, 20) {
        settings.retry.max_retries = u32::try_from(v).unwrap_or(settings.retry.max_retries);
    }
    if let Some(v) = read_u64("RELAY_STREAM_IDLE_TIMEOUT_MS", 0, 3_600_000) {
        settings.stream.idle_timeout_ms = v;
    }
    if let Some(v) = read_u64("RELAY_MAX_TOOL_ITERATIONS", 1, 100) {
        settings.orchestrator.max_iterations =
            u32::try_from(v).unwrap_or(settings.orchestrator.max_iterations);
    }
    if let Some(v) = read_u64("RELAY_TOOL_TIMEOUT_MS", 1, 3_600_000) {
        settings.orchestrator.tool_timeout_ms = v;
    }
    if let Some(v) = lookup("RELAY_LOG_LEVEL").filter(|v| !v.is_empty()) {
        settings.logging.level = v;
    }
    if let Some(raw) = lookup("RELAY_LOG_JSON") {
        match parse_bool(&raw) {
            Some(v) => settings.logging.json = v,
            None => warn!(key = "RELAY_LOG_JSON", value = %raw, "invalid boolean env var, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a boolean: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u64` within `[min, max]`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn deep_merge_nested() {
        let merged = deep_merge(
            json!({"a": {"x": 1, "y": 2}, "b": [1, 2]}),
            json!({"a": {"y": 3}, "b": [9], "c": null}),
        );
        assert_eq!(merged, json!({"a": {"x": 1, "y": 3}, "b": [9]}));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_file_layer(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s, RelaySettings::default());
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "retry": {"maxRetries": 1},
                "stream": {"idleTimeoutMs": 5000},
                "providers": [{"id": "oa", "providerType": "openai", "apiKey": "sk"}]
            }"#,
        )
        .unwrap();
        let s = load_file_layer(&path).unwrap();
        assert_eq!(s.retry.max_retries, 1);
        assert_eq!(s.retry.base_delay_ms, 1000);
        assert_eq!(s.stream.idle_timeout_ms, 5000);
        assert_eq!(s.stream.log_capture_bytes, 131_072);
        assert_eq!(s.providers.len(), 1);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_file_layer(&path).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut s = RelaySettings::default();
        apply_env_overrides(
            &mut s,
            env(&[
                ("RELAY_MAX_RETRIES", "5"),
                ("RELAY_STREAM_IDLE_TIMEOUT_MS", "0"),
                ("RELAY_MAX_TOOL_ITERATIONS", "4"),
                ("RELAY_LOG_LEVEL", "relay=debug"),
                ("RELAY_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(s.retry.max_retries, 5);
        assert_eq!(s.stream.idle_timeout(), None);
        assert_eq!(s.orchestrator.max_iterations, 4);
        assert_eq!(s.logging.level, "relay=debug");
        assert!(s.logging.json);
    }

    #[test]
    fn env_out_of_range_ignored() {
        let mut s = RelaySettings::default();
        apply_env_overrides(
            &mut s,
            env(&[
                ("RELAY_MAX_TOOL_ITERATIONS", "0"),
                ("RELAY_MAX_RETRIES", "many"),
                ("RELAY_LOG_JSON", "maybe"),
            ]),
        );
        assert_eq!(s.orchestrator.max_iterations, 10);
        assert_eq!(s.retry.max_retries, 3);
        assert!(!s.logging.json);
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u64_range("7", 1, 10), Some(7));
        assert_eq!(parse_u64_range("11", 1, 10), None);
    }
}

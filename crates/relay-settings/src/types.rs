//! Settings types.
//!
//! All structs are camelCase on disk and every field has a default, so a
//! partial settings file is always valid.

use std::time::Duration;

use relay_core::retry::RetryConfig;
use serde::{Deserialize, Serialize};

use crate::providers::ProviderEntry;

/// Default per-stream idle timeout.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
/// Default cap on bytes captured by the response logging tee.
pub const DEFAULT_LOG_CAPTURE_BYTES: usize = 128 * 1024;
/// Default model/tool round-trip cap.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
/// Default per-tool execution timeout.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 120_000;

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Upstream retry policy.
    pub retry: RetryConfig,
    /// Streaming behaviour.
    pub stream: StreamSettings,
    /// Tool orchestration limits.
    pub orchestrator: OrchestratorSettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// Provider registry.
    pub providers: Vec<ProviderEntry>,
}

/// Streaming behaviour.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Fail a pending upstream read after this long without bytes. 0 disables.
    pub idle_timeout_ms: u64,
    /// Bytes of each response kept for the debug log.
    pub log_capture_bytes: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            log_capture_bytes: DEFAULT_LOG_CAPTURE_BYTES,
        }
    }
}

impl StreamSettings {
    /// Idle timeout, or `None` when disabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Tool orchestration limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorSettings {
    /// Upstream calls allowed per orchestration.
    pub max_iterations: u32,
    /// Per-tool execution budget.
    pub tool_timeout_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tool_timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
        }
    }
}

/// Log output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = RelaySettings::default();
        assert_eq!(s.orchestrator.max_iterations, 10);
        assert_eq!(s.stream.log_capture_bytes, 131_072);
        assert_eq!(s.stream.idle_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(s.logging.level, "info");
        assert!(s.providers.is_empty());
    }

    #[test]
    fn zero_idle_timeout_disables() {
        let s = StreamSettings {
            idle_timeout_ms: 0,
            ..StreamSettings::default()
        };
        assert_eq!(s.idle_timeout(), None);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: RelaySettings =
            serde_json::from_str(r#"{"orchestrator": {"maxIterations": 3}}"#).unwrap();
        assert_eq!(s.orchestrator.max_iterations, 3);
        assert_eq!(s.orchestrator.tool_timeout_ms, DEFAULT_TOOL_TIMEOUT_MS);
        assert_eq!(s.retry, RetryConfig::default());
    }
}

//! Retry configuration and backoff math.
//!
//! Sync-only building blocks; the async retry loop lives in `relay-llm`.
//!
//! - [`RetryConfig`]: attempts, backoff bounds, jitter
//! - [`calculate_backoff_delay_with_random`]: exponential backoff with jitter
//! - [`parse_retry_after_header`]: `Retry-After` seconds or HTTP-date
//! - [`parse_duration_hint`]: protobuf-style durations such as `"2.5s"`

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default maximum retries.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Retry policy for upstream HTTP calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff in ms (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on the computed backoff in ms (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor 0.0–1.0 (default: 0.2).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryConfig {
    /// Backoff for `attempt` (zero-based) given a random value in `[0, 1)`.
    #[must_use]
    pub fn backoff_ms(&self, attempt: u32, random: f64) -> u64 {
        calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            random,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Exponential backoff with symmetric jitter.
///
/// `min(max_delay, base * 2^attempt) * (1 + (random * 2 - 1) * jitter)`.
/// A jitter factor of 0.2 varies the delay by ±20%.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);

    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor.clamp(0.0, 1.0);
    let with_jitter = (capped as f64) * jitter;

    with_jitter.round().max(0.0) as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider delay hints
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a `Retry-After` header value (seconds or HTTP-date) into milliseconds.
#[must_use]
pub fn parse_retry_after_header(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds.saturating_mul(1000));
    }
    if let Some(ms) = parse_duration_hint(value) {
        return Some(ms);
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
        let delay_ms = date.signed_duration_since(chrono::Utc::now()).num_milliseconds();
        return Some(u64::try_from(delay_ms).unwrap_or(0));
    }

    None
}

/// Parse a duration like `"2.5s"`, `"30s"` or `"750ms"` into milliseconds, rounding up.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_duration_hint(value: &str) -> Option<u64> {
    let value = value.trim();
    let (number, scale) = if let Some(ms) = value.strip_suffix("ms") {
        (ms, 1.0)
    } else if let Some(s) = value.strip_suffix('s') {
        (s, 1000.0)
    } else {
        return None;
    };
    let parsed: f64 = number.trim().parse().ok()?;
    if !parsed.is_finite() || parsed < 0.0 {
        return None;
    }
    Some((parsed * scale).ceil() as u64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30_000);
        assert!((config.jitter_factor - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn retry_config_serde_defaults() {
        let config: RetryConfig = serde_json::from_str(r#"{"maxRetries": 7}"#).unwrap();
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.base_delay_ms, 1000);
    }

    #[test]
    fn backoff_exponential_growth() {
        let d = |a| calculate_backoff_delay_with_random(a, 1000, 60_000, 0.0, 0.5);
        assert_eq!(d(0), 1000);
        assert_eq!(d(1), 2000);
        assert_eq!(d(2), 4000);
        assert_eq!(d(3), 8000);
    }

    #[test]
    fn backoff_caps_at_max() {
        assert_eq!(calculate_backoff_delay_with_random(10, 1000, 30_000, 0.0, 0.0), 30_000);
    }

    #[test]
    fn backoff_jitter_extremes() {
        assert_eq!(calculate_backoff_delay_with_random(0, 1000, 60_000, 0.2, 0.0), 800);
        assert_eq!(calculate_backoff_delay_with_random(0, 1000, 60_000, 0.2, 1.0), 1200);
    }

    #[test]
    fn backoff_huge_attempt_does_not_overflow() {
        assert_eq!(calculate_backoff_delay_with_random(200, u64::MAX, u64::MAX, 0.0, 0.5), u64::MAX);
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after_header("120"), Some(120_000));
        assert_eq!(parse_retry_after_header(" 0 "), Some(0));
    }

    #[test]
    fn retry_after_past_date_is_zero() {
        assert_eq!(parse_retry_after_header("Thu, 01 Jan 2015 00:00:00 GMT"), Some(0));
    }

    #[test]
    fn retry_after_garbage() {
        assert_eq!(parse_retry_after_header("soon"), None);
        assert_eq!(parse_retry_after_header(""), None);
    }

    #[test]
    fn duration_hint_forms() {
        assert_eq!(parse_duration_hint("2.5s"), Some(2500));
        assert_eq!(parse_duration_hint("30s"), Some(30_000));
        assert_eq!(parse_duration_hint("750ms"), Some(750));
        assert_eq!(parse_duration_hint("0.0001s"), Some(1));
        assert_eq!(parse_duration_hint("-1s"), None);
        assert_eq!(parse_duration_hint("2.5"), None);
    }

    proptest! {
        #[test]
        fn backoff_within_jitter_band(attempt in 0u32..12, random in 0.0f64..1.0) {
            let base = calculate_backoff_delay_with_random(attempt, 500, 20_000, 0.0, 0.5);
            let jittered = calculate_backoff_delay_with_random(attempt, 500, 20_000, 0.25, random);
            let lo = (base * 3) / 4;
            let hi = (base * 5) / 4 + 1;
            prop_assert!(jittered >= lo && jittered <= hi);
        }
    }
}

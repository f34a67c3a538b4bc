//! Upstream error body parsing.
//!
//! Handles the envelope formats the supported upstreams use:
//! - Standard: `{"error": {"message": "...", "type": "..."}}`
//! - Google:   `{"error": {"message": "...", "status": "...", "details": [...]}}`,
//!   sometimes wrapped in a one-element array
//! - Detail:   `{"detail": "..."}`
//! - Flat:     `{"message": "...", "code": "..."}`

use relay_core::retry::parse_duration_hint;
use serde_json::Value;

/// Parsed API error information.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiErrorInfo {
    /// Human-readable message.
    pub message: String,
    /// Provider-specific code (`"overloaded_error"`, `"RESOURCE_EXHAUSTED"`, ...).
    pub code: Option<String>,
    /// 429 or 5xx.
    pub retryable: bool,
}

fn unwrap_array(json: Value) -> Value {
    match json {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    }
}

/// Parse an error response body, falling back to the raw text.
pub fn parse_api_error(body: &str, status: u16) -> ApiErrorInfo {
    let retryable = status == 429 || status >= 500;
    let raw = || format!("HTTP {status}: {}", relay_core::text::truncate_str(body.trim(), 2048));

    let Ok(json) = serde_json::from_str::<Value>(body).map(unwrap_array) else {
        return ApiErrorInfo {
            message: raw(),
            code: None,
            retryable,
        };
    };

    if let Some(msg) = json["error"]["message"].as_str() {
        let code = json["error"]["type"]
            .as_str()
            .or_else(|| json["error"]["status"].as_str())
            .or_else(|| json["error"]["code"].as_str())
            .map(String::from);
        return ApiErrorInfo {
            message: msg.to_string(),
            code,
            retryable,
        };
    }

    if let Some(msg) = json["detail"].as_str().or_else(|| json["message"].as_str()) {
        let code = json["code"]
            .as_str()
            .or_else(|| json["type"].as_str())
            .map(String::from);
        return ApiErrorInfo {
            message: msg.to_string(),
            code,
            retryable,
        };
    }

    ApiErrorInfo {
        message: raw(),
        code: None,
        retryable,
    }
}

/// Extract a `google.rpc.RetryInfo` delay (`"retryDelay": "2.5s"`) from an error body.
pub fn parse_retry_delay(body: &str) -> Option<u64> {
    let json = unwrap_array(serde_json::from_str::<Value>(body).ok()?);
    json["error"]["details"]
        .as_array()?
        .iter()
        .filter_map(|d| d.get("retryDelay").and_then(Value::as_str))
        .find_map(parse_duration_hint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_standard_format() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let info = parse_api_error(body, 529);
        assert_eq!(info.message, "Overloaded");
        assert_eq!(info.code.as_deref(), Some("overloaded_error"));
        assert!(info.retryable);
    }

    #[test]
    fn google_status_format_in_array() {
        let body = r#"[{"error":{"code":404,"status":"NOT_FOUND","message":"Model not found"}}]"#;
        let info = parse_api_error(body, 404);
        assert_eq!(info.message, "Model not found");
        assert_eq!(info.code.as_deref(), Some("NOT_FOUND"));
        assert!(!info.retryable);
    }

    #[test]
    fn openai_code_format() {
        let body = r#"{"error":{"message":"bad key","code":"invalid_api_key"}}"#;
        let info = parse_api_error(body, 401);
        assert_eq!(info.code.as_deref(), Some("invalid_api_key"));
    }

    #[test]
    fn detail_and_flat_formats() {
        assert_eq!(parse_api_error(r#"{"detail":"nope"}"#, 404).message, "nope");
        let info = parse_api_error(r#"{"message":"Invalid model","code":"model_not_found"}"#, 400);
        assert_eq!(info.message, "Invalid model");
        assert_eq!(info.code.as_deref(), Some("model_not_found"));
    }

    #[test]
    fn non_json_body_falls_back_to_raw() {
        let info = parse_api_error("Bad Gateway", 502);
        assert_eq!(info.message, "HTTP 502: Bad Gateway");
        assert!(info.retryable);
    }

    #[test]
    fn gemini_retry_delay_extracted() {
        let body = r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED","message":"quota","details":[
            {"@type":"type.googleapis.com/google.rpc.QuotaFailure","violations":[]},
            {"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"2.5s"}
        ]}}"#;
        assert_eq!(parse_retry_delay(body), Some(2500));
    }

    #[test]
    fn retry_delay_absent() {
        assert_eq!(parse_retry_delay(r#"{"error":{"message":"x"}}"#), None);
        assert_eq!(parse_retry_delay("not json"), None);
    }
}

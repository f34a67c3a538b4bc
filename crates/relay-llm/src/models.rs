//! Model-name heuristics.
//!
//! Whether a model accepts reasoning or verbosity controls is decided from
//! its name on every request; there is no static capability table. Names may
//! carry a router prefix (`openai/o3`, `models/gemini-2.5-pro`), which is
//! ignored.

use std::sync::LazyLock;

use regex::Regex;

static OPENAI_REASONING: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(o\d+(-|$)|gpt-5|codex)").ok());

static ANTHROPIC_THINKING: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^claude-(3-7-|(opus|sonnet|haiku)-4|4)").ok());

static GEMINI_THINKING: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^gemini-(2\.5|[3-9])|thinking").ok());

fn base_name(model: &str) -> String {
    model
        .rsplit('/')
        .next()
        .unwrap_or(model)
        .trim()
        .to_ascii_lowercase()
}

fn matches(re: &LazyLock<Option<Regex>>, model: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(&base_name(model)))
}

/// OpenAI o-series, gpt-5 and codex models take `reasoning_effort`.
pub fn openai_supports_reasoning(model: &str) -> bool {
    matches(&OPENAI_REASONING, model)
}

/// Only the gpt-5 family takes `verbosity`.
pub fn openai_supports_verbosity(model: &str) -> bool {
    base_name(model).starts_with("gpt-5")
}

/// Claude 3.7 and the Claude 4 families support extended thinking.
pub fn anthropic_supports_thinking(model: &str) -> bool {
    matches(&ANTHROPIC_THINKING, model)
}

/// Gemini 2.5 and later take a thinking budget.
pub fn gemini_supports_thinking(model: &str) -> bool {
    matches(&GEMINI_THINKING, model)
}

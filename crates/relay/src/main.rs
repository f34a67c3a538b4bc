//! # relay
//!
//! Runs one tool-orchestrated completion against a configured provider and
//! writes the canonical event stream to stdout as SSE frames. Ctrl-C aborts
//! the run through the abort registry.

#![deny(unsafe_code)]

mod tools;

use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use relay_core::ids::{ConversationId, RequestId};
use relay_core::logging::init_subscriber;
use relay_core::messages::Message;
use relay_core::provider::ProviderSettingsResolver;
use relay_core::request::{ChatRequest, ReasoningEffort};
use relay_llm::{ProviderClient, StreamOptions};
use relay_runtime::{
    ConversationStore, InMemoryConversationStore, Orchestrator, OrchestratorConfig, RunOptions, ToolRegistry,
};
use relay_settings::{
    ConfiguredProviders, RelaySettings, get_settings, init_settings, load_settings, load_settings_from_path,
};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Relay gateway CLI.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Stream a tool-orchestrated completion as SSE frames")]
struct Cli {
    /// User prompt.
    #[arg(required = true)]
    prompt: Vec<String>,

    /// System prompt.
    #[arg(long)]
    system: Option<String>,

    /// Provider id from the settings registry (newest enabled if omitted).
    #[arg(long)]
    provider: Option<String>,

    /// Model override.
    #[arg(long)]
    model: Option<String>,

    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Read the whole response instead of streaming it.
    #[arg(long)]
    no_stream: bool,

    /// Output token cap.
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Reasoning effort: minimal, low, medium or high.
    #[arg(long, value_parser = parse_effort)]
    reasoning_effort: Option<ReasoningEffort>,

    /// Do not offer the built-in tools.
    #[arg(long)]
    no_tools: bool,

    /// Log as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

fn parse_effort(value: &str) -> Result<ReasoningEffort, String> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
        .map_err(|_| format!("unknown reasoning effort: {value}"))
}

impl Cli {
    fn request(&self) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(Message::system(system.as_str()));
        }
        messages.push(Message::user(self.prompt.join(" ")));

        let mut request = ChatRequest::new(messages);
        request.model.clone_from(&self.model);
        request.stream = !self.no_stream;
        request.max_tokens = self.max_tokens;
        request.reasoning_effort = self.reasoning_effort;
        request
    }
}

fn orchestrator_config(settings: &RelaySettings) -> OrchestratorConfig {
    OrchestratorConfig {
        max_iterations: settings.orchestrator.max_iterations,
        tool_timeout: Duration::from_millis(settings.orchestrator.tool_timeout_ms),
    }
}

fn stream_options(settings: &RelaySettings) -> StreamOptions {
    StreamOptions {
        idle_timeout: settings.stream.idle_timeout(),
        log_capture_bytes: settings.stream.log_capture_bytes,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => load_settings().context("Failed to load settings")?,
    };
    let installed = init_settings(loaded).is_ok();
    let settings = get_settings();
    init_subscriber(&settings.logging.level, cli.json_logs || settings.logging.json);
    if !installed {
        warn!("settings were already initialized, keeping the existing values");
    }

    let provider = ConfiguredProviders::new(settings.providers.clone())
        .resolve(cli.provider.as_deref())
        .context("No usable provider")?;
    info!(provider = %provider.provider_type, "provider resolved");

    let client = ProviderClient::from_settings(provider)
        .context("Failed to build provider client")?
        .with_retry(settings.retry.clone())
        .with_stream_options(stream_options(settings));

    let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
    let tools = if cli.no_tools { ToolRegistry::new() } else { tools::builtin_registry() };
    let orchestrator = Orchestrator::new(Arc::new(client), Arc::new(tools))
        .with_store(store)
        .with_config(orchestrator_config(settings));
    let registry = Arc::clone(orchestrator.abort_registry());

    let options = RunOptions {
        request_id: RequestId::new(),
        owner_id: None,
        conversation_id: Some(ConversationId::new()),
    };
    let request_id = options.request_id.clone();
    let mut events = pin!(orchestrator.run(cli.request(), options));
    let mut stdout = tokio::io::stdout();
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let frame = event.to_sse_frame().context("Failed to encode event")?;
                stdout.write_all(frame.as_bytes()).await?;
                stdout.flush().await?;
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("Failed to listen for ctrl-c")?;
                interrupted = true;
                if !registry.abort(request_id.as_str(), None) {
                    warn!(request_id = %request_id, "nothing to abort");
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_from_args() {
        let cli = Cli::parse_from([
            "relay",
            "--system",
            "be brief",
            "--model",
            "gpt-4o-mini",
            "--no-stream",
            "--reasoning-effort",
            "High",
            "what",
            "time",
        ]);
        let request = cli.request();
        assert_eq!(request.messages, vec![Message::system("be brief"), Message::user("what time")]);
        assert_eq!(request.model.as_deref(), Some("gpt-4o-mini"));
        assert!(!request.stream);
        assert_eq!(request.reasoning_effort, Some(ReasoningEffort::High));
        assert!(request.tools.is_none());
    }

    #[test]
    fn bad_effort_rejected() {
        assert!(Cli::try_parse_from(["relay", "--reasoning-effort", "extreme", "hi"]).is_err());
    }

    #[test]
    fn config_from_settings() {
        let settings = RelaySettings::default();
        assert_eq!(orchestrator_config(&settings).max_iterations, 10);
        assert_eq!(orchestrator_config(&settings).tool_timeout, Duration::from_secs(120));
        assert_eq!(stream_options(&settings).idle_timeout, Some(Duration::from_secs(60)));
    }
}

//! # Tool Orchestrator
//!
//! Drives one client-visible turn: call the model, buffer tool-call deltas,
//! run the tools, feed their outputs back, and repeat until the model stops
//! asking for tools or the iteration cap is hit.
//!
//! Text, reasoning and metadata are forwarded as they arrive. Tool calls are
//! emitted once per call after the model turn ends, followed by their
//! outputs. Usage is summed across turns and reported once. The stream
//! always ends with `usage` (when any upstream reported it), `final`, then
//! `done`, preceded by `error` when the orchestration failed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt, future::join_all};
use relay_core::events::{CanonicalEvent, CompletionStatus};
use relay_core::ids::{ConversationId, RequestId};
use relay_core::messages::{Message, Role, ToolCall, ToolOutput, Usage};
use relay_core::request::{ChatRequest, ToolSpec};
use relay_core::text::char_len;
use relay_llm::abort::{AbortEntry, AbortRegistry};
use relay_llm::client::ModelClient;
use relay_llm::provider::ProviderError;
use relay_llm::tool_calls::ToolCallAccumulator;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::ToolError;
use crate::diff::AssistantArtifacts;
use crate::persistence::{ConversationStore, sync_artifacts, sync_history};
use crate::tools::{ToolContext, ToolExecutor};

/// Finish reasons that mean the model ran out of output budget.
const LENGTH_FINISH_REASONS: &[&str] = &["length", "max_tokens", "MAX_TOKENS", "max_output_tokens"];

/// Loop limits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Model calls per orchestration.
    pub max_iterations: u32,
    /// Default budget for one tool execution.
    pub tool_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tool_timeout: Duration::from_secs(120),
        }
    }
}

/// Per-run identity.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Key in the abort registry.
    pub request_id: RequestId,
    /// Only this owner may abort the run, when set.
    pub owner_id: Option<String>,
    /// Persist into this conversation, when a store is attached.
    pub conversation_id: Option<ConversationId>,
}

/// Runs orchestrations against one model client and tool executor.
#[derive(Clone)]
pub struct Orchestrator {
    client: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolExecutor>,
    store: Option<Arc<dyn ConversationStore>>,
    registry: Arc<AbortRegistry>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("provider", &self.client.provider_type())
            .field("has_store", &self.store.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Orchestrator using the process-wide abort registry and no store.
    pub fn new(client: Arc<dyn ModelClient>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            client,
            tools,
            store: None,
            registry: AbortRegistry::global(),
            config: OrchestratorConfig::default(),
        }
    }

    /// Persist through `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register runs in `registry` instead of the global one.
    #[must_use]
    pub fn with_abort_registry(mut self, registry: Arc<AbortRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Override loop limits.
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Registry runs are registered in.
    pub fn abort_registry(&self) -> &Arc<AbortRegistry> {
        &self.registry
    }

    /// Run one orchestration.
    ///
    /// The run is registered under `options.request_id` for as long as the
    /// returned stream is alive. Dropping the stream early abandons the run
    /// without a `final` event.
    pub fn run(&self, request: ChatRequest, options: RunOptions) -> impl Stream<Item = CanonicalEvent> + Send + 'static {
        let this = self.clone();
        async_stream::stream! {
            let guard = this
                .registry
                .register(&options.request_id, AbortEntry::new(options.owner_id.clone()));
            let cancel = guard.token().clone();
            let mut run = Run::new(this.clone(), request, options.conversation_id.clone());
            info!(
                request_id = %options.request_id,
                provider = %this.client.provider_type(),
                tools = run.tools.as_ref().map_or(0, Vec::len),
                "orchestration started"
            );
            run.sync_history().await;

            let mut outcome = Outcome::Completed;
            let mut iteration = 0_u32;

            'turns: loop {
                iteration += 1;
                let turn_request = run.next_request(iteration == 1);
                debug!(iteration, messages = turn_request.messages.len(), "model turn");

                let opened = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(ProviderError::Cancelled),
                    opened = this.client.stream(&turn_request, &cancel) => opened,
                };
                let mut upstream = match opened {
                    Ok(upstream) => upstream,
                    Err(error) => {
                        outcome = Outcome::from_error(error, &cancel);
                        break 'turns;
                    }
                };

                let mut pending = ToolCallAccumulator::new();
                let mut turn_text = String::new();
                let mut turn_reasoning: Vec<Value> = Vec::new();
                let mut forwarded = false;
                run.finish_reason = None;

                loop {
                    let next = tokio::select! {
                        biased;
                        () = cancel.cancelled() => Some(Err(ProviderError::Cancelled)),
                        next = upstream.next() => next,
                    };
                    let event = match next {
                        None => break,
                        Some(Ok(event)) => event,
                        Some(Err(error)) => {
                            outcome = Outcome::from_error(error, &cancel);
                            break 'turns;
                        }
                    };

                    match event {
                        CanonicalEvent::Text { delta } => {
                            forwarded = true;
                            run.push_content(&delta);
                            turn_text.push_str(&delta);
                            yield CanonicalEvent::Text { delta };
                        }
                        event @ CanonicalEvent::Reasoning { .. } => {
                            forwarded = true;
                            yield event;
                        }
                        CanonicalEvent::Usage { usage } => {
                            let total = run.usage.get_or_insert_with(Usage::default);
                            total.accumulate(&usage);
                            if let (Some(_), Some(tokens)) = (usage.reasoning_tokens, total.reasoning_tokens) {
                                run.persist_reasoning_tokens(tokens).await;
                            }
                        }
                        CanonicalEvent::ConversationMeta { response_id, reasoning_details } => {
                            if let Some(id) = &response_id {
                                run.response_id = Some(id.clone());
                                run.persist_response_id(id).await;
                            }
                            if let Some(details) = &reasoning_details {
                                run.persist_reasoning_details(details).await;
                                match details {
                                    Value::Array(blocks) => turn_reasoning.extend(blocks.iter().cloned()),
                                    other => turn_reasoning.push(other.clone()),
                                }
                            }
                            yield CanonicalEvent::ConversationMeta { response_id, reasoning_details };
                        }
                        CanonicalEvent::ToolCallDelta { index, id, name, arguments } => {
                            pending.apply(index, id.as_deref(), name.as_deref(), &arguments, run.content_chars);
                        }
                        CanonicalEvent::ToolCall { tool_call } => {
                            pending.apply(
                                tool_call.index,
                                Some(tool_call.id.as_str()),
                                Some(&tool_call.name),
                                &tool_call.arguments,
                                run.content_chars,
                            );
                        }
                        CanonicalEvent::Final { finish_reason, .. } => {
                            if finish_reason.is_some() {
                                run.finish_reason = finish_reason;
                            }
                        }
                        CanonicalEvent::Error { message, retryable } => {
                            outcome = Outcome::Failed { message, retryable };
                            break 'turns;
                        }
                        CanonicalEvent::ToolOutput { .. } => debug!("ignoring upstream tool output event"),
                        CanonicalEvent::Done => break,
                    }
                }

                let calls = pending.finish();
                if calls.is_empty() {
                    if !forwarded {
                        warn!(iteration, "model turn produced no content and no tool calls");
                    }
                    if run
                        .finish_reason
                        .as_deref()
                        .is_some_and(|r| LENGTH_FINISH_REASONS.contains(&r))
                    {
                        outcome = Outcome::Truncated;
                    }
                    break 'turns;
                }

                for call in &calls {
                    yield CanonicalEvent::ToolCall { tool_call: call.clone() };
                }
                run.artifacts.tool_calls.extend(calls.iter().cloned());
                run.sync_artifacts().await;

                let outputs = run.execute_tools(&calls, &cancel).await;
                for output in &outputs {
                    yield CanonicalEvent::ToolOutput { output: output.clone() };
                }
                run.artifacts.tool_outputs.extend(outputs.iter().cloned());
                run.sync_artifacts().await;

                if cancel.is_cancelled() {
                    outcome = Outcome::Cancelled;
                    break 'turns;
                }
                run.append_turn(turn_text, calls, turn_reasoning, &outputs);

                if iteration >= this.config.max_iterations {
                    let notice = format!("\n\n[Stopped after {iteration} tool iterations]");
                    warn!(iteration, "tool iteration cap reached");
                    run.push_content(&notice);
                    yield CanonicalEvent::text(notice);
                    outcome = Outcome::Truncated;
                    break 'turns;
                }
            }

            if let Outcome::Failed { message, retryable } = &outcome {
                warn!(request_id = %options.request_id, error = %message, retryable, "orchestration failed");
                yield CanonicalEvent::Error { message: message.clone(), retryable: *retryable };
                run.persist_error(message).await;
                if !run.content.is_empty() {
                    run.push_content("\n\n");
                }
                run.push_content(&format!("[Error: {message}]"));
            }

            if let Some(usage) = run.usage.take() {
                yield CanonicalEvent::Usage { usage };
            }

            let status = outcome.status();
            run.persist_final(status).await;
            info!(request_id = %options.request_id, iterations = iteration, status = status.as_str(), "orchestration finished");

            yield CanonicalEvent::Final {
                content: Some(std::mem::take(&mut run.content)),
                finish_reason: run.finish_reason.take(),
                status,
            };
            drop(guard);
            yield CanonicalEvent::Done;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run state
// ─────────────────────────────────────────────────────────────────────────────

enum Outcome {
    Completed,
    Truncated,
    Cancelled,
    Failed { message: String, retryable: bool },
}

impl Outcome {
    fn from_error(error: ProviderError, cancel: &CancellationToken) -> Self {
        if matches!(error, ProviderError::Cancelled) || cancel.is_cancelled() {
            return Self::Cancelled;
        }
        Self::Failed {
            retryable: error.is_retryable(),
            message: error.to_string(),
        }
    }

    fn status(&self) -> CompletionStatus {
        match self {
            Self::Completed => CompletionStatus::Completed,
            Self::Truncated => CompletionStatus::Truncated,
            Self::Cancelled => CompletionStatus::Cancelled,
            Self::Failed { .. } => CompletionStatus::Error,
        }
    }
}

/// Mutable state of one orchestration.
struct Run {
    orchestrator: Orchestrator,
    conversation_id: Option<ConversationId>,
    base: ChatRequest,
    /// Working history: the request messages plus every completed tool turn.
    messages: Vec<Message>,
    tools: Option<Vec<ToolSpec>>,
    /// Assistant text across all turns.
    content: String,
    /// `char_len(content)`, kept as text is appended.
    content_chars: usize,
    /// Usage summed across turns.
    usage: Option<Usage>,
    /// Tool calls and outputs across turns, persisted as the assistant
    /// message's artifacts.
    artifacts: AssistantArtifacts,
    response_id: Option<String>,
    /// Messages the upstream already holds through response chaining.
    chained_len: usize,
    finish_reason: Option<String>,
}

impl Run {
    fn new(orchestrator: Orchestrator, mut base: ChatRequest, conversation_id: Option<ConversationId>) -> Self {
        let tools = if orchestrator.client.supports_tools() {
            base.tool_specs()
                .map(<[ToolSpec]>::to_vec)
                .or_else(|| Some(orchestrator.tools.list_specs()).filter(|s| !s.is_empty()))
        } else {
            None
        };
        let messages = std::mem::take(&mut base.messages);
        Self {
            response_id: base.previous_response_id.clone(),
            orchestrator,
            conversation_id,
            base,
            messages,
            tools,
            content: String::new(),
            content_chars: 0,
            usage: None,
            artifacts: AssistantArtifacts::default(),
            chained_len: 0,
            finish_reason: None,
        }
    }

    fn chaining(&self) -> bool {
        self.orchestrator.client.supports_response_chaining()
    }

    fn next_request(&self, first: bool) -> ChatRequest {
        let mut request = self.base.clone();
        request.tools.clone_from(&self.tools);
        if !first && self.chaining() && self.response_id.is_some() {
            request.previous_response_id.clone_from(&self.response_id);
            request.messages = self
                .messages
                .iter()
                .take(self.chained_len)
                .filter(|m| m.role == Role::System)
                .chain(&self.messages[self.chained_len..])
                .cloned()
                .collect();
        } else {
            request.messages.clone_from(&self.messages);
        }
        request
    }

    fn push_content(&mut self, text: &str) {
        self.content.push_str(text);
        self.content_chars += char_len(text);
    }

    fn append_turn(&mut self, text: String, calls: Vec<ToolCall>, reasoning: Vec<Value>, outputs: &[ToolOutput]) {
        let reasoning = (!reasoning.is_empty()).then_some(Value::Array(reasoning));
        self.messages
            .push(Message::assistant_with_tools(text, calls).with_reasoning_details(reasoning));
        self.chained_len = self.messages.len();
        self.messages.extend(outputs.iter().map(Message::tool));
    }

    async fn execute_tools(&self, calls: &[ToolCall], cancel: &CancellationToken) -> Vec<ToolOutput> {
        join_all(calls.iter().map(|call| self.execute_tool(call, cancel))).await
    }

    #[instrument(skip_all, fields(tool_name = %call.name, tool_call_id = %call.id))]
    async fn execute_tool(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutput {
        let tools = &self.orchestrator.tools;
        let budget = tools
            .timeout_for(&call.name)
            .unwrap_or(self.orchestrator.config.tool_timeout);
        let ctx = ToolContext {
            tool_call_id: call.id.clone(),
            conversation_id: self.conversation_id.clone(),
            cancellation: cancel.child_token(),
        };
        let start = Instant::now();

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ToolError::Cancelled),
            result = tokio::time::timeout(budget, tools.execute(&call.name, &call.arguments, &ctx)) => {
                result.unwrap_or_else(|_| Err(ToolError::Timeout {
                    timeout_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                }))
            }
        };
        let duration_ms = start.elapsed().as_millis();

        match result {
            Ok(output) => {
                debug!(duration_ms, "tool executed");
                ToolOutput::success(call.id.clone(), output)
            }
            Err(ToolError::Timeout { timeout_ms }) => {
                warn!(timeout_ms, "tool timed out");
                ToolOutput::timeout(call.id.clone(), &call.name, timeout_ms)
            }
            Err(error) => {
                warn!(duration_ms, category = error.category(), error = %error, "tool failed");
                ToolOutput::failure(call.id.clone(), &call.name, &error.to_string())
            }
        }
    }

    // ── persistence ─────────────────────────────────────────────────────
    //
    // Store failures never abort the orchestration.

    fn store(&self) -> Option<(&dyn ConversationStore, &ConversationId)> {
        Some((self.orchestrator.store.as_deref()?, self.conversation_id.as_ref()?))
    }

    async fn sync_history(&self) {
        let Some((store, conversation)) = self.store() else {
            return;
        };
        match sync_history(store, conversation, &self.messages).await {
            Ok(diff) => debug!(
                anchor = diff.anchor_offset,
                fallback = diff.fallback,
                inserted = diff.to_insert.len(),
                "history synced"
            ),
            Err(error) => warn!(error = %error, "history sync failed"),
        }
    }

    async fn persist_response_id(&self, response_id: &str) {
        if let Some((store, conversation)) = self.store() {
            if let Err(error) = store.set_response_id(conversation, response_id).await {
                warn!(error = %error, "failed to persist response id");
            }
        }
    }

    async fn persist_reasoning_details(&self, details: &Value) {
        if let Some((store, conversation)) = self.store() {
            if let Err(error) = store.set_reasoning_details(conversation, details).await {
                warn!(error = %error, "failed to persist reasoning details");
            }
        }
    }

    async fn persist_reasoning_tokens(&self, tokens: u64) {
        if let Some((store, conversation)) = self.store() {
            if let Err(error) = store.set_reasoning_tokens(conversation, tokens).await {
                warn!(error = %error, "failed to persist reasoning tokens");
            }
        }
    }

    async fn sync_artifacts(&self) {
        if let Some((store, conversation)) = self.store() {
            if let Err(error) = sync_artifacts(store, conversation, &self.artifacts).await {
                warn!(error = %error, "failed to persist tool artifacts");
            }
        }
    }

    async fn persist_error(&self, message: &str) {
        if let Some((store, conversation)) = self.store() {
            if let Err(error) = store.mark_error(conversation, message).await {
                warn!(error = %error, "failed to mark error");
            }
        }
    }

    async fn persist_final(&self, status: CompletionStatus) {
        if let Some((store, conversation)) = self.store() {
            if let Err(error) = store.finish_assistant(conversation, &self.content, status).await {
                warn!(error = %error, "failed to persist assistant message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryConversationStore;
    use crate::tools::{Tool, ToolRegistry};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures::stream;
    use parking_lot::Mutex;
    use relay_core::messages::ToolStatus;
    use relay_core::provider::ProviderType;
    use relay_llm::provider::{CanonicalEventStream, ProviderResult};
    use serde_json::json;
    use std::collections::VecDeque;

    // ── scripted model ──────────────────────────────────────────────────

    enum Turn {
        Events(Vec<CanonicalEvent>),
        Hang(Vec<CanonicalEvent>),
        Fail(ProviderError),
    }

    struct ScriptedModel {
        turns: Mutex<VecDeque<Turn>>,
        requests: Mutex<Vec<ChatRequest>>,
        tools: bool,
        chaining: bool,
    }

    impl ScriptedModel {
        fn new(turns: Vec<Turn>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
                requests: Mutex::new(Vec::new()),
                tools: true,
                chaining: false,
            })
        }

        fn with_flags(turns: Vec<Turn>, tools: bool, chaining: bool) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
                requests: Mutex::new(Vec::new()),
                tools,
                chaining,
            })
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        fn provider_type(&self) -> ProviderType {
            ProviderType::OpenAi
        }

        fn default_model(&self) -> String {
            "scripted".into()
        }

        fn supports_tools(&self) -> bool {
            self.tools
        }

        fn supports_response_chaining(&self) -> bool {
            self.chaining
        }

        async fn stream(&self, request: &ChatRequest, _cancel: &CancellationToken) -> ProviderResult<CanonicalEventStream> {
            self.requests.lock().push(request.clone());
            let turn = self.turns.lock().pop_front();
            match turn {
                Some(Turn::Events(events)) => Ok(Box::pin(stream::iter(events.into_iter().map(Ok)))),
                Some(Turn::Hang(events)) => Ok(Box::pin(stream::iter(events.into_iter().map(Ok)).chain(stream::pending()))),
                Some(Turn::Fail(error)) => Err(error),
                None => Err(ProviderError::Other("script exhausted".into())),
            }
        }
    }

    // ── tools ───────────────────────────────────────────────────────────

    struct Lookup;

    #[async_trait]
    impl Tool for Lookup {
        fn name(&self) -> &str {
            "lookup"
        }

        fn spec(&self) -> ToolSpec {
            ToolSpec::new("lookup", "Look something up", json!({"type": "object"}))
        }

        async fn execute(&self, arguments: Value, _ctx: &ToolContext) -> Result<String, ToolError> {
            Ok(format!("result for {}", arguments["q"].as_str().unwrap_or("?")))
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn spec(&self) -> ToolSpec {
            ToolSpec::new("broken", "", json!({"type": "object"}))
        }

        async fn execute(&self, _arguments: Value, _ctx: &ToolContext) -> Result<String, ToolError> {
            Err(ToolError::Execution("disk full".into()))
        }
    }

    struct Sleepy {
        name: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            self.name
        }

        fn spec(&self) -> ToolSpec {
            ToolSpec::new(self.name, "", json!({"type": "object"}))
        }

        async fn execute(&self, _arguments: Value, _ctx: &ToolContext) -> Result<String, ToolError> {
            tokio::time::sleep(self.delay).await;
            Ok(format!("{} done", self.name))
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Lookup));
        registry.register(Arc::new(Broken));
        registry.register(Arc::new(Sleepy { name: "fast", delay: Duration::from_millis(10) }));
        registry.register(Arc::new(Sleepy { name: "slow", delay: Duration::from_secs(3600) }));
        registry.register(Arc::new(Sleepy { name: "medium", delay: Duration::from_millis(200) }));
        Arc::new(registry)
    }

    // ── helpers ─────────────────────────────────────────────────────────

    fn delta(index: u32, id: Option<&str>, name: Option<&str>, arguments: &str) -> CanonicalEvent {
        CanonicalEvent::ToolCallDelta {
            index,
            id: id.map(str::to_owned),
            name: name.map(str::to_owned),
            arguments: arguments.into(),
        }
    }

    fn tool_turn(id: &str, name: &str, arguments: &str) -> Turn {
        Turn::Events(vec![
            delta(0, Some(id), Some(name), arguments),
            CanonicalEvent::finished(Some("tool_calls".into())),
            CanonicalEvent::Done,
        ])
    }

    fn text_turn(text: &str) -> Turn {
        Turn::Events(vec![
            CanonicalEvent::text(text),
            CanonicalEvent::finished(Some("stop".into())),
            CanonicalEvent::Done,
        ])
    }

    struct Harness {
        orchestrator: Orchestrator,
        registry: Arc<AbortRegistry>,
    }

    fn harness(model: Arc<ScriptedModel>) -> Harness {
        let registry = Arc::new(AbortRegistry::new());
        let orchestrator = Orchestrator::new(model, registry_tools()).with_abort_registry(Arc::clone(&registry));
        Harness { orchestrator, registry }
    }

    fn registry_tools() -> Arc<dyn ToolExecutor> {
        registry()
    }

    fn options(id: &str) -> RunOptions {
        RunOptions {
            request_id: RequestId::from(id),
            ..RunOptions::default()
        }
    }

    fn ask(text: &str) -> ChatRequest {
        ChatRequest::new(vec![Message::user(text)])
    }

    async fn run_all(orchestrator: &Orchestrator, request: ChatRequest, options: RunOptions) -> Vec<CanonicalEvent> {
        orchestrator.run(request, options).collect().await
    }

    fn kinds(events: &[CanonicalEvent]) -> Vec<&'static str> {
        events.iter().map(CanonicalEvent::kind).collect()
    }

    fn final_of(events: &[CanonicalEvent]) -> (String, Option<String>, CompletionStatus) {
        events
            .iter()
            .find_map(|e| match e {
                CanonicalEvent::Final { content, finish_reason, status } => {
                    Some((content.clone().unwrap_or_default(), finish_reason.clone(), *status))
                }
                _ => None,
            })
            .expect("final event")
    }

    fn outputs(events: &[CanonicalEvent]) -> Vec<ToolOutput> {
        events
            .iter()
            .filter_map(|e| match e {
                CanonicalEvent::ToolOutput { output } => Some(output.clone()),
                _ => None,
            })
            .collect()
    }

    // ── tests ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn tool_round_trip() {
        let model = ScriptedModel::new(vec![
            Turn::Events(vec![
                delta(0, Some("call_1"), Some("lookup"), r#"{"q":"#),
                delta(0, None, None, r#""weather"}"#),
                CanonicalEvent::Usage { usage: Usage::new(10, 5, None) },
                CanonicalEvent::finished(Some("tool_calls".into())),
                CanonicalEvent::Done,
            ]),
            Turn::Events(vec![
                CanonicalEvent::text("It is "),
                CanonicalEvent::text("sunny."),
                CanonicalEvent::Usage { usage: Usage::new(20, 4, None) },
                CanonicalEvent::finished(Some("stop".into())),
                CanonicalEvent::Done,
            ]),
        ]);
        let h = harness(Arc::clone(&model));
        let events = run_all(&h.orchestrator, ask("weather?"), options("req-1")).await;

        assert_eq!(
            kinds(&events),
            vec!["toolCall", "toolOutput", "text", "text", "usage", "final", "done"]
        );
        assert_matches!(&events[0], CanonicalEvent::ToolCall { tool_call } if tool_call.id.as_str() == "call_1"
            && tool_call.arguments == r#"{"q":"weather"}"#);
        assert_eq!(events[4], CanonicalEvent::Usage { usage: Usage::new(30, 9, None) });
        assert_eq!(outputs(&events)[0].output, "result for weather");
        assert_eq!(
            final_of(&events),
            ("It is sunny.".into(), Some("stop".into()), CompletionStatus::Completed)
        );

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.as_ref().map(Vec::len), Some(5));
        let second = &requests[1].messages;
        assert_eq!(second.len(), 3);
        assert_eq!(second[1].role, Role::Assistant);
        assert_eq!(second[1].tool_calls[0].name, "lookup");
        assert_eq!(second[2].role, Role::Tool);
        assert_eq!(second[2].tool_call_id.as_ref().map(|id| id.as_str()), Some("call_1"));
        assert_eq!(second[2].text(), "result for weather");
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn caller_tools_take_precedence() {
        let model = ScriptedModel::new(vec![text_turn("hi")]);
        let h = harness(Arc::clone(&model));
        let mut request = ask("hi");
        request.tools = Some(vec![ToolSpec::new("only_this", "", json!({}))]);
        let _ = run_all(&h.orchestrator, request, options("req-1")).await;

        let sent = model.requests()[0].tools.clone().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].name, "only_this");
    }

    #[tokio::test]
    async fn tools_omitted_when_unsupported() {
        let model = ScriptedModel::with_flags(vec![text_turn("hi")], false, false);
        let h = harness(Arc::clone(&model));
        let _ = run_all(&h.orchestrator, ask("hi"), options("req-1")).await;
        assert!(model.requests()[0].tools.is_none());
    }

    #[tokio::test]
    async fn iteration_cap_truncates() {
        let turns = (0..12).map(|i| tool_turn(&format!("call_{i}"), "lookup", "{}")).collect();
        let model = ScriptedModel::new(turns);
        let h = harness(Arc::clone(&model));
        let events = run_all(&h.orchestrator, ask("loop"), options("req-1")).await;

        assert_eq!(model.requests().len(), 10);
        assert_eq!(outputs(&events).len(), 10);
        let (content, _, status) = final_of(&events);
        assert_eq!(status, CompletionStatus::Truncated);
        assert_eq!(content, "\n\n[Stopped after 10 tool iterations]");
        assert_eq!(kinds(&events)[kinds(&events).len() - 3], "text");
        assert_matches!(events.last(), Some(CanonicalEvent::Done));
    }

    #[tokio::test]
    async fn configured_cap_is_honored() {
        let turns = (0..5).map(|i| tool_turn(&format!("call_{i}"), "lookup", "{}")).collect();
        let model = ScriptedModel::new(turns);
        let h = harness(Arc::clone(&model));
        let orchestrator = h.orchestrator.with_config(OrchestratorConfig {
            max_iterations: 2,
            ..OrchestratorConfig::default()
        });
        let events = run_all(&orchestrator, ask("loop"), options("req-1")).await;
        assert_eq!(model.requests().len(), 2);
        assert!(final_of(&events).0.contains("[Stopped after 2 tool iterations]"));
    }

    #[tokio::test]
    async fn tool_failures_become_outputs() {
        let model = ScriptedModel::new(vec![
            Turn::Events(vec![
                delta(0, Some("call_a"), Some("broken"), "{}"),
                delta(1, Some("call_b"), Some("nope"), "{}"),
                CanonicalEvent::Done,
            ]),
            text_turn("recovered"),
        ]);
        let h = harness(model);
        let events = run_all(&h.orchestrator, ask("go"), options("req-1")).await;

        let outs = outputs(&events);
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[0].status, ToolStatus::Error);
        assert_eq!(outs[0].output, "broken failed: disk full");
        assert_eq!(outs[1].output, "nope failed: unknown tool: nope");
        assert_eq!(final_of(&events).2, CompletionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn tool_timeout_becomes_output() {
        let model = ScriptedModel::new(vec![tool_turn("call_1", "slow", "{}"), text_turn("ok")]);
        let h = harness(model);
        let orchestrator = h.orchestrator.with_config(OrchestratorConfig {
            tool_timeout: Duration::from_millis(50),
            ..OrchestratorConfig::default()
        });
        let events = run_all(&orchestrator, ask("go"), options("req-1")).await;

        let outs = outputs(&events);
        assert_eq!(outs[0].status, ToolStatus::Timeout);
        assert_eq!(outs[0].output, "slow timed out after 50ms");
        assert_eq!(final_of(&events).2, CompletionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_outputs_keep_call_order() {
        let model = ScriptedModel::new(vec![
            Turn::Events(vec![
                delta(0, Some("call_m"), Some("medium"), "{}"),
                delta(1, Some("call_f"), Some("fast"), "{}"),
                CanonicalEvent::Done,
            ]),
            text_turn("ok"),
        ]);
        let h = harness(model);
        let start = tokio::time::Instant::now();
        let events = run_all(&h.orchestrator, ask("go"), options("req-1")).await;

        let ids: Vec<String> = outputs(&events).iter().map(|o| o.tool_call_id.to_string()).collect();
        assert_eq!(ids, vec!["call_m", "call_f"]);
        assert!(start.elapsed() < Duration::from_millis(210), "tools ran concurrently");
    }

    #[tokio::test]
    async fn text_offset_counts_prior_text() {
        let model = ScriptedModel::new(vec![
            Turn::Events(vec![
                CanonicalEvent::text("Let me check. "),
                delta(0, Some("call_1"), Some("lookup"), "{}"),
                CanonicalEvent::Done,
            ]),
            Turn::Events(vec![
                CanonicalEvent::text("Héllo"),
                delta(0, Some("call_2"), Some("lookup"), "{}"),
                CanonicalEvent::Done,
            ]),
            text_turn("done"),
        ]);
        let h = harness(model);
        let events = run_all(&h.orchestrator, ask("go"), options("req-1")).await;

        let offsets: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                CanonicalEvent::ToolCall { tool_call } => Some(tool_call.text_offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![14, 19]);
    }

    #[tokio::test]
    async fn text_offset_sums_many_small_deltas() {
        let mut events: Vec<CanonicalEvent> = (0..200).map(|_| CanonicalEvent::text("ü🦀")).collect();
        events.push(delta(0, Some("call_1"), Some("lookup"), "{}"));
        events.push(CanonicalEvent::Done);
        let model = ScriptedModel::new(vec![Turn::Events(events), text_turn("done")]);
        let h = harness(model);
        let events = run_all(&h.orchestrator, ask("go"), options("req-1")).await;

        let call = events
            .iter()
            .find_map(|e| match e {
                CanonicalEvent::ToolCall { tool_call } => Some(tool_call.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(call.text_offset, 400);
    }

    #[tokio::test]
    async fn upstream_failure_ends_with_error_final_done() {
        let model = ScriptedModel::new(vec![Turn::Fail(ProviderError::Api {
            status: 503,
            message: "overloaded".into(),
            code: None,
            retryable: true,
            retry_after_ms: None,
        })]);
        let h = harness(model);
        let events = run_all(&h.orchestrator, ask("go"), options("req-1")).await;

        assert_eq!(kinds(&events), vec!["error", "final", "done"]);
        assert_matches!(&events[0], CanonicalEvent::Error { retryable: true, message } if message.contains("overloaded"));
        let (content, _, status) = final_of(&events);
        assert_eq!(status, CompletionStatus::Error);
        assert_eq!(content, "[Error: API error (503): overloaded]");
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn in_stream_error_keeps_partial_text() {
        let model = ScriptedModel::new(vec![Turn::Events(vec![
            CanonicalEvent::text("partial"),
            CanonicalEvent::Error {
                message: "upstream exploded".into(),
                retryable: false,
            },
            CanonicalEvent::text("never"),
        ])]);
        let h = harness(model);
        let events = run_all(&h.orchestrator, ask("go"), options("req-1")).await;

        assert_eq!(kinds(&events), vec!["text", "error", "final", "done"]);
        assert_eq!(final_of(&events).0, "partial\n\n[Error: upstream exploded]");
    }

    #[tokio::test]
    async fn abort_through_registry_cancels() {
        let model = ScriptedModel::new(vec![Turn::Hang(vec![CanonicalEvent::text("partial")])]);
        let h = harness(model);
        let run_options = RunOptions {
            request_id: RequestId::from("req-9"),
            owner_id: Some("alice".into()),
            conversation_id: None,
        };
        let mut events = Box::pin(h.orchestrator.run(ask("go"), run_options));

        assert_matches!(events.next().await, Some(CanonicalEvent::Text { delta }) if delta == "partial");
        assert!(!h.registry.abort("req-9", Some("mallory")));
        assert!(h.registry.abort("req-9", Some("alice")));

        let rest: Vec<CanonicalEvent> = events.collect().await;
        assert_eq!(kinds(&rest), vec!["final", "done"]);
        assert_eq!(final_of(&rest), ("partial".into(), None, CompletionStatus::Cancelled));
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn run_is_registered_while_streaming() {
        let model = ScriptedModel::new(vec![Turn::Hang(vec![CanonicalEvent::text("x")])]);
        let h = harness(model);
        let mut events = Box::pin(h.orchestrator.run(ask("go"), options("req-2")));
        let _ = events.next().await;
        assert!(h.registry.contains("req-2"));
        drop(events);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn empty_turn_completes() {
        let model = ScriptedModel::new(vec![Turn::Events(vec![CanonicalEvent::finished(None), CanonicalEvent::Done])]);
        let h = harness(Arc::clone(&model));
        let events = run_all(&h.orchestrator, ask("go"), options("req-1")).await;

        assert_eq!(kinds(&events), vec!["final", "done"]);
        assert_eq!(final_of(&events), (String::new(), None, CompletionStatus::Completed));
        assert_eq!(model.requests().len(), 1);
    }

    #[tokio::test]
    async fn length_finish_is_truncated() {
        let model = ScriptedModel::new(vec![Turn::Events(vec![
            CanonicalEvent::text("cut"),
            CanonicalEvent::finished(Some("length".into())),
            CanonicalEvent::Done,
        ])]);
        let h = harness(model);
        let events = run_all(&h.orchestrator, ask("go"), options("req-1")).await;
        assert_eq!(final_of(&events).2, CompletionStatus::Truncated);
    }

    #[tokio::test]
    async fn chaining_sends_only_new_messages() {
        let model = ScriptedModel::with_flags(
            vec![
                Turn::Events(vec![
                    CanonicalEvent::response_id("resp_1"),
                    delta(0, Some("call_1"), Some("lookup"), r#"{"q":"x"}"#),
                    CanonicalEvent::Done,
                ]),
                text_turn("done"),
            ],
            true,
            true,
        );
        let h = harness(Arc::clone(&model));
        let request = ChatRequest::new(vec![Message::system("be brief"), Message::user("go")]);
        let events = run_all(&h.orchestrator, request, options("req-1")).await;
        assert_eq!(kinds(&events)[0], "conversationMeta");

        let requests = model.requests();
        assert_eq!(requests[0].previous_response_id, None);
        assert_eq!(requests[1].previous_response_id.as_deref(), Some("resp_1"));
        let roles: Vec<Role> = requests[1].messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::Tool]);
    }

    #[tokio::test]
    async fn metadata_and_artifacts_are_persisted() {
        let model = ScriptedModel::new(vec![
            Turn::Events(vec![
                CanonicalEvent::ConversationMeta {
                    response_id: Some("msg_1".into()),
                    reasoning_details: Some(json!([{"type": "thinking", "signature": "sig"}])),
                },
                delta(0, Some("call_1"), Some("lookup"), r#"{"q":"x"}"#),
                CanonicalEvent::Usage { usage: Usage::new(1, 2, None).with_reasoning_tokens(Some(7)) },
                CanonicalEvent::Done,
            ]),
            text_turn("answer"),
        ]);
        let store = Arc::new(InMemoryConversationStore::new());
        let h = harness(model);
        let orchestrator = h.orchestrator.with_store(Arc::clone(&store) as Arc<dyn ConversationStore>);
        let conversation = ConversationId::from("conv-1");
        let run_options = RunOptions {
            conversation_id: Some(conversation.clone()),
            ..options("req-1")
        };
        let _ = run_all(&orchestrator, ask("question"), run_options).await;

        let record = store.snapshot(&conversation).unwrap();
        assert_eq!(record.response_id.as_deref(), Some("msg_1"));
        assert!(record.reasoning_details.is_some());
        assert_eq!(record.reasoning_tokens, Some(7));
        assert_eq!(record.pending_artifacts, AssistantArtifacts::default());
        let artifacts = &record.artifacts[&2];
        assert_eq!(artifacts.tool_calls.len(), 1);
        assert_eq!(artifacts.tool_outputs[0].output, "result for x");
        assert_eq!(record.last_status, Some(CompletionStatus::Completed));
        assert_eq!(
            store.messages(&conversation),
            vec![Message::user("question"), Message::assistant("answer")]
        );
    }

    #[tokio::test]
    async fn usage_reported_before_error_final() {
        let model = ScriptedModel::new(vec![
            Turn::Events(vec![
                delta(0, Some("call_1"), Some("lookup"), "{}"),
                CanonicalEvent::Usage { usage: Usage::new(8, 2, None).with_reasoning_tokens(Some(1)) },
                CanonicalEvent::Done,
            ]),
            Turn::Fail(ProviderError::Stream("reset".into())),
        ]);
        let h = harness(model);
        let events = run_all(&h.orchestrator, ask("go"), options("req-1")).await;

        assert_eq!(kinds(&events), vec!["toolCall", "toolOutput", "error", "usage", "final", "done"]);
        assert_eq!(
            events[3],
            CanonicalEvent::Usage { usage: Usage::new(8, 2, None).with_reasoning_tokens(Some(1)) }
        );
    }

    #[tokio::test]
    async fn signed_reasoning_rides_on_the_assistant_turn() {
        let model = ScriptedModel::new(vec![
            Turn::Events(vec![
                CanonicalEvent::reasoning("need data"),
                CanonicalEvent::ConversationMeta {
                    response_id: None,
                    reasoning_details: Some(json!([{"type": "thinking", "thinking": "need data", "signature": "sig"}])),
                },
                delta(0, Some("call_1"), Some("lookup"), r#"{"q":"x"}"#),
                CanonicalEvent::Done,
            ]),
            text_turn("done"),
        ]);
        let h = harness(Arc::clone(&model));
        let _ = run_all(&h.orchestrator, ask("go"), options("req-1")).await;

        let second = &model.requests()[1].messages;
        assert_eq!(second[1].role, Role::Assistant);
        assert_eq!(
            second[1].reasoning_details,
            Some(json!([{"type": "thinking", "thinking": "need data", "signature": "sig"}]))
        );
        assert_eq!(second[0].reasoning_details, None);
    }

    #[tokio::test]
    async fn failure_is_marked_in_store() {
        let model = ScriptedModel::new(vec![Turn::Fail(ProviderError::Stream("bad".into()))]);
        let store = Arc::new(InMemoryConversationStore::new());
        let h = harness(model);
        let orchestrator = h.orchestrator.with_store(Arc::clone(&store) as Arc<dyn ConversationStore>);
        let conversation = ConversationId::from("conv-2");
        let run_options = RunOptions {
            conversation_id: Some(conversation.clone()),
            ..options("req-1")
        };
        let _ = run_all(&orchestrator, ask("q"), run_options).await;

        let record = store.snapshot(&conversation).unwrap();
        assert_eq!(record.errors, vec!["stream error: bad".to_owned()]);
        assert_eq!(record.last_status, Some(CompletionStatus::Error));
    }
}

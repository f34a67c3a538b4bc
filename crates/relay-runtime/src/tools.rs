//! Tool seam and registry.
//!
//! The orchestrator sees tools through two traits: [`ToolSpecSource`] lists
//! what the model may call, [`ToolExecutor`] runs a call by name. The
//! [`ToolRegistry`] implements both over a map of [`Tool`]s. A plain
//! `Vec<ToolSpec>` is also a [`ToolSpecSource`], for callers that only
//! advertise tools.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::ids::{ConversationId, ToolCallId};
use relay_core::request::ToolSpec;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::ToolError;

// ─────────────────────────────────────────────────────────────────────────────
// Seams
// ─────────────────────────────────────────────────────────────────────────────

/// Caller context handed to every execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    /// Call being answered.
    pub tool_call_id: ToolCallId,
    /// Conversation the call belongs to, when persisted.
    pub conversation_id: Option<ConversationId>,
    /// Fires when the orchestration is aborted.
    pub cancellation: CancellationToken,
}

/// Source of tool specs offered to the model.
pub trait ToolSpecSource: Send + Sync {
    /// Specs, in a stable order.
    fn list_specs(&self) -> Vec<ToolSpec>;
}

impl ToolSpecSource for Vec<ToolSpec> {
    fn list_specs(&self) -> Vec<ToolSpec> {
        self.clone()
    }
}

/// Runs tool calls by name.
#[async_trait]
pub trait ToolExecutor: ToolSpecSource {
    /// Execute `name` with raw argument JSON and return its textual output.
    async fn execute(&self, name: &str, arguments: &str, ctx: &ToolContext) -> Result<String, ToolError>;

    /// Time budget for `name`, when it differs from the caller's default.
    fn timeout_for(&self, _name: &str) -> Option<Duration> {
        None
    }
}

/// One executable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the model calls it by.
    fn name(&self) -> &str;

    /// Schema sent to the model.
    fn spec(&self) -> ToolSpec;

    /// Per-tool time budget overriding the orchestrator default.
    fn timeout_ms(&self) -> Option<u64> {
        None
    }

    /// Run with decoded arguments (always a JSON object).
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<String, ToolError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Name → [`Tool`] map. Read-only once built; share it behind an `Arc`.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.names()).finish()
    }
}

impl ToolRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        debug!(tool_name = tool.name(), "tool registered");
        let _ = self.tools.insert(tool.name().to_owned(), tool);
    }

    /// Look up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }
}

impl ToolSpecSource for ToolRegistry {
    fn list_specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, name: &str, arguments: &str, ctx: &ToolContext) -> Result<String, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::NotFound(name.to_owned()))?;
        let arguments = if arguments.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str::<Value>(arguments).map_err(|e| ToolError::InvalidArguments {
                message: e.to_string(),
            })?
        };
        if !arguments.is_object() {
            return Err(ToolError::InvalidArguments {
                message: "arguments must be a JSON object".into(),
            });
        }
        tool.execute(arguments, ctx).await
    }

    fn timeout_for(&self, name: &str) -> Option<Duration> {
        self.tools.get(name).and_then(|t| t.timeout_ms()).map(Duration::from_millis)
    }
}

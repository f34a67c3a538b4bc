//! # relay-runtime
//!
//! Drives one client-visible turn from request to `[DONE]`.
//!
//! - **Orchestrator**: model call → buffer tool-call deltas → execute tools → repeat, up to an iteration cap
//! - **Tools**: [`tools::ToolSpecSource`], [`tools::ToolExecutor`] and the [`tools::ToolRegistry`] of [`tools::Tool`]s
//! - **Diff**: reconciles a client's message list with stored history as an update/insert/truncate script
//! - **Persistence**: the [`persistence::ConversationStore`] seam and an in-memory implementation

#![deny(unsafe_code)]

pub mod diff;
pub mod errors;
pub mod orchestrator;
pub mod persistence;
pub mod tools;

pub use diff::{ArtifactDiff, AssistantArtifacts, DiffResult, compute_diff, diff_assistant_artifacts};
pub use errors::{StoreError, ToolError};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunOptions};
pub use persistence::{ConversationStore, InMemoryConversationStore, StoredMessage, sync_artifacts, sync_history};
pub use tools::{Tool, ToolContext, ToolExecutor, ToolRegistry, ToolSpecSource};

//! Conversation persistence seam.
//!
//! The orchestrator writes through [`ConversationStore`]: the history diff at
//! the start of a turn, then incremental setters as metadata appears
//! mid-stream. Tool calls and outputs belong to the assistant message in
//! progress until `finish_assistant` closes it. Stores serialize their own
//! writes per conversation.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::events::CompletionStatus;
use relay_core::ids::ConversationId;
use relay_core::messages::{Message, ToolCall, ToolOutput};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::diff::{ArtifactDiff, AssistantArtifacts, DiffResult, compute_diff, diff_assistant_artifacts};
use crate::errors::StoreError;

/// A persisted message and its sequence number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Position key, strictly increasing within a conversation.
    pub seq: u64,
    /// The message.
    pub message: Message,
}

/// Storage for one or more conversations.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Stored history, ordered by `seq`.
    async fn load_history(&self, conversation: &ConversationId) -> Result<Vec<StoredMessage>, StoreError>;

    /// Apply a non-fallback diff.
    async fn apply_diff(&self, conversation: &ConversationId, diff: &DiffResult) -> Result<(), StoreError>;

    /// Clear the history and write `messages` in order.
    async fn replace_history(&self, conversation: &ConversationId, messages: &[Message]) -> Result<(), StoreError>;

    /// Record the upstream response id.
    async fn set_response_id(&self, conversation: &ConversationId, response_id: &str) -> Result<(), StoreError>;

    /// Record opaque reasoning blocks.
    async fn set_reasoning_details(&self, conversation: &ConversationId, details: &Value) -> Result<(), StoreError>;

    /// Record reasoning token usage.
    async fn set_reasoning_tokens(&self, conversation: &ConversationId, tokens: u64) -> Result<(), StoreError>;

    /// Append consolidated tool calls to the assistant message in progress.
    async fn add_tool_calls(&self, conversation: &ConversationId, calls: &[ToolCall]) -> Result<(), StoreError>;

    /// Append tool outputs to the assistant message in progress.
    async fn add_tool_outputs(&self, conversation: &ConversationId, outputs: &[ToolOutput]) -> Result<(), StoreError>;

    /// Tool calls and outputs of the assistant message in progress.
    async fn load_artifacts(&self, conversation: &ConversationId) -> Result<AssistantArtifacts, StoreError>;

    /// Overwrite the tool calls and outputs of the assistant message in progress.
    async fn replace_artifacts(
        &self,
        conversation: &ConversationId,
        artifacts: &AssistantArtifacts,
    ) -> Result<(), StoreError>;

    /// Flag the current turn as failed.
    async fn mark_error(&self, conversation: &ConversationId, message: &str) -> Result<(), StoreError>;

    /// Persist the final assistant content and its status, closing the
    /// message in progress.
    async fn finish_assistant(
        &self,
        conversation: &ConversationId,
        content: &str,
        status: CompletionStatus,
    ) -> Result<(), StoreError>;
}

/// Reconcile `incoming` with what `store` holds, falling back to a full
/// rewrite when the diff is unsafe.
pub async fn sync_history(
    store: &dyn ConversationStore,
    conversation: &ConversationId,
    incoming: &[Message],
) -> Result<DiffResult, StoreError> {
    let existing = store.load_history(conversation).await?;
    let diff = compute_diff(&existing, incoming);
    if diff.fallback {
        warn!(
            conversation_id = %conversation,
            reason = diff.reason.as_deref().unwrap_or_default(),
            "history diff unsafe, rewriting"
        );
        store.replace_history(conversation, incoming).await?;
    } else if !diff.is_noop() {
        store.apply_diff(conversation, &diff).await?;
    }
    Ok(diff)
}

/// Reconcile the in-progress assistant artifacts with `incoming`.
///
/// Appended calls and outputs go through the incremental setters. In-place
/// edits and unsafe alignments replace the artifacts wholesale.
pub async fn sync_artifacts(
    store: &dyn ConversationStore,
    conversation: &ConversationId,
    incoming: &AssistantArtifacts,
) -> Result<ArtifactDiff, StoreError> {
    let stored = store.load_artifacts(conversation).await?;
    let diff = diff_assistant_artifacts(&stored, incoming);
    if diff.fallback || !diff.calls_to_update.is_empty() || !diff.outputs_to_update.is_empty() {
        if diff.fallback {
            warn!(
                conversation_id = %conversation,
                reason = diff.reason.as_deref().unwrap_or_default(),
                "artifact diff unsafe, replacing"
            );
        }
        store.replace_artifacts(conversation, incoming).await?;
        return Ok(diff);
    }
    if !diff.calls_to_insert.is_empty() {
        store.add_tool_calls(conversation, &diff.calls_to_insert).await?;
    }
    if !diff.outputs_to_insert.is_empty() {
        store.add_tool_outputs(conversation, &diff.outputs_to_insert).await?;
    }
    Ok(diff)
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

/// Everything stored for one conversation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationRecord {
    /// History, ordered by `seq`.
    pub messages: Vec<StoredMessage>,
    /// Next seq to assign.
    pub next_seq: u64,
    /// Last upstream response id.
    pub response_id: Option<String>,
    /// Last reasoning blocks.
    pub reasoning_details: Option<Value>,
    /// Last reasoning token count.
    pub reasoning_tokens: Option<u64>,
    /// Tool calls and outputs of the assistant message in progress.
    pub pending_artifacts: AssistantArtifacts,
    /// Artifacts of finished assistant messages, keyed by message seq.
    pub artifacts: BTreeMap<u64, AssistantArtifacts>,
    /// Error messages recorded by `mark_error`.
    pub errors: Vec<String>,
    /// Status of the last finished assistant turn.
    pub last_status: Option<CompletionStatus>,
    /// Number of full rewrites.
    pub rewrites: u32,
}

impl ConversationRecord {
    fn push(&mut self, message: Message) -> u64 {
        self.next_seq += 1;
        self.messages.push(StoredMessage {
            seq: self.next_seq,
            message,
        });
        self.next_seq
    }

    fn position_of(&self, seq: u64) -> Result<usize, StoreError> {
        self.messages
            .iter()
            .position(|m| m.seq == seq)
            .ok_or(StoreError::UnknownSeq(seq))
    }
}

/// [`ConversationStore`] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    records: Mutex<HashMap<ConversationId, ConversationRecord>>,
}

impl InMemoryConversationStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of one conversation's record.
    #[must_use]
    pub fn snapshot(&self, conversation: &ConversationId) -> Option<ConversationRecord> {
        self.records.lock().get(conversation).cloned()
    }

    /// Stored messages without their seqs.
    #[must_use]
    pub fn messages(&self, conversation: &ConversationId) -> Vec<Message> {
        self.records
            .lock()
            .get(conversation)
            .map(|r| r.messages.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    fn with_record<T>(&self, conversation: &ConversationId, f: impl FnOnce(&mut ConversationRecord) -> T) -> T {
        let mut records = self.records.lock();
        f(records.entry(conversation.clone()).or_default())
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load_history(&self, conversation: &ConversationId) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .records
            .lock()
            .get(conversation)
            .map(|r| r.messages.clone())
            .unwrap_or_default())
    }

    async fn apply_diff(&self, conversation: &ConversationId, diff: &DiffResult) -> Result<(), StoreError> {
        if diff.fallback {
            return Err(StoreError::FallbackRequired(diff.reason.clone().unwrap_or_default()));
        }
        self.with_record(conversation, |record| {
            let updates = diff
                .to_update
                .iter()
                .map(|update| Ok((record.position_of(update.seq)?, &update.message)))
                .collect::<Result<Vec<_>, StoreError>>()?;

            let Some(keep) = record.messages.len().checked_sub(diff.to_delete.len()) else {
                return Err(StoreError::NonContiguousDelete);
            };
            let suffix_matches = record.messages[keep..]
                .iter()
                .zip(&diff.to_delete)
                .all(|(stored, doomed)| stored.seq == doomed.seq);
            if !suffix_matches {
                return Err(StoreError::NonContiguousDelete);
            }

            // Validated; nothing below can fail.
            for (position, message) in updates {
                record.messages[position].message = message.clone();
            }
            record.messages.truncate(keep);
            for message in &diff.to_insert {
                let _ = record.push(message.clone());
            }
            debug!(
                conversation_id = %conversation,
                updated = diff.to_update.len(),
                inserted = diff.to_insert.len(),
                deleted = diff.to_delete.len(),
                "diff applied"
            );
            Ok(())
        })
    }

    async fn replace_history(&self, conversation: &ConversationId, messages: &[Message]) -> Result<(), StoreError> {
        self.with_record(conversation, |record| {
            record.messages.clear();
            record.rewrites += 1;
            for message in messages {
                let _ = record.push(message.clone());
            }
        });
        Ok(())
    }

    async fn set_response_id(&self, conversation: &ConversationId, response_id: &str) -> Result<(), StoreError> {
        self.with_record(conversation, |r| r.response_id = Some(response_id.to_owned()));
        Ok(())
    }

    async fn set_reasoning_details(&self, conversation: &ConversationId, details: &Value) -> Result<(), StoreError> {
        self.with_record(conversation, |r| r.reasoning_details = Some(details.clone()));
        Ok(())
    }

    async fn set_reasoning_tokens(&self, conversation: &ConversationId, tokens: u64) -> Result<(), StoreError> {
        self.with_record(conversation, |r| r.reasoning_tokens = Some(tokens));
        Ok(())
    }

    async fn add_tool_calls(&self, conversation: &ConversationId, calls: &[ToolCall]) -> Result<(), StoreError> {
        self.with_record(conversation, |r| r.pending_artifacts.tool_calls.extend_from_slice(calls));
        Ok(())
    }

    async fn add_tool_outputs(&self, conversation: &ConversationId, outputs: &[ToolOutput]) -> Result<(), StoreError> {
        self.with_record(conversation, |r| r.pending_artifacts.tool_outputs.extend_from_slice(outputs));
        Ok(())
    }

    async fn load_artifacts(&self, conversation: &ConversationId) -> Result<AssistantArtifacts, StoreError> {
        Ok(self
            .records
            .lock()
            .get(conversation)
            .map(|r| r.pending_artifacts.clone())
            .unwrap_or_default())
    }

    async fn replace_artifacts(
        &self,
        conversation: &ConversationId,
        artifacts: &AssistantArtifacts,
    ) -> Result<(), StoreError> {
        self.with_record(conversation, |r| r.pending_artifacts = artifacts.clone());
        Ok(())
    }

    async fn mark_error(&self, conversation: &ConversationId, message: &str) -> Result<(), StoreError> {
        self.with_record(conversation, |r| r.errors.push(message.to_owned()));
        Ok(())
    }

    async fn finish_assistant(
        &self,
        conversation: &ConversationId,
        content: &str,
        status: CompletionStatus,
    ) -> Result<(), StoreError> {
        self.with_record(conversation, |r| {
            let seq = r.push(Message::assistant(content));
            let artifacts = std::mem::take(&mut r.pending_artifacts);
            if !artifacts.tool_calls.is_empty() || !artifacts.tool_outputs.is_empty() {
                let _ = r.artifacts.insert(seq, artifacts);
            }
            r.last_status = Some(status);
        });
        Ok(())
    }
}

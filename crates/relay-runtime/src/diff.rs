//! # Message Diff
//!
//! Reconciles the message list a client sends with the history already
//! stored for the conversation, producing an update/insert/truncate script.
//!
//! Alignment is positional. Everything before the first differing position
//! (the anchor) is left alone. Past the anchor, overlapping positions become
//! updates, extra incoming messages become inserts and extra stored messages
//! become a trailing delete. Whenever the lists look reordered rather than
//! edited, extended or truncated, the result carries `fallback = true` and
//! the caller rewrites the whole history instead.

use std::collections::HashSet;

use relay_core::messages::{Message, ToolCall, ToolOutput};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::persistence::StoredMessage;

/// Edit script for one conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    /// Alignment is unsafe; clear and rewrite instead of applying the script.
    pub fallback: bool,
    /// Why `fallback` was set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// First position where the two lists differ.
    pub anchor_offset: usize,
    /// Stored positions whose content changed, carrying the new message.
    pub to_update: Vec<StoredMessage>,
    /// Messages to append after the stored history.
    pub to_insert: Vec<Message>,
    /// Trailing stored messages to remove.
    pub to_delete: Vec<StoredMessage>,
}

impl DiffResult {
    fn fallback(anchor_offset: usize, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        debug!(anchor_offset, reason = %reason, "diff fell back to full rewrite");
        Self {
            fallback: true,
            reason: Some(reason),
            anchor_offset,
            ..Self::default()
        }
    }

    /// Nothing to write.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        !self.fallback && self.to_update.is_empty() && self.to_insert.is_empty() && self.to_delete.is_empty()
    }
}

/// Diff `incoming` against `existing`.
///
/// `existing` must be ordered by strictly increasing `seq`; anything else
/// yields a fallback.
#[must_use]
pub fn compute_diff(existing: &[StoredMessage], incoming: &[Message]) -> DiffResult {
    if existing.windows(2).any(|w| w[0].seq >= w[1].seq) {
        return DiffResult::fallback(0, "stored history is not ordered by seq");
    }

    let overlap = existing.len().min(incoming.len());
    let anchor = (0..overlap)
        .find(|&i| !existing[i].message.same_content(&incoming[i]))
        .unwrap_or(overlap);

    let differs = |i: usize| i >= overlap || !existing[i].message.same_content(&incoming[i]);
    let changed_stored: Vec<usize> = (anchor..existing.len()).filter(|&j| differs(j)).collect();
    let changed_incoming: Vec<usize> = (anchor..incoming.len()).filter(|&k| differs(k)).collect();

    // A changed incoming message that matches a stored message at another
    // changed position means the client moved it.
    for &k in &changed_incoming {
        if let Some(&j) = changed_stored
            .iter()
            .find(|&&j| j != k && existing[j].message.same_content(&incoming[k]))
        {
            return DiffResult::fallback(anchor, format!("message at position {k} was moved from position {j}"));
        }
    }

    let to_update = (anchor..overlap)
        .filter(|&i| differs(i))
        .map(|i| StoredMessage {
            seq: existing[i].seq,
            message: incoming[i].clone(),
        })
        .collect();

    DiffResult {
        fallback: false,
        reason: None,
        anchor_offset: anchor,
        to_update,
        to_insert: incoming[overlap..].to_vec(),
        to_delete: existing[overlap..].to_vec(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Assistant artifacts
// ─────────────────────────────────────────────────────────────────────────────

/// Tool calls and outputs attached to one assistant message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantArtifacts {
    /// Calls, in emission order.
    pub tool_calls: Vec<ToolCall>,
    /// Outputs, in call order.
    pub tool_outputs: Vec<ToolOutput>,
}

/// Edit script for one message's artifacts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDiff {
    /// Replace all artifacts of the message instead of applying the script.
    pub fallback: bool,
    /// Why `fallback` was set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Calls whose name or arguments changed.
    pub calls_to_update: Vec<ToolCall>,
    /// New trailing calls.
    pub calls_to_insert: Vec<ToolCall>,
    /// Outputs whose text or status changed.
    pub outputs_to_update: Vec<ToolOutput>,
    /// New trailing outputs.
    pub outputs_to_insert: Vec<ToolOutput>,
}

impl ArtifactDiff {
    fn fallback(reason: impl Into<String>) -> Self {
        Self {
            fallback: true,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Align two lists by key at each position. Returns `(updates, inserts)`, or
/// the reason alignment failed.
fn align<T: Clone, K: PartialEq + std::fmt::Debug>(
    stored: &[T],
    incoming: &[T],
    key: impl Fn(&T) -> K,
    same: impl Fn(&T, &T) -> bool,
) -> Result<(Vec<T>, Vec<T>), String> {
    if incoming.len() < stored.len() {
        return Err(format!("{} stored entries removed", stored.len() - incoming.len()));
    }
    let mut updates = Vec::new();
    for (i, (old, new)) in stored.iter().zip(incoming).enumerate() {
        if key(old) != key(new) {
            return Err(format!("id mismatch at position {i}: {:?} vs {:?}", key(old), key(new)));
        }
        if !same(old, new) {
            updates.push(new.clone());
        }
    }
    Ok((updates, incoming[stored.len()..].to_vec()))
}

/// Diff the artifacts of one assistant message.
#[must_use]
pub fn diff_assistant_artifacts(stored: &AssistantArtifacts, incoming: &AssistantArtifacts) -> ArtifactDiff {
    let call_ids: HashSet<&str> = incoming.tool_calls.iter().map(|c| c.id.as_str()).collect();
    if let Some(orphan) = incoming
        .tool_outputs
        .iter()
        .find(|o| !call_ids.contains(o.tool_call_id.as_str()))
    {
        return ArtifactDiff::fallback(format!("output for unknown call {}", orphan.tool_call_id));
    }

    let calls = align(
        &stored.tool_calls,
        &incoming.tool_calls,
        |c| c.id.clone(),
        ToolCall::same_call,
    );
    let outputs = align(
        &stored.tool_outputs,
        &incoming.tool_outputs,
        |o| o.tool_call_id.clone(),
        |a, b| a.output == b.output && a.status == b.status,
    );

    match (calls, outputs) {
        (Ok((calls_to_update, calls_to_insert)), Ok((outputs_to_update, outputs_to_insert))) => ArtifactDiff {
            fallback: false,
            reason: None,
            calls_to_update,
            calls_to_insert,
            outputs_to_update,
            outputs_to_insert,
        },
        (Err(reason), _) => ArtifactDiff::fallback(format!("tool calls: {reason}")),
        (_, Err(reason)) => ArtifactDiff::fallback(format!("tool outputs: {reason}")),
    }
}

//! Runtime error types.

/// Errors raised by tool execution.
///
/// None of these abort an orchestration: each becomes a tool output that is
/// fed back to the model.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// No tool with this name is registered.
    #[error("unknown tool: {0}")]
    NotFound(String),

    /// Arguments did not decode or failed validation.
    #[error("invalid arguments: {message}")]
    InvalidArguments {
        /// What was wrong.
        message: String,
    },

    /// The tool ran and failed.
    #[error("{0}")]
    Execution(String),

    /// The tool exceeded its time budget.
    #[error("timed out after {timeout_ms}ms")]
    Timeout {
        /// Budget in milliseconds.
        timeout_ms: u64,
    },

    /// The orchestration was cancelled while the tool ran.
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    /// Whether running the tool again could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Execution(_))
    }

    /// Category string for logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArguments { .. } => "validation",
            Self::Execution(_) => "execution",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Errors raised by a conversation store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The diff asked for a clear-and-rewrite; call `replace_history` instead.
    #[error("diff requires full rewrite: {0}")]
    FallbackRequired(String),

    /// A referenced sequence number is not stored.
    #[error("unknown message seq {0}")]
    UnknownSeq(u64),

    /// Deletions were not a trailing run of the history.
    #[error("deletion is not a contiguous suffix")]
    NonContiguousDelete,

    /// Storage backend failure.
    #[error("store backend: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the same write could succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// Category string for logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::FallbackRequired(_) => "fallback",
            Self::UnknownSeq(_) | Self::NonContiguousDelete => "consistency",
            Self::Backend(_) => "backend",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_error_messages() {
        assert_eq!(ToolError::NotFound("x".into()).to_string(), "unknown tool: x");
        assert_eq!(ToolError::Timeout { timeout_ms: 5 }.to_string(), "timed out after 5ms");
        assert_eq!(ToolError::Execution("boom".into()).to_string(), "boom");
    }

    #[test]
    fn categories() {
        assert_eq!(ToolError::Cancelled.category(), "cancelled");
        assert!(!ToolError::NotFound("x".into()).is_retryable());
        assert_eq!(StoreError::NonContiguousDelete.category(), "consistency");
        assert!(StoreError::Backend("disk".into()).is_retryable());
    }
}

//! Runtime error types.

use pulse_core::ids::RunId;

/// Maximum length of an error message surfaced in a terminal event.
const MAX_SURFACED_LEN: usize = 240;

/// Errors that can occur during agent execution.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Execution was cancelled via its cancellation token.
    #[error("execution cancelled")]
    Cancelled,

    /// Execution exceeded its tier timeout ceiling.
    #[error("execution timed out after {limit_ms}ms")]
    Timeout {
        /// The tier ceiling that was exceeded.
        limit_ms: u64,
    },

    /// The spawned task panicked.
    #[error("execution panicked: {0}")]
    Panicked(String),

    /// The agent reported a failure.
    #[error("agent error: {0}")]
    Agent(String),

    /// Run not found in the active set.
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Internal / unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Error category string for event emission and metrics labels.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Panicked(_) => "panicked",
            Self::Agent(_) => "agent",
            Self::RunNotFound(_) => "run_not_found",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the caller can reasonably retry the run.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout { .. })
    }

    /// Single-line, length-bounded message safe to surface to clients.
    ///
    /// Internal detail (panic payloads, multi-line traces) is cut at the
    /// first newline and truncated.
    #[must_use]
    pub fn sanitized(&self) -> String {
        let full = self.to_string();
        let line = full.lines().next().unwrap_or_default();
        let mut out: String = line.chars().take(MAX_SURFACED_LEN).collect();
        if line.chars().count() > MAX_SURFACED_LEN {
            out.push_str("...");
        }
        out
    }
}

//! Execution request, run, and result types.

use pulse_core::config::ExecutionConfig;
use pulse_core::ids::{RunId, ThreadId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Billing tier of the requesting user, mapped to a timeout ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    /// Free plan.
    Free,
    /// Paid plan.
    Paid,
}

impl PlanTier {
    /// Timeout ceiling for this tier.
    #[must_use]
    pub fn timeout_ms(self, config: &ExecutionConfig) -> u64 {
        match self {
            Self::Free => config.free_tier_timeout_ms,
            Self::Paid => config.paid_tier_timeout_ms,
        }
    }
}

/// One request to execute an agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Unique run identifier, assigned by the caller.
    pub run_id: RunId,
    /// Conversation thread the run belongs to.
    pub thread_id: ThreadId,
    /// Name of the agent to run.
    pub agent_name: String,
    /// Agent input.
    pub input: Value,
    /// Billing tier, selects the timeout ceiling.
    pub tier: PlanTier,
    /// Times this run has been re-submitted after a recoverable failure.
    #[serde(default)]
    pub retry_count: u32,
}

/// Phase of one execution.
///
/// `Initializing → Running → {Completed | Failed | TimedOut}`; terminal
/// phases have no outgoing transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ExecutionPhase {
    /// Admitted, not yet running.
    Initializing = 0,
    /// Agent work in progress.
    Running = 1,
    /// Finished successfully.
    Completed = 2,
    /// Finished with an error.
    Failed = 3,
    /// Cancelled at the tier timeout ceiling.
    TimedOut = 4,
}

impl ExecutionPhase {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            4 => Self::TimedOut,
            _ => Self::Initializing,
        }
    }

    /// Whether this phase ends the run.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Stable lowercase label for logging and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Completed (or failed) run record, archived into the per-user history.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRun {
    /// Run identifier.
    pub run_id: RunId,
    /// Owning user.
    pub user_id: UserId,
    /// Conversation thread.
    pub thread_id: ThreadId,
    /// Executed agent.
    pub agent_name: String,
    /// Terminal phase the run ended in.
    pub phase: ExecutionPhase,
    /// Wall-clock start, float seconds since the epoch.
    pub started_at: f64,
    /// Wall-clock finish, float seconds since the epoch.
    pub finished_at: f64,
    /// Time spent waiting for a concurrency slot.
    pub queue_wait_ms: u64,
    /// Running time, admission to terminal phase.
    pub duration_ms: u64,
    /// Times the caller re-submitted this run after a recoverable failure.
    #[serde(default)]
    pub retry_count: u32,
    /// Whether the run hit its tier timeout ceiling.
    pub timed_out: bool,
    /// Sanitized error message for failed runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of [`crate::engine::ExecutionEngine::execute`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Run identifier.
    pub run_id: RunId,
    /// Whether the run completed successfully.
    pub success: bool,
    /// Agent response, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Sanitized error message, present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time spent waiting for a concurrency slot.
    pub queue_wait_ms: u64,
    /// Running time, admission to terminal phase.
    pub duration_ms: u64,
    /// Whether the run hit its tier timeout ceiling.
    pub timed_out: bool,
}

/// Aggregated per-user execution statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserExecutionStats {
    /// Terminal runs observed.
    pub total_runs: u64,
    /// Successful runs.
    pub completed: u64,
    /// Failed runs (timeouts excluded).
    pub failed: u64,
    /// Timed-out runs.
    pub timed_out: u64,
    /// Currently executing or queued runs.
    pub active: usize,
    /// Total time spent queued across terminal runs.
    pub total_queue_wait_ms: u64,
    /// Total running time across terminal runs.
    pub total_duration_ms: u64,
}

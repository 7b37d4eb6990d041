//! Agent task boundary and mid-run progress reporting.

use std::sync::Arc;

use async_trait::async_trait;
use pulse_core::events::EventPayload;
use pulse_core::ids::{RunId, ThreadId, UserId};
use pulse_gateway::EventEmitter;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::RuntimeError;

/// The work executed inside one run.
///
/// Implementations must watch `ctx.cancel` and return
/// [`RuntimeError::Cancelled`] promptly when it fires; the engine cancels
/// the token at the tier timeout ceiling and on explicit aborts.
#[async_trait]
pub trait AgentTask: Send + Sync {
    /// Execute the agent, reporting progress through `ctx.progress`.
    async fn run(&self, ctx: &AgentContext) -> Result<Value, RuntimeError>;
}

/// Everything a task may touch during its run.
pub struct AgentContext {
    /// Owning user.
    pub user_id: UserId,
    /// Run identifier.
    pub run_id: RunId,
    /// Conversation thread.
    pub thread_id: ThreadId,
    /// Fired on timeout or abort.
    pub cancel: CancellationToken,
    /// Mid-run progress events, fanned out to the user's live connections.
    pub progress: ProgressSink,
}

/// Emits mid-run critical events for one run.
///
/// Targets are resolved against the user's live connections at each call,
/// so connections opened mid-run receive subsequent events.
#[derive(Clone)]
pub struct ProgressSink {
    emitter: Arc<EventEmitter>,
    run_id: RunId,
}

impl ProgressSink {
    /// Bind a sink to a run.
    #[must_use]
    pub fn new(emitter: Arc<EventEmitter>, run_id: RunId) -> Self {
        Self { emitter, run_id }
    }

    /// Report intermediate reasoning.
    pub async fn thinking(&self, reasoning: impl Into<String>) -> bool {
        self.emitter
            .emit(
                &self.run_id,
                EventPayload::AgentThinking {
                    reasoning: reasoning.into(),
                },
            )
            .await
    }

    /// Report that a tool invocation has begun.
    pub async fn tool_started(&self, tool_name: impl Into<String>) -> bool {
        self.emitter
            .emit(
                &self.run_id,
                EventPayload::ToolExecuting {
                    tool_name: tool_name.into(),
                },
            )
            .await
    }

    /// Report the result of a tool invocation.
    pub async fn tool_completed(
        &self,
        tool_name: impl Into<String>,
        results: Value,
        success: bool,
    ) -> bool {
        self.emitter
            .emit(
                &self.run_id,
                EventPayload::ToolCompleted {
                    tool_name: tool_name.into(),
                    results,
                    success,
                },
            )
            .await
    }
}

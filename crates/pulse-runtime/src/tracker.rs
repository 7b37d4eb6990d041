//! Per-run phase tracking and terminal event emission.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use pulse_core::events::{self, EventPayload};
use pulse_core::ids::{RunId, UserId};
use pulse_gateway::EventEmitter;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::RuntimeError;
use crate::types::ExecutionPhase;

/// Drives one run through `Initializing → Running → terminal` and emits the
/// matching critical events.
///
/// Phase transitions are CAS-guarded: exactly one terminal transition wins,
/// so exactly one `agent_completed` is emitted per run no matter how the
/// run ends or how many paths race to end it.
pub struct ExecutionTracker {
    user_id: UserId,
    run_id: RunId,
    emitter: Arc<EventEmitter>,
    phase: AtomicU8,
}

impl ExecutionTracker {
    /// Create a tracker in `Initializing`.
    #[must_use]
    pub fn new(user_id: UserId, run_id: RunId, emitter: Arc<EventEmitter>) -> Self {
        Self {
            user_id,
            run_id,
            emitter,
            phase: AtomicU8::new(ExecutionPhase::Initializing as u8),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> ExecutionPhase {
        ExecutionPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Transition `Initializing → Running` and emit `agent_started`.
    ///
    /// Returns `false` if the run already left `Initializing`.
    pub async fn start(&self, agent_name: &str) -> bool {
        if !self.transition(ExecutionPhase::Initializing, ExecutionPhase::Running) {
            return false;
        }
        debug!(run_id = %self.run_id, agent_name, "run started");
        let _ = self
            .emit(EventPayload::AgentStarted {
                agent_name: agent_name.to_owned(),
            })
            .await;
        true
    }

    /// Terminal success. Emits `agent_completed` with the response.
    pub async fn complete(&self, response: Value) -> bool {
        if !self.transition(ExecutionPhase::Running, ExecutionPhase::Completed) {
            return false;
        }
        debug!(run_id = %self.run_id, "run completed");
        let _ = self.emit(events::completed(response)).await;
        true
    }

    /// Terminal failure. Emits `agent_completed` with the sanitized error.
    pub async fn fail(&self, error: &RuntimeError) -> bool {
        if !self.terminal_from_live(ExecutionPhase::Failed) {
            return false;
        }
        warn!(
            run_id = %self.run_id,
            category = error.category(),
            error = %error,
            "run failed"
        );
        let _ = self.emit(events::failed(error.sanitized())).await;
        true
    }

    /// Terminal timeout. Emits `agent_completed` with the timeout message.
    pub async fn timed_out(&self, limit_ms: u64) -> bool {
        if !self.terminal_from_live(ExecutionPhase::TimedOut) {
            return false;
        }
        warn!(run_id = %self.run_id, limit_ms, "run timed out");
        let error = RuntimeError::Timeout { limit_ms };
        let _ = self.emit(events::failed(error.sanitized())).await;
        true
    }

    fn transition(&self, from: ExecutionPhase, to: ExecutionPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move to a terminal phase from either live phase. A run that never
    /// started (spawn failed) still gets its terminal event.
    fn terminal_from_live(&self, to: ExecutionPhase) -> bool {
        self.transition(ExecutionPhase::Running, to)
            || self.transition(ExecutionPhase::Initializing, to)
    }

    async fn emit(&self, payload: EventPayload) -> bool {
        self.emitter.emit(&self.run_id, payload).await
    }

    /// Owning user.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

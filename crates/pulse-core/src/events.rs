//! Critical progress events and their wire envelope.
//!
//! Every executed run produces an ordered sequence of critical events:
//! exactly one `agent_started`, zero or more `agent_thinking` /
//! `tool_executing` / `tool_completed` in emission order, and exactly one
//! terminal `agent_completed` regardless of success or failure.
//!
//! Events are created by the gateway's emitter, never mutated, and dropped
//! after the delivery attempt — this subsystem does not persist them.
//!
//! The wire format is a JSON envelope:
//! `{"type", "user_id", "run_id", "timestamp", "data"}` with `timestamp` as
//! float seconds since the Unix epoch.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ids::{RunId, UserId};

/// Payload of one critical progress event.
///
/// The five variants form the mandatory notification contract for any
/// execution (see [`CriticalEvent`] for the envelope).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Run admitted and starting. Emitted exactly once per run.
    AgentStarted {
        /// Name of the agent being executed.
        agent_name: String,
    },

    /// Intermediate reasoning produced by the running agent.
    AgentThinking {
        /// Reasoning text fragment.
        reasoning: String,
    },

    /// A tool invocation has begun.
    ToolExecuting {
        /// Tool name.
        tool_name: String,
    },

    /// A tool invocation finished.
    ToolCompleted {
        /// Tool name.
        tool_name: String,
        /// Tool output.
        results: Value,
        /// Whether the tool succeeded.
        success: bool,
    },

    /// Terminal event. Emitted exactly once per run, success or not.
    AgentCompleted {
        /// Final agent response (absent on failure).
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
        /// Whether the run succeeded.
        success: bool,
        /// Sanitized error message on failure.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl EventPayload {
    /// Wire `type` string for this payload.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AgentStarted { .. } => "agent_started",
            Self::AgentThinking { .. } => "agent_thinking",
            Self::ToolExecuting { .. } => "tool_executing",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::AgentCompleted { .. } => "agent_completed",
        }
    }

    /// Whether this payload terminates its run's event sequence.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AgentCompleted { .. })
    }

    /// Wire `data` object: the variant fields without the tag.
    #[must_use]
    pub fn data(&self) -> Value {
        match self {
            Self::AgentStarted { agent_name } => json!({ "agent_name": agent_name }),
            Self::AgentThinking { reasoning } => json!({ "reasoning": reasoning }),
            Self::ToolExecuting { tool_name } => json!({ "tool_name": tool_name }),
            Self::ToolCompleted {
                tool_name,
                results,
                success,
            } => json!({ "tool_name": tool_name, "results": results, "success": success }),
            Self::AgentCompleted {
                response,
                success,
                error,
            } => {
                let mut data = json!({ "success": success });
                if let Some(r) = response {
                    data["response"] = r.clone();
                }
                if let Some(e) = error {
                    data["error"] = json!(e);
                }
                data
            }
        }
    }
}

/// One critical event bound to a user and run.
///
/// Immutable once built. `sequence` is monotonically increasing per run,
/// assigned by the emitter at creation time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CriticalEvent {
    /// Owning user.
    pub user_id: UserId,
    /// Originating run.
    pub run_id: RunId,
    /// Per-run monotone sequence number.
    pub sequence: u64,
    /// Wall-clock creation time, float seconds since the Unix epoch.
    pub timestamp: f64,
    /// Event payload.
    pub payload: EventPayload,
}

impl CriticalEvent {
    /// Build an event stamped with the current wall clock.
    #[must_use]
    pub fn new(user_id: UserId, run_id: RunId, sequence: u64, payload: EventPayload) -> Self {
        Self {
            user_id,
            run_id,
            sequence,
            timestamp: now_secs(),
            payload,
        }
    }

    /// Wire `type` string.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    /// Whether this event terminates its run's sequence.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }

    /// Build the JSON wire envelope.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        json!({
            "type": self.event_type(),
            "user_id": self.user_id.as_str(),
            "run_id": self.run_id.as_str(),
            "timestamp": self.timestamp,
            "data": self.payload.data(),
        })
    }
}

/// Current wall clock as float seconds since the Unix epoch.
#[must_use]
pub fn now_secs() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_micros() as f64 / 1_000_000.0
}

/// Terminal success payload.
#[must_use]
pub fn completed(response: Value) -> EventPayload {
    EventPayload::AgentCompleted {
        response: Some(response),
        success: true,
        error: None,
    }
}

/// Terminal failure payload with a sanitized error message.
#[must_use]
pub fn failed(error: impl Into<String>) -> EventPayload {
    EventPayload::AgentCompleted {
        response: None,
        success: false,
        error: Some(error.into()),
    }
}

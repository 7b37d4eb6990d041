//! # pulse-runtime
//!
//! Concurrency-bounded agent execution with per-user isolation.
//!
//! - **[`agent`]**: the [`AgentTask`] boundary and mid-run progress sink
//! - **[`tracker`]**: per-run phase machine, one terminal event per run
//! - **[`engine`]**: per-user semaphore-bounded execution with tier
//!   timeouts and a bounded run history
//! - **[`manager`]**: lazy per-user engine map, the runtime's entry point
//!
//! Every engine owns its state exclusively; users never share an engine,
//! a semaphore, or a history ring.

#![deny(unsafe_code)]

pub mod agent;
pub mod engine;
pub mod errors;
pub mod manager;
pub mod tracker;
pub mod types;

pub use agent::{AgentContext, AgentTask, ProgressSink};
pub use engine::ExecutionEngine;
pub use errors::RuntimeError;
pub use manager::ExecutionManager;
pub use tracker::ExecutionTracker;
pub use types::{
    ExecutionPhase, ExecutionRequest, ExecutionResult, ExecutionRun, PlanTier, UserExecutionStats,
};

//! Per-user engine map and the runtime's public entry points.

use std::sync::Arc;

use dashmap::DashMap;
use metrics::gauge;
use pulse_core::config::PulseConfig;
use pulse_core::ids::UserId;
use pulse_gateway::Gateway;
use tracing::{debug, info};

use crate::agent::AgentTask;
use crate::engine::ExecutionEngine;
use crate::types::{ExecutionRequest, ExecutionResult, UserExecutionStats};

/// Creates and owns one [`ExecutionEngine`] per user.
///
/// Constructed explicitly and injected wherever execution is needed; there
/// is no global instance. Engines are created lazily on a user's first run
/// and are never shared across users.
pub struct ExecutionManager {
    engines: DashMap<UserId, Arc<ExecutionEngine>>,
    gateway: Arc<Gateway>,
    config: PulseConfig,
}

impl ExecutionManager {
    /// Create a manager wired to the gateway for event delivery.
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, config: PulseConfig) -> Self {
        Self {
            engines: DashMap::new(),
            gateway,
            config,
        }
    }

    /// Execute a run for a user, creating their engine on first use.
    pub async fn execute_agent(
        &self,
        user_id: &UserId,
        request: ExecutionRequest,
        task: Arc<dyn AgentTask>,
    ) -> ExecutionResult {
        self.engine(user_id).execute(request, task).await
    }

    /// A user's execution statistics. Zeroes for users with no engine.
    #[must_use]
    pub fn get_user_execution_stats(&self, user_id: &UserId) -> UserExecutionStats {
        self.engines
            .get(user_id)
            .map(|engine| engine.get_stats())
            .unwrap_or_default()
    }

    /// Tear down a user's engine: cancel in-flight runs, drop state.
    ///
    /// Returns whether the user had an engine. Idempotent.
    pub fn cleanup(&self, user_id: &UserId) -> bool {
        let Some((_, engine)) = self.engines.remove(user_id) else {
            return false;
        };
        engine.cleanup();
        gauge!("runtime_engines_active").set(self.engines.len() as f64);
        info!(user_id = %user_id, "user engine removed");
        true
    }

    /// Number of users with an engine.
    #[must_use]
    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    /// The gateway this runtime delivers events through.
    #[must_use]
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    fn engine(&self, user_id: &UserId) -> Arc<ExecutionEngine> {
        let engine = self
            .engines
            .entry(user_id.clone())
            .or_insert_with(|| {
                debug!(user_id = %user_id, "engine created");
                Arc::new(ExecutionEngine::new(
                    user_id.clone(),
                    self.config.execution.clone(),
                    self.gateway.emitter(user_id),
                ))
            })
            .clone();
        gauge!("runtime_engines_active").set(self.engines.len() as f64);
        engine
    }
}

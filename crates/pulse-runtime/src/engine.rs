//! Per-user execution engine with bounded concurrency.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use pulse_core::config::ExecutionConfig;
use pulse_core::events::now_secs;
use pulse_core::ids::{RunId, UserId};
use pulse_gateway::EventEmitter;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentContext, AgentTask, ProgressSink};
use crate::errors::RuntimeError;
use crate::tracker::ExecutionTracker;
use crate::types::{ExecutionRequest, ExecutionResult, ExecutionRun, UserExecutionStats};

/// One in-flight run.
struct ActiveRun {
    cancel: CancellationToken,
    /// RAII concurrency slot, released when the run leaves `active`.
    _permit: OwnedSemaphorePermit,
}

/// Executes one user's agent runs under a concurrency bound.
///
/// All state (`active`, `history`, `stats`) is owned exclusively by this
/// instance, and every [`ExecutionManager`](crate::manager::ExecutionManager)
/// creates one engine per user: tenant isolation holds by construction.
pub struct ExecutionEngine {
    user_id: UserId,
    config: ExecutionConfig,
    emitter: Arc<EventEmitter>,
    semaphore: Arc<Semaphore>,
    active: Mutex<HashMap<RunId, ActiveRun>>,
    history: Mutex<VecDeque<ExecutionRun>>,
    stats: Mutex<UserExecutionStats>,
}

impl ExecutionEngine {
    /// Create an engine for one user.
    #[must_use]
    pub fn new(user_id: UserId, config: ExecutionConfig, emitter: Arc<EventEmitter>) -> Self {
        let slots = config.max_concurrent_agents;
        Self {
            user_id,
            config,
            emitter,
            semaphore: Arc::new(Semaphore::new(slots)),
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            stats: Mutex::new(UserExecutionStats::default()),
        }
    }

    /// Execute a run to its terminal phase.
    ///
    /// Queues on the concurrency semaphore (admission blocks, wait time is
    /// recorded), runs the task under the tier timeout ceiling, and emits
    /// the run's critical events along the way. Never returns early: the
    /// result always reflects a terminal phase and the matching
    /// `agent_completed` has been emitted.
    #[instrument(skip(self, request, task), fields(user_id = %self.user_id, run_id = %request.run_id))]
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        task: Arc<dyn AgentTask>,
    ) -> ExecutionResult {
        let queue_start = Instant::now();
        let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            // Only possible after cleanup() closed the semaphore.
            return self.rejected(&request).await;
        };
        let queue_wait_ms = queue_start.elapsed().as_millis() as u64;
        histogram!("engine_queue_wait_ms").record(queue_wait_ms as f64);

        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock();
            let _ = active.insert(
                request.run_id.clone(),
                ActiveRun {
                    cancel: cancel.clone(),
                    _permit: permit,
                },
            );
            gauge!("engine_runs_active").set(active.len() as f64);
        }

        let started_at = now_secs();
        let tracker = ExecutionTracker::new(
            self.user_id.clone(),
            request.run_id.clone(),
            Arc::clone(&self.emitter),
        );
        let _ = tracker.start(&request.agent_name).await;
        let run_start = Instant::now();

        let ctx = AgentContext {
            user_id: self.user_id.clone(),
            run_id: request.run_id.clone(),
            thread_id: request.thread_id.clone(),
            cancel: cancel.clone(),
            progress: ProgressSink::new(Arc::clone(&self.emitter), request.run_id.clone()),
        };
        let mut handle = tokio::spawn(async move { task.run(&ctx).await });

        let limit_ms = request.tier.timeout_ms(&self.config);
        let limit = Duration::from_millis(limit_ms);
        let (response, error, timed_out) = match tokio::time::timeout(limit, &mut handle).await {
            Ok(Ok(Ok(value))) => {
                let _ = tracker.complete(value.clone()).await;
                (Some(value), None, false)
            }
            Ok(Ok(Err(err))) => {
                let _ = tracker.fail(&err).await;
                (None, Some(err.sanitized()), false)
            }
            Ok(Err(join_err)) => {
                let err = classify_join_error(join_err);
                let _ = tracker.fail(&err).await;
                (None, Some(err.sanitized()), false)
            }
            Err(_) => {
                cancel.cancel();
                handle.abort();
                let _ = tracker.timed_out(limit_ms).await;
                let err = RuntimeError::Timeout { limit_ms };
                (None, Some(err.sanitized()), true)
            }
        };

        let duration_ms = run_start.elapsed().as_millis() as u64;
        let finished_at = now_secs();
        let phase = tracker.phase();

        {
            let mut active = self.active.lock();
            // Dropping the entry releases the permit, exactly once.
            let _ = active.remove(&request.run_id);
            gauge!("engine_runs_active").set(active.len() as f64);
        }

        let run = ExecutionRun {
            run_id: request.run_id.clone(),
            user_id: self.user_id.clone(),
            thread_id: request.thread_id,
            agent_name: request.agent_name,
            phase,
            started_at,
            finished_at,
            queue_wait_ms,
            duration_ms,
            retry_count: request.retry_count,
            timed_out,
            error: error.clone(),
        };
        self.archive(run);

        counter!("engine_runs_total", "outcome" => phase.as_str()).increment(1);
        histogram!("engine_run_duration_ms").record(duration_ms as f64);
        debug!(
            run_id = %request.run_id,
            outcome = phase.as_str(),
            queue_wait_ms,
            duration_ms,
            "run finished"
        );

        ExecutionResult {
            run_id: request.run_id,
            success: error.is_none(),
            response,
            error,
            queue_wait_ms,
            duration_ms,
            timed_out,
        }
    }

    /// Cancel an in-flight run. Returns whether the run was active.
    pub fn cancel_run(&self, run_id: &RunId) -> bool {
        let active = self.active.lock();
        if let Some(run) = active.get(run_id) {
            warn!(run_id = %run_id, "run cancellation requested");
            run.cancel.cancel();
            true
        } else {
            false
        }
    }

    /// Number of runs currently holding or queued for a slot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Aggregated statistics, with the live active count.
    #[must_use]
    pub fn get_stats(&self) -> UserExecutionStats {
        let mut stats = self.stats.lock().clone();
        stats.active = self.active_count();
        stats
    }

    /// Terminal run records, oldest first, capped at `max_history_size`.
    #[must_use]
    pub fn history(&self) -> Vec<ExecutionRun> {
        self.history.lock().iter().cloned().collect()
    }

    /// Cancel all in-flight runs, reject queued admissions, and drop
    /// history and statistics. The engine is unusable afterwards.
    pub fn cleanup(&self) {
        info!(user_id = %self.user_id, "engine cleanup");
        self.semaphore.close();
        {
            let active = self.active.lock();
            for run in active.values() {
                run.cancel.cancel();
            }
        }
        self.history.lock().clear();
        *self.stats.lock() = UserExecutionStats::default();
    }

    /// Owning user.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn archive(&self, run: ExecutionRun) {
        {
            let mut stats = self.stats.lock();
            stats.total_runs += 1;
            if run.timed_out {
                stats.timed_out += 1;
            } else if run.error.is_some() {
                stats.failed += 1;
            } else {
                stats.completed += 1;
            }
            stats.total_queue_wait_ms += run.queue_wait_ms;
            stats.total_duration_ms += run.duration_ms;
        }
        let mut history = self.history.lock();
        if history.len() >= self.config.max_history_size {
            let _ = history.pop_front();
        }
        history.push_back(run);
    }

    /// Admission failed because the engine is shutting down. Still emits a
    /// terminal event so no run ends silently.
    async fn rejected(&self, request: &ExecutionRequest) -> ExecutionResult {
        let tracker = ExecutionTracker::new(
            self.user_id.clone(),
            request.run_id.clone(),
            Arc::clone(&self.emitter),
        );
        let err = RuntimeError::Internal("engine shutting down".into());
        let _ = tracker.fail(&err).await;
        ExecutionResult {
            run_id: request.run_id.clone(),
            success: false,
            response: None,
            error: Some(err.sanitized()),
            queue_wait_ms: 0,
            duration_ms: 0,
            timed_out: false,
        }
    }
}

fn classify_join_error(err: JoinError) -> RuntimeError {
    if err.is_panic() {
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_owned());
        RuntimeError::Panicked(message)
    } else {
        RuntimeError::Cancelled
    }
}

//! Per-user critical event delivery with bounded retries.
//!
//! One [`EventEmitter`] exists per user. It stamps events with a per-emitter
//! monotone sequence, serializes the wire envelope once, and fans the frame
//! out to every writable connection the user has at emission time. Each
//! connection gets up to `max_attempts` tries with exponential backoff;
//! exhausted deliveries land in a bounded FIFO failure log.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use pulse_core::events::{CriticalEvent, EventPayload, now_secs};
use pulse_core::ids::{ConnectionId, RunId, UserId};
use pulse_core::retry::RetryConfig;
use rand::Rng;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::errors::GatewayError;
use crate::registry::ConnectionRegistry;

/// Maximum retained failed deliveries per emitter.
pub const MAX_FAILED_DELIVERIES: usize = 10;

/// Record of a delivery that exhausted its retry budget.
#[derive(Clone, Debug)]
pub struct FailedDelivery {
    /// Connection the delivery targeted.
    pub connection_id: ConnectionId,
    /// Run the event belonged to.
    pub run_id: RunId,
    /// Wire `type` of the undelivered event.
    pub event_type: &'static str,
    /// Sequence number of the undelivered event.
    pub sequence: u64,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Final error, as a display string.
    pub error: String,
    /// When the delivery was abandoned, float seconds since the epoch.
    pub failed_at: f64,
}

/// Delivers critical events to one user's connections.
pub struct EventEmitter {
    user_id: UserId,
    registry: Arc<ConnectionRegistry>,
    retry: RetryConfig,
    sequence: AtomicU64,
    failed: parking_lot::Mutex<VecDeque<FailedDelivery>>,
}

impl EventEmitter {
    /// Create an emitter bound to a user.
    #[must_use]
    pub fn new(user_id: UserId, registry: Arc<ConnectionRegistry>, retry: RetryConfig) -> Self {
        Self {
            user_id,
            registry,
            retry,
            sequence: AtomicU64::new(0),
            failed: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// Emit one critical event to every writable connection the user has.
    ///
    /// Returns `false` only when at least one writable connection existed
    /// and none accepted the event. Partial delivery is success; exhausted
    /// per-connection retries are recorded in the failure log either way.
    /// A user with no writable connections is not a failure: there is
    /// nobody to notify and the event is dropped.
    pub async fn emit(&self, run_id: &RunId, payload: EventPayload) -> bool {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let event = CriticalEvent::new(self.user_id.clone(), run_id.clone(), sequence, payload);
        let frame = Arc::new(event.to_wire().to_string());
        counter!("emitter_events_total", "type" => event.event_type()).increment(1);

        let connections = self.registry.live_user_connections(&self.user_id).await;
        if connections.is_empty() {
            debug!(
                user_id = %self.user_id,
                event_type = event.event_type(),
                "no writable connections, event dropped"
            );
            return true;
        }

        let mut delivered = 0usize;
        for conn in connections {
            if self.deliver(&conn, &event, Arc::clone(&frame)).await {
                delivered += 1;
            }
        }
        delivered > 0
    }

    /// Failed deliveries, oldest first.
    #[must_use]
    pub fn failed_deliveries(&self) -> Vec<FailedDelivery> {
        self.failed.lock().iter().cloned().collect()
    }

    /// Number of events emitted so far.
    #[must_use]
    pub fn events_emitted(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Owning user.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn deliver(
        &self,
        conn: &Arc<Connection>,
        event: &CriticalEvent,
        frame: Arc<String>,
    ) -> bool {
        let mut last_error = None;
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let sample = rand::rng().random_range(-1.0..=1.0);
                let delay = self.retry.delay_ms(attempt - 1, sample);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            match conn.send(Arc::clone(&frame)).await {
                Ok(()) => {
                    counter!("emitter_deliveries_total", "outcome" => "ok").increment(1);
                    return true;
                }
                // The connection closed underneath us. Not an error: the
                // lifecycle handled it, and retrying cannot succeed.
                Err(GatewayError::SendAfterClose { .. }) => {
                    debug!(
                        connection_id = %conn.id,
                        event_type = event.event_type(),
                        "connection closed during delivery, skipping"
                    );
                    counter!("emitter_deliveries_total", "outcome" => "closed").increment(1);
                    return true;
                }
                Err(err) => {
                    debug!(
                        connection_id = %conn.id,
                        attempt = attempt + 1,
                        error = %err,
                        "delivery attempt failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        let error = last_error.map_or_else(String::new, |e| e.to_string());
        warn!(
            connection_id = %conn.id,
            event_type = event.event_type(),
            attempts = self.retry.max_attempts,
            error = %error,
            "delivery abandoned after retries"
        );
        counter!("emitter_deliveries_total", "outcome" => "failed").increment(1);
        self.record_failure(FailedDelivery {
            connection_id: conn.id.clone(),
            run_id: event.run_id.clone(),
            event_type: event.event_type(),
            sequence: event.sequence,
            attempts: self.retry.max_attempts,
            error,
            failed_at: now_secs(),
        });
        false
    }

    fn record_failure(&self, failure: FailedDelivery) {
        let mut failed = self.failed.lock();
        if failed.len() >= MAX_FAILED_DELIVERIES {
            let _ = failed.pop_front();
        }
        failed.push_back(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, Transport, TransportError};
    use async_trait::async_trait;
    use pulse_core::config::{CleanupConfig, GatewayConfig};
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    struct DeadTransport;

    #[async_trait]
    impl Transport for DeadTransport {
        async fn send(&self, _message: Arc<String>) -> Result<(), TransportError> {
            Err(TransportError::Timeout)
        }
        async fn close(&self) {}
        fn is_open(&self) -> bool {
            true
        }
    }

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(
            &GatewayConfig::default(),
            CleanupConfig::default(),
        ))
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_factor: 0.0,
        }
    }

    async fn add_live(
        registry: &Arc<ConnectionRegistry>,
        user: &str,
        id: &str,
    ) -> mpsc::Receiver<Arc<String>> {
        let (transport, rx) = ChannelTransport::pair(16);
        let conn = Arc::new(Connection::new(
            ConnectionId::from(id),
            UserId::from(user),
            Arc::new(transport),
        ));
        registry.add_connection(conn).await.unwrap();
        rx
    }

    fn parse(frame: &Arc<String>) -> Value {
        serde_json::from_str(frame).unwrap()
    }

    #[tokio::test]
    async fn emit_fans_out_to_all_writable_connections() {
        let registry = registry();
        let mut rx1 = add_live(&registry, "u1", "c1").await;
        let mut rx2 = add_live(&registry, "u1", "c2").await;
        let emitter = EventEmitter::new(UserId::from("u1"), registry, fast_retry());

        let run = RunId::from("r1");
        let ok = emitter
            .emit(
                &run,
                EventPayload::AgentStarted {
                    agent_name: "planner".into(),
                },
            )
            .await;
        assert!(ok);

        for rx in [&mut rx1, &mut rx2] {
            let wire = parse(&rx.recv().await.unwrap());
            assert_eq!(wire["type"], "agent_started");
            assert_eq!(wire["user_id"], "u1");
            assert_eq!(wire["run_id"], "r1");
            assert!(wire["timestamp"].is_f64());
            assert_eq!(wire["data"]["agent_name"], "planner");
        }
    }

    #[tokio::test]
    async fn other_users_connections_do_not_receive() {
        let registry = registry();
        let mut rx_a = add_live(&registry, "alice", "ca").await;
        let mut rx_b = add_live(&registry, "bob", "cb").await;
        let emitter = EventEmitter::new(UserId::from("alice"), registry, fast_retry());

        let ok = emitter
            .emit(
                &RunId::from("r1"),
                EventPayload::AgentThinking {
                    reasoning: "private".into(),
                },
            )
            .await;
        assert!(ok);

        let wire = parse(&rx_a.recv().await.unwrap());
        assert_eq!(wire["user_id"], "alice");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn sequence_increases_per_emitter() {
        let registry = registry();
        let mut rx = add_live(&registry, "u1", "c1").await;
        let emitter = EventEmitter::new(UserId::from("u1"), registry, fast_retry());

        let run = RunId::from("r1");
        for reasoning in ["a", "b", "c"] {
            assert!(
                emitter
                    .emit(
                        &run,
                        EventPayload::AgentThinking {
                            reasoning: reasoning.into()
                        }
                    )
                    .await
            );
        }
        assert_eq!(emitter.events_emitted(), 3);
        let mut frames = Vec::new();
        for _ in 0..3 {
            frames.push(parse(&rx.recv().await.unwrap()));
        }
        let texts: Vec<&str> = frames
            .iter()
            .map(|w| w["data"]["reasoning"].as_str().unwrap())
            .collect();
        assert_eq!(texts, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn no_connections_is_not_a_failure() {
        let registry = registry();
        let emitter = EventEmitter::new(UserId::from("ghost"), registry, fast_retry());
        let ok = emitter
            .emit(&RunId::from("r1"), pulse_core::events::failed("boom"))
            .await;
        assert!(ok);
        assert!(emitter.failed_deliveries().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_are_logged_and_bounded() {
        let registry = registry();
        let conn = Arc::new(Connection::new(
            ConnectionId::from("dead"),
            UserId::from("u1"),
            Arc::new(DeadTransport),
        ));
        registry.add_connection(conn).await.unwrap();
        let emitter = EventEmitter::new(UserId::from("u1"), registry, fast_retry());

        let run = RunId::from("r1");
        for i in 0..12 {
            let ok = emitter
                .emit(
                    &run,
                    EventPayload::ToolExecuting {
                        tool_name: format!("t{i}"),
                    },
                )
                .await;
            assert!(!ok);
        }

        let failures = emitter.failed_deliveries();
        assert_eq!(failures.len(), MAX_FAILED_DELIVERIES);
        // FIFO: oldest two evicted, log starts at sequence 2.
        assert_eq!(failures[0].sequence, 2);
        assert_eq!(failures[9].sequence, 11);
        assert_eq!(failures[0].attempts, 3);
        assert_eq!(failures[0].event_type, "tool_executing");
    }

    #[tokio::test]
    async fn partial_delivery_is_success_but_recorded() {
        let registry = registry();
        let mut rx = add_live(&registry, "u1", "c_ok").await;
        let dead = Arc::new(Connection::new(
            ConnectionId::from("c_dead"),
            UserId::from("u1"),
            Arc::new(DeadTransport),
        ));
        registry.add_connection(dead).await.unwrap();
        let emitter = EventEmitter::new(UserId::from("u1"), registry, fast_retry());

        let ok = emitter
            .emit(
                &RunId::from("r1"),
                EventPayload::AgentThinking {
                    reasoning: "still here".into(),
                },
            )
            .await;
        assert!(ok);
        assert!(rx.recv().await.is_some());
        let failures = emitter.failed_deliveries();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].connection_id.as_str(), "c_dead");
    }

    #[tokio::test]
    async fn closed_connection_is_skipped_without_failure() {
        let registry = registry();
        let mut rx_live = add_live(&registry, "u1", "c_live").await;
        let closing = {
            let (transport, rx) = ChannelTransport::pair(16);
            drop(rx);
            let conn = Arc::new(Connection::new(
                ConnectionId::from("c_gone"),
                UserId::from("u1"),
                Arc::new(transport),
            ));
            conn
        };
        registry.add_connection(closing.clone()).await.unwrap();
        // Close after registration so it is still listed, then emit.
        let _ = closing.close().await;
        let emitter = EventEmitter::new(UserId::from("u1"), registry, fast_retry());

        let ok = emitter.emit(&RunId::from("r1"), completed_payload()).await;
        assert!(ok);
        assert!(emitter.failed_deliveries().is_empty());
        let wire = parse(&rx_live.recv().await.unwrap());
        assert_eq!(wire["type"], "agent_completed");
    }

    fn completed_payload() -> EventPayload {
        pulse_core::events::completed(json!("done"))
    }
}

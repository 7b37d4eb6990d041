//! One live connection: lifecycle, single-writer discipline, health
//! bookkeeping.
//!
//! A connection's transport handle is owned exclusively by this type. Send
//! and close are mutually exclusive through one writer lock, and every write
//! first performs an atomic state read so a write racing a close either
//! completes before the state flips or fails with `SendAfterClose` — it
//! never partially writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use pulse_core::ids::{ConnectionId, UserId};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::errors::GatewayError;
use crate::lifecycle::{ConnectionState, LifecycleState};
use crate::transport::Transport;

/// Probe frame written by liveness checks.
const PROBE_FRAME: &str = r#"{"type":"ping"}"#;

/// One registered connection.
pub struct Connection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Owning user.
    pub user_id: UserId,
    /// Lifecycle state machine.
    pub state: LifecycleState,
    /// When this connection was established.
    pub connected_at: Instant,
    transport: Arc<dyn Transport>,
    /// Serializes writes against close: single-writer discipline.
    writer: AsyncMutex<()>,
    last_activity: parking_lot::Mutex<Instant>,
    error_count: AtomicU32,
    write_failures: AtomicU32,
    is_alive: AtomicBool,
    metadata: parking_lot::Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection in the `Connecting` state.
    #[must_use]
    pub fn new(id: ConnectionId, user_id: UserId, transport: Arc<dyn Transport>) -> Self {
        let now = Instant::now();
        Self {
            id,
            user_id,
            state: LifecycleState::new(),
            connected_at: now,
            transport,
            writer: AsyncMutex::new(()),
            last_activity: parking_lot::Mutex::new(now),
            error_count: AtomicU32::new(0),
            write_failures: AtomicU32::new(0),
            is_alive: AtomicBool::new(true),
            metadata: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Walk the handshake states from wherever the connection currently is
    /// up to `Active`. Returns `false` if the connection is closing, closed,
    /// or in the error path.
    pub fn activate(&self) -> bool {
        loop {
            match self.state.load() {
                ConnectionState::Connecting => {
                    let _ = self.state.transition_to(ConnectionState::Connected);
                }
                ConnectionState::Connected => {
                    let _ = self.state.transition_to(ConnectionState::HandshakePending);
                }
                ConnectionState::HandshakePending => {
                    let _ = self.state.transition_to(ConnectionState::Authenticated);
                }
                ConnectionState::Authenticated | ConnectionState::Degraded => {
                    let _ = self.state.transition_to(ConnectionState::Active);
                }
                ConnectionState::Active => return true,
                ConnectionState::Closing
                | ConnectionState::Closed
                | ConnectionState::Error
                | ConnectionState::Recovery => return false,
            }
        }
    }

    /// Write one serialized frame through the transport.
    ///
    /// Fails immediately with [`GatewayError::SendAfterClose`] when the
    /// connection is `Closing`/`Closed` — checked both before and after
    /// taking the writer lock, so a close that wins the lock race is
    /// observed before any bytes move.
    pub async fn send(&self, message: Arc<String>) -> Result<(), GatewayError> {
        if self.state.load().is_closing_or_closed() {
            return Err(GatewayError::SendAfterClose {
                connection_id: self.id.clone(),
            });
        }
        let _guard = self.writer.lock().await;
        if self.state.load().is_closing_or_closed() {
            return Err(GatewayError::SendAfterClose {
                connection_id: self.id.clone(),
            });
        }
        match self.transport.send(message).await {
            Ok(()) => {
                self.write_failures.store(0, Ordering::Relaxed);
                self.touch();
                Ok(())
            }
            Err(source) => {
                let _ = self.write_failures.fetch_add(1, Ordering::Relaxed);
                let _ = self.error_count.fetch_add(1, Ordering::Relaxed);
                Err(GatewayError::Transport {
                    connection_id: self.id.clone(),
                    source,
                })
            }
        }
    }

    /// Graceful close: flips to `Closing`, waits for any in-flight write,
    /// closes the transport, then marks `Closed`.
    ///
    /// Returns `false` when a close was already in progress (double-close).
    pub async fn close(&self) -> bool {
        if !self.state.transition_to_closing() {
            return false;
        }
        let _guard = self.writer.lock().await;
        self.transport.close().await;
        let _ = self.state.transition_to(ConnectionState::Closed);
        debug!(connection_id = %self.id, "connection closed");
        true
    }

    /// Emergency close: marks `Closed` without waiting on the writer lock
    /// or the transport's graceful shutdown. Used by the FORCE cleanup tier.
    pub async fn force_close(&self) -> bool {
        if self.state.load() == ConnectionState::Closed {
            return false;
        }
        let _ = self.state.transition_to_closing();
        let _ = self.state.transition_to(ConnectionState::Closed);
        self.transport.close().await;
        debug!(connection_id = %self.id, "connection force-closed");
        true
    }

    /// Liveness probe: an actual timed write through the normal send path.
    ///
    /// Zombie classification rests on this rather than
    /// [`Transport::is_open`], because a socket can report open while the
    /// peer is unresponsive.
    pub async fn probe(&self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.send(Arc::new(PROBE_FRAME.to_string()))).await,
            Ok(Ok(()))
        )
    }

    /// Whether this connection looks open but fails actual writes.
    #[must_use]
    pub fn is_zombie(&self, write_failure_threshold: u32) -> bool {
        self.transport.is_open() && self.write_failures() >= write_failure_threshold
    }

    /// Consecutive failed writes since the last success.
    #[must_use]
    pub fn write_failures(&self) -> u32 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Lifetime error count.
    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Record an error observed outside the send path (read task, heartbeat).
    pub fn record_error(&self) {
        let _ = self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last successful write or recorded activity.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Instant of the last recorded activity.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Record activity (inbound message, pong, successful write).
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        self.touch();
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Attach a metadata entry.
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self.metadata.lock().insert(key.into(), value.into());
    }

    /// Read a metadata entry.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<String> {
        self.metadata.lock().get(key).cloned()
    }

    /// Connection age.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, TransportError};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    fn make_connection(buffer: usize) -> (Arc<Connection>, mpsc::Receiver<Arc<String>>) {
        let (transport, rx) = ChannelTransport::pair(buffer);
        let conn = Arc::new(Connection::new(
            ConnectionId::from("c1"),
            UserId::from("u1"),
            Arc::new(transport),
        ));
        assert!(conn.activate());
        (conn, rx)
    }

    /// Transport that reports open but fails every write.
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

    #[tokio::test]
    async fn send_delivers_and_touches_activity() {
        let (conn, mut rx) = make_connection(8);
        let before = conn.last_activity();
        tokio::time::sleep(Duration::from_millis(5)).await;
        conn.send(Arc::new("frame".into())).await.unwrap();
        assert_eq!(&*rx.recv().await.unwrap(), "frame");
        assert!(conn.last_activity() > before);
        assert_eq!(conn.write_failures(), 0);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (conn, _rx) = make_connection(8);
        assert!(conn.close().await);
        let err = conn.send(Arc::new("late".into())).await.unwrap_err();
        assert_matches!(err, GatewayError::SendAfterClose { .. });
    }

    #[tokio::test]
    async fn close_is_single_shot() {
        let (conn, _rx) = make_connection(8);
        assert!(conn.close().await);
        assert!(!conn.close().await);
        assert_eq!(conn.state.load(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn failed_write_increments_counters() {
        let conn = Connection::new(
            ConnectionId::from("c2"),
            UserId::from("u1"),
            Arc::new(DeadTransport),
        );
        assert!(conn.activate());
        for expected in 1..=3u32 {
            let err = conn.send(Arc::new("x".into())).await.unwrap_err();
            assert_matches!(err, GatewayError::Transport { .. });
            assert_eq!(conn.write_failures(), expected);
        }
        assert_eq!(conn.error_count(), 3);
    }

    #[tokio::test]
    async fn zombie_requires_open_transport_and_failures() {
        let conn = Connection::new(
            ConnectionId::from("c3"),
            UserId::from("u1"),
            Arc::new(DeadTransport),
        );
        assert!(conn.activate());
        assert!(!conn.is_zombie(3));
        for _ in 0..3 {
            let _ = conn.send(Arc::new("x".into())).await;
        }
        // Transport says open, writes keep failing: zombie.
        assert!(conn.is_zombie(3));
    }

    #[tokio::test]
    async fn successful_write_resets_zombie_streak() {
        let (conn, mut rx) = make_connection(1);
        // Fill the buffer, then fail once on backpressure.
        conn.send(Arc::new("a".into())).await.unwrap();
        let _ = conn.send(Arc::new("b".into())).await.unwrap_err();
        assert_eq!(conn.write_failures(), 1);
        // Drain; the next success resets the streak.
        let _ = rx.recv().await.unwrap();
        conn.send(Arc::new("c".into())).await.unwrap();
        assert_eq!(conn.write_failures(), 0);
    }

    #[tokio::test]
    async fn probe_true_on_live_transport() {
        let (conn, mut rx) = make_connection(8);
        assert!(conn.probe(Duration::from_millis(100)).await);
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("ping"));
    }

    #[tokio::test]
    async fn probe_false_on_dead_transport() {
        let conn = Connection::new(
            ConnectionId::from("c4"),
            UserId::from("u1"),
            Arc::new(DeadTransport),
        );
        assert!(conn.activate());
        assert!(!conn.probe(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn force_close_skips_graceful_path() {
        let (conn, _rx) = make_connection(8);
        assert!(conn.force_close().await);
        assert_eq!(conn.state.load(), ConnectionState::Closed);
        assert!(!conn.force_close().await);
    }

    #[tokio::test]
    async fn send_racing_close_never_partially_writes() {
        // A send started just before close either lands in the channel or
        // fails with SendAfterClose; since sends go through one writer lock,
        // there is no interleaving in between.
        let (conn, mut rx) = make_connection(64);
        let sender = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut outcomes = Vec::new();
                for i in 0..50 {
                    outcomes.push(conn.send(Arc::new(format!("m{i}"))).await.is_ok());
                }
                outcomes
            })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        let _ = conn.close().await;
        let outcomes = sender.await.unwrap();

        let delivered = {
            let mut n = 0;
            while rx.try_recv().is_ok() {
                n += 1;
            }
            n
        };
        let succeeded = outcomes.iter().filter(|ok| **ok).count();
        // Every reported success is in the channel, every failure is not.
        assert_eq!(delivered, succeeded);
        // Once one send failed, all later sends failed too.
        let first_failure = outcomes.iter().position(|ok| !ok);
        if let Some(idx) = first_failure {
            assert!(outcomes[idx..].iter().all(|ok| !ok));
        }
    }

    #[test]
    fn metadata_round_trip() {
        let (transport, _rx) = ChannelTransport::pair(1);
        let conn = Connection::new(
            ConnectionId::from("c5"),
            UserId::from("u1"),
            Arc::new(transport),
        );
        assert!(conn.metadata("client").is_none());
        conn.set_metadata("client", "ios");
        assert_eq!(conn.metadata("client").as_deref(), Some("ios"));
    }

    #[test]
    fn alive_flag_swaps() {
        let (transport, _rx) = ChannelTransport::pair(1);
        let conn = Connection::new(
            ConnectionId::from("c6"),
            UserId::from("u1"),
            Arc::new(transport),
        );
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }
}

//! Heartbeat liveness monitoring with degraded-mode demotion.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::Connection;
use crate::lifecycle::ConnectionState;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer stopped responding within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Run heartbeat checks for a connection.
///
/// At each `interval` tick the alive flag is checked and reset. A miss
/// demotes an `Active` connection to `Degraded`; a subsequent pong promotes
/// it back. Once `timeout / interval` consecutive misses accumulate
/// (clamped to at least 1) the connection is considered dead and
/// [`HeartbeatResult::TimedOut`] is returned; the caller is responsible for
/// closing it.
pub async fn run_heartbeat(
    connection: Arc<Connection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check_interval = time::interval(interval);
    let mut missed: u32 = 0;
    let interval_ms = interval.as_millis().max(1);
    #[allow(clippy::cast_possible_truncation)]
    let max_missed = ((timeout.as_millis() / interval_ms) as u32).max(1);

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                if connection.state.load().is_closing_or_closed() {
                    return HeartbeatResult::Cancelled;
                }
                if connection.check_alive() {
                    missed = 0;
                    if connection.state.load() == ConnectionState::Degraded
                        && connection.state.transition_to(ConnectionState::Active)
                    {
                        debug!(connection_id = %connection.id, "connection recovered");
                    }
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                    if connection.state.transition_to(ConnectionState::Degraded) {
                        debug!(
                            connection_id = %connection.id,
                            missed,
                            "heartbeat missed, connection degraded"
                        );
                    }
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use pulse_core::ids::{ConnectionId, UserId};
    use tokio::sync::mpsc;

    fn active_connection() -> (Arc<Connection>, mpsc::Receiver<Arc<String>>) {
        let (transport, rx) = ChannelTransport::pair(16);
        let conn = Arc::new(Connection::new(
            ConnectionId::from("hb_conn"),
            UserId::from("u1"),
            Arc::new(transport),
        ));
        assert!(conn.activate());
        (conn, rx)
    }

    #[tokio::test]
    async fn heartbeat_cancelled() {
        let (conn, _rx) = active_connection();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        let handle = tokio::spawn(async move {
            run_heartbeat(
                conn,
                Duration::from_secs(100),
                Duration::from_secs(300),
                cancel2,
            )
            .await
        });

        cancel.cancel();
        let result = handle.await.unwrap();
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_times_out() {
        // timeout=300ms, interval=100ms: three consecutive misses.
        let (conn, _rx) = active_connection();
        let cancel = CancellationToken::new();

        let result = run_heartbeat(
            conn.clone(),
            Duration::from_millis(100),
            Duration::from_millis(300),
            cancel,
        )
        .await;

        assert_eq!(result, HeartbeatResult::TimedOut);
        // Degraded along the way, never closed by the loop itself.
        assert_eq!(conn.state.load(), ConnectionState::Degraded);
    }

    #[tokio::test]
    async fn first_miss_demotes_to_degraded() {
        let (conn, _rx) = active_connection();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let conn2 = conn.clone();

        let handle = tokio::spawn(async move {
            run_heartbeat(
                conn2,
                Duration::from_millis(20),
                Duration::from_millis(2_000),
                cancel2,
            )
            .await
        });

        // Wait past at least one tick with no pong.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(conn.state.load(), ConnectionState::Degraded);

        cancel.cancel();
        let result = handle.await.unwrap();
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test]
    async fn pong_promotes_degraded_back_to_active() {
        let (conn, _rx) = active_connection();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let conn2 = conn.clone();

        let handle = tokio::spawn(async move {
            run_heartbeat(
                conn2,
                Duration::from_millis(20),
                Duration::from_millis(10_000),
                cancel2,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(conn.state.load(), ConnectionState::Degraded);

        // Pong arrives; the next tick promotes.
        conn.mark_alive();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(conn.state.load(), ConnectionState::Active);

        cancel.cancel();
        let result = handle.await.unwrap();
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test]
    async fn responsive_connection_never_times_out() {
        let (conn, _rx) = active_connection();
        let conn2 = conn.clone();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        let handle = tokio::spawn(async move {
            run_heartbeat(
                conn2,
                Duration::from_millis(50),
                Duration::from_millis(150),
                cancel2,
            )
            .await
        });

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            conn.mark_alive();
        }

        cancel.cancel();
        let result = handle.await.unwrap();
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test]
    async fn closed_connection_stops_the_loop() {
        let (conn, _rx) = active_connection();
        let _ = conn.close().await;
        let cancel = CancellationToken::new();

        let result = run_heartbeat(
            conn,
            Duration::from_millis(10),
            Duration::from_millis(1_000),
            cancel,
        )
        .await;

        assert_eq!(result, HeartbeatResult::Cancelled);
    }
}

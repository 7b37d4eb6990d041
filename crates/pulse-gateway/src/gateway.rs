//! Gateway facade tying registry, emitters, and heartbeats together.
//!
//! One [`Gateway`] per process. It owns the [`ConnectionRegistry`], hands out
//! one lazily created [`EventEmitter`] per user, and runs a heartbeat task
//! per connection that closes and deregisters peers that stop responding.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pulse_core::config::PulseConfig;
use pulse_core::events::EventPayload;
use pulse_core::ids::{ConnectionId, RunId, UserId};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::connection::Connection;
use crate::emitter::EventEmitter;
use crate::errors::GatewayError;
use crate::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::registry::ConnectionRegistry;
use crate::transport::{ChannelTransport, Transport};

/// Point-in-time gateway statistics.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    /// Currently registered connections across all users.
    pub active_connections: usize,
    /// Users with at least one emitter created.
    pub tracked_users: usize,
    /// Events emitted across all users.
    pub events_emitted: u64,
    /// Failed deliveries currently retained across all emitters.
    pub failed_deliveries: usize,
    /// Connections reclaimed by emergency cleanup since startup.
    pub reclaimed_connections: u64,
}

/// Entry point for connection and delivery management.
pub struct Gateway {
    config: PulseConfig,
    registry: Arc<ConnectionRegistry>,
    emitters: DashMap<UserId, Arc<EventEmitter>>,
    heartbeats: DashMap<ConnectionId, CancellationToken>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Create a gateway from validated configuration.
    #[must_use]
    pub fn new(config: PulseConfig) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(
            &config.gateway,
            config.cleanup.clone(),
        ));
        Arc::new(Self {
            config,
            registry,
            emitters: DashMap::new(),
            heartbeats: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a new connection for a user over the given transport.
    ///
    /// Runs the full admission path (quota check, emergency cleanup,
    /// activation) and starts a heartbeat task for the connection.
    #[instrument(skip(self, transport), fields(user_id = %user_id))]
    pub async fn connect(
        self: &Arc<Self>,
        user_id: UserId,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Connection>, GatewayError> {
        let conn = Arc::new(Connection::new(ConnectionId::new(), user_id, transport));
        self.add_connection(Arc::clone(&conn)).await?;
        Ok(conn)
    }

    /// Open a connection backed by an in-process channel transport sized
    /// from configuration.
    ///
    /// Returns the connection and the outbound frame receiver the socket
    /// write task drains.
    pub async fn connect_channel(
        self: &Arc<Self>,
        user_id: UserId,
    ) -> Result<(Arc<Connection>, tokio::sync::mpsc::Receiver<Arc<String>>), GatewayError> {
        let (transport, rx) = ChannelTransport::pair(self.config.gateway.send_buffer);
        let conn = self.connect(user_id, Arc::new(transport)).await?;
        Ok((conn, rx))
    }

    /// Register an already built connection and start its heartbeat.
    pub async fn add_connection(
        self: &Arc<Self>,
        conn: Arc<Connection>,
    ) -> Result<(), GatewayError> {
        self.registry.add_connection(Arc::clone(&conn)).await?;
        self.spawn_heartbeat(conn);
        Ok(())
    }

    /// Close and deregister a connection. Idempotent.
    pub async fn disconnect(&self, connection_id: &ConnectionId) -> bool {
        if let Some((_, cancel)) = self.heartbeats.remove(connection_id) {
            cancel.cancel();
        }
        if let Some(conn) = self.registry.get(connection_id).await {
            let _ = conn.close().await;
        }
        self.registry.remove_connection(connection_id).await
    }

    /// Whether the given connection is registered and writable.
    pub async fn is_connection_active(&self, connection_id: &ConnectionId) -> bool {
        self.registry
            .get(connection_id)
            .await
            .is_some_and(|c| c.state.is_writable())
    }

    /// The user's emitter, created on first use.
    pub fn emitter(&self, user_id: &UserId) -> Arc<EventEmitter> {
        self.emitters
            .entry(user_id.clone())
            .or_insert_with(|| {
                Arc::new(EventEmitter::new(
                    user_id.clone(),
                    Arc::clone(&self.registry),
                    self.config.delivery.clone(),
                ))
            })
            .clone()
    }

    /// Emit a critical event to all of a user's writable connections.
    pub async fn send_to_user(
        &self,
        user_id: &UserId,
        run_id: &RunId,
        payload: EventPayload,
    ) -> bool {
        self.emitter(user_id).emit(run_id, payload).await
    }

    /// Snapshot of gateway-wide statistics.
    #[must_use]
    pub fn get_stats(&self) -> GatewayStats {
        let mut events_emitted = 0;
        let mut failed_deliveries = 0;
        for entry in &self.emitters {
            events_emitted += entry.value().events_emitted();
            failed_deliveries += entry.value().failed_deliveries().len();
        }
        GatewayStats {
            active_connections: self.registry.connection_count(),
            tracked_users: self.emitters.len(),
            events_emitted,
            failed_deliveries,
            reclaimed_connections: self.registry.reclaimed_total(),
        }
    }

    /// Cancel all heartbeat tasks and close every connection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<ConnectionId> = self
            .heartbeats
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            let _ = self.disconnect(&id).await;
        }
        info!("gateway shut down");
    }

    fn spawn_heartbeat(self: &Arc<Self>, conn: Arc<Connection>) {
        let interval = Duration::from_millis(self.config.gateway.heartbeat_interval_ms);
        let timeout = Duration::from_millis(self.config.gateway.heartbeat_timeout_ms);
        let cancel = self.shutdown.child_token();
        let _ = self
            .heartbeats
            .insert(conn.id.clone(), cancel.clone());
        let gateway = Arc::clone(self);
        let _ = tokio::spawn(async move {
            let id = conn.id.clone();
            let result = run_heartbeat(conn, interval, timeout, cancel).await;
            if result == HeartbeatResult::TimedOut {
                info!(connection_id = %id, "heartbeat timed out, closing connection");
                let _ = gateway.disconnect(&id).await;
            }
        });
    }
}

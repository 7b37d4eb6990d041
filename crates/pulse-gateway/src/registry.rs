//! Connection registry: per-user connection sets with hard quotas.
//!
//! Owns every live [`Connection`]. A user at quota triggers the emergency
//! escalation before a new connection is rejected. The per-user invariant
//! after any successful `add_connection` is
//! `|user_connections| <= max_connections_per_user`; the set may be observed
//! *at* the quota during cleanup evaluation, never above.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use metrics::{counter, gauge};
use pulse_core::config::{CleanupConfig, GatewayConfig};
use pulse_core::ids::{ConnectionId, UserId};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupLevel, EmergencyCleanupCoordinator};
use crate::connection::Connection;
use crate::errors::GatewayError;

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

/// Registry of live connections, partitioned by user.
pub struct ConnectionRegistry {
    limit: usize,
    cleanup: EmergencyCleanupCoordinator,
    inner: RwLock<RegistryInner>,
    /// Atomic counter tracking total connections (avoids read-locking for
    /// count queries).
    active_count: AtomicUsize,
    reclaimed_total: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a registry with the given quota and cleanup thresholds.
    #[must_use]
    pub fn new(gateway: &GatewayConfig, cleanup: CleanupConfig) -> Self {
        Self {
            limit: gateway.max_connections_per_user,
            cleanup: EmergencyCleanupCoordinator::new(cleanup),
            inner: RwLock::new(RegistryInner::default()),
            active_count: AtomicUsize::new(0),
            reclaimed_total: AtomicU64::new(0),
        }
    }

    /// Register a connection and transition it to `Active`.
    ///
    /// If the user is at quota, runs the emergency escalation first; if the
    /// user is still at quota afterwards the connection is rejected with
    /// [`GatewayError::ConnectionLimitExceeded`].
    pub async fn add_connection(&self, conn: Arc<Connection>) -> Result<(), GatewayError> {
        let user_id = conn.user_id.clone();
        let mut inner = self.inner.write().await;
        if Self::user_at_quota(&inner, &user_id, self.limit) {
            // Reclaim runs without the lock held (victim closes await
            // transport I/O); the quota is re-checked under the lock before
            // inserting, so a rejection always follows a reclaim pass.
            drop(inner);
            let reclaimed = self.emergency_reclaim(&user_id).await;
            debug!(user_id = %user_id, reclaimed, "emergency reclaim before add");
            inner = self.inner.write().await;
            if Self::user_at_quota(&inner, &user_id, self.limit) {
                drop(inner);
                counter!("gateway_connections_rejected_total").increment(1);
                warn!(user_id = %user_id, limit = self.limit, "connection rejected: at quota");
                return Err(GatewayError::ConnectionLimitExceeded {
                    user_id,
                    limit: self.limit,
                });
            }
        }
        if !conn.activate() {
            drop(inner);
            return Err(GatewayError::NotRegistrable {
                connection_id: conn.id.clone(),
            });
        }
        let _ = inner
            .by_user
            .entry(user_id)
            .or_default()
            .insert(conn.id.clone());
        if inner.by_id.insert(conn.id.clone(), conn).is_none() {
            let count = self.active_count.fetch_add(1, Ordering::Relaxed) + 1;
            gauge!("gateway_connections_active").set(count as f64);
        }
        Ok(())
    }

    fn user_at_quota(inner: &RegistryInner, user_id: &UserId, limit: usize) -> bool {
        inner.by_user.get(user_id).map_or(0, HashSet::len) >= limit
    }

    /// Remove a connection by ID.
    ///
    /// Idempotent: removing an absent ID is a successful no-op. Returns
    /// whether anything was removed.
    pub async fn remove_connection(&self, connection_id: &ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.by_id.remove(connection_id) else {
            return false;
        };
        if let Some(set) = inner.by_user.get_mut(&conn.user_id) {
            let _ = set.remove(connection_id);
            if set.is_empty() {
                let _ = inner.by_user.remove(&conn.user_id);
            }
        }
        drop(inner);
        let count = self.active_count.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!("gateway_connections_active").set(count as f64);
        debug!(connection_id = %connection_id, "connection removed");
        true
    }

    /// Look up a connection by ID.
    pub async fn get(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().await.by_id.get(connection_id).cloned()
    }

    /// All of a user's registered connections.
    pub async fn user_connections(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(user_id)
            .map(|set| {
                set.iter()
                    .filter_map(|id| inner.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A user's connections in a writable state.
    pub async fn live_user_connections(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        let mut conns = self.user_connections(user_id).await;
        conns.retain(|c| c.state.is_writable());
        conns
    }

    /// Whether the user has at least one writable connection.
    pub async fn is_user_active(&self, user_id: &UserId) -> bool {
        !self.live_user_connections(user_id).await.is_empty()
    }

    /// Number of connections registered for a user.
    pub async fn user_connection_count(&self, user_id: &UserId) -> usize {
        self.inner
            .read()
            .await
            .by_user
            .get(user_id)
            .map_or(0, HashSet::len)
    }

    /// Total registered connections across all users.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Lifetime count of emergency-reclaimed connections.
    #[must_use]
    pub fn reclaimed_total(&self) -> u64 {
        self.reclaimed_total.load(Ordering::Relaxed)
    }

    /// Per-user quota.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Reclaim connections for a user at a single cleanup tier.
    ///
    /// Returns the number reclaimed. Safe to call repeatedly; a tier that
    /// finds no victims reclaims zero.
    pub async fn try_reclaim(&self, user_id: &UserId, level: CleanupLevel) -> usize {
        let conns = self.user_connections(user_id).await;
        let need = (conns.len() + 1).saturating_sub(self.limit);
        let victims = self.cleanup.select_victims(&conns, level, need).await;
        let mut reclaimed = 0;
        for victim in victims {
            // The removal is what frees the slot; a victim whose close was
            // already in flight still counts.
            if level == CleanupLevel::Force {
                let _ = victim.force_close().await;
            } else {
                let _ = victim.close().await;
            }
            if self.remove_connection(&victim.id).await {
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            let _ = self
                .reclaimed_total
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
            counter!("gateway_reclaimed_total", "level" => level.as_str())
                .increment(reclaimed as u64);
            info!(user_id = %user_id, level = level.as_str(), reclaimed, "connections reclaimed");
        }
        reclaimed
    }

    /// Run the full escalation for a user at quota. Stops at the first tier
    /// that brings the user under quota; a single bounded pass.
    pub async fn emergency_reclaim(&self, user_id: &UserId) -> usize {
        let mut total = 0;
        for level in CleanupLevel::ESCALATION {
            total += self.try_reclaim(user_id, level).await;
            if self.user_connection_count(user_id).await < self.limit {
                return total;
            }
        }
        warn!(
            user_id = %user_id,
            partial = total,
            "force cleanup insufficient, user remains at quota"
        );
        total
    }
}

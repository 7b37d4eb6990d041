//! Tiered emergency reclamation of a user's connections.
//!
//! Triggered only when a user is at their connection quota. Each tier is
//! idempotent and side-effect-free here: the coordinator *selects* victims,
//! the registry closes and evicts them. Escalation runs the tiers in order
//! and stops as soon as enough connections are reclaimed — a fixed
//! four-tier pass, never an unbounded loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pulse_core::config::CleanupConfig;
use pulse_core::ids::ConnectionId;
use tracing::debug;

use crate::connection::Connection;
use crate::lifecycle::ConnectionState;

/// Escalating aggressiveness tiers. Parameter only, never stored state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CleanupLevel {
    /// Long-idle connections whose liveness probe fails.
    Conservative,
    /// Conservative set plus elevated error counts and zombies.
    Moderate,
    /// Everything outside the most-recently-active share.
    Aggressive,
    /// Oldest connections regardless of apparent health; bypasses graceful
    /// close.
    Force,
}

impl CleanupLevel {
    /// Tiers in escalation order.
    pub const ESCALATION: [Self; 4] = [
        Self::Conservative,
        Self::Moderate,
        Self::Aggressive,
        Self::Force,
    ];

    /// Metrics/logging label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Moderate => "moderate",
            Self::Aggressive => "aggressive",
            Self::Force => "force",
        }
    }
}

/// Selects reclamation victims among one user's connections.
pub struct EmergencyCleanupCoordinator {
    config: CleanupConfig,
}

impl EmergencyCleanupCoordinator {
    /// Create a coordinator with the given thresholds.
    #[must_use]
    pub fn new(config: CleanupConfig) -> Self {
        Self { config }
    }

    /// Pick up to `need` victims at the given tier.
    ///
    /// Victims are returned least-valuable first for that tier. Connections
    /// already `Closed` are never selected, which keeps repeated calls at
    /// the same tier idempotent.
    pub async fn select_victims(
        &self,
        connections: &[Arc<Connection>],
        level: CleanupLevel,
        need: usize,
    ) -> Vec<Arc<Connection>> {
        if need == 0 {
            return Vec::new();
        }
        let candidates: Vec<Arc<Connection>> = connections
            .iter()
            .filter(|c| c.state.load() != ConnectionState::Closed)
            .cloned()
            .collect();

        let mut victims = match level {
            CleanupLevel::Conservative => self.idle_probe_failures(&candidates).await,
            CleanupLevel::Moderate => {
                let mut seen: HashSet<ConnectionId> = HashSet::new();
                let mut picked = Vec::new();
                for conn in self.idle_probe_failures(&candidates).await {
                    if seen.insert(conn.id.clone()) {
                        picked.push(conn);
                    }
                }
                for conn in &candidates {
                    let unhealthy = conn.error_count() >= self.config.error_count_threshold
                        || conn.is_zombie(self.config.zombie_write_failures);
                    if unhealthy && seen.insert(conn.id.clone()) {
                        picked.push(conn.clone());
                    }
                }
                picked
            }
            CleanupLevel::Aggressive => {
                // Keep the most-recent share by activity, evict the rest,
                // least recently active first. Connections inside the idle
                // floor are never eligible.
                let min_idle = Duration::from_millis(self.config.aggressive_min_idle_ms);
                let mut by_activity = candidates.clone();
                by_activity.sort_by_key(|c| c.last_activity());
                let keep =
                    (candidates.len() as f64 * self.config.keep_recent_ratio).ceil() as usize;
                let evict = by_activity.len().saturating_sub(keep);
                by_activity.truncate(evict);
                by_activity.retain(|c| c.idle_time() >= min_idle);
                by_activity
            }
            CleanupLevel::Force => {
                // Oldest connections first, health ignored. The age floor
                // keeps brand-new connections out of reach.
                let min_age = Duration::from_millis(self.config.force_min_age_ms);
                let mut by_age = candidates;
                by_age.retain(|c| c.age() >= min_age);
                by_age.sort_by_key(|c| c.connected_at);
                by_age
            }
        };

        victims.truncate(need);
        debug!(
            level = level.as_str(),
            selected = victims.len(),
            need,
            "cleanup victim selection"
        );
        victims
    }

    /// Connections idle past the threshold whose write probe fails.
    async fn idle_probe_failures(&self, candidates: &[Arc<Connection>]) -> Vec<Arc<Connection>> {
        let idle_threshold = Duration::from_millis(self.config.idle_threshold_ms);
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let mut victims = Vec::new();
        for conn in candidates {
            if conn.idle_time() < idle_threshold {
                continue;
            }
            // Zombie detection is based on actual write success, not the
            // transport's open flag.
            if !conn.probe(probe_timeout).await {
                victims.push(conn.clone());
            }
        }
        victims
    }
}

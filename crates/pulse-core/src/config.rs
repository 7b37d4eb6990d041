//! Configuration with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** — [`PulseConfig::default()`]
//! 2. **Config file** — JSON, deep-merged over defaults
//! 3. **Environment variables** — `PULSE_*` overrides (highest priority)
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so partial
//! JSON is accepted — missing fields get their default value.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::retry::RetryConfig;

/// Errors that can occur when loading or parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration for the pulse service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PulseConfig {
    /// Connection gateway settings.
    pub gateway: GatewayConfig,
    /// Emergency cleanup thresholds.
    pub cleanup: CleanupConfig,
    /// Execution engine settings.
    pub execution: ExecutionConfig,
    /// Event delivery retry settings.
    pub delivery: RetryConfig,
    /// Minimum log level for the tracing subscriber.
    pub log_level: String,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            cleanup: CleanupConfig::default(),
            execution: ExecutionConfig::default(),
            delivery: RetryConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Connection gateway settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Hard per-user connection quota.
    pub max_connections_per_user: usize,
    /// Capacity of each connection's outbound channel.
    pub send_buffer: usize,
    /// Heartbeat ping interval in ms.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat timeout in ms (missed-pong window).
    pub heartbeat_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 20,
            send_buffer: 256,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
        }
    }
}

/// Emergency cleanup thresholds.
///
/// All thresholds are configuration rather than constants: the escalation
/// tiers read them at evaluation time, so deployments can tune how eagerly
/// connections are reclaimed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupConfig {
    /// Idle time in ms before a connection is a conservative-tier candidate.
    pub idle_threshold_ms: u64,
    /// Error count at which a connection becomes a moderate-tier candidate.
    pub error_count_threshold: u32,
    /// Consecutive write failures that classify a connection as a zombie.
    pub zombie_write_failures: u32,
    /// Share of most-recently-active connections the aggressive tier keeps.
    pub keep_recent_ratio: f64,
    /// Minimum idle time in ms before the aggressive tier may evict.
    ///
    /// Keeps brand-new healthy connections out of reach: a user who is
    /// legitimately at quota with fresh traffic gets a limit error instead
    /// of losing a live connection.
    pub aggressive_min_idle_ms: u64,
    /// Minimum connection age in ms before the force tier may evict.
    pub force_min_age_ms: u64,
    /// Timeout in ms for the liveness write probe.
    pub probe_timeout_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: 300_000,
            error_count_threshold: 5,
            zombie_write_failures: 3,
            keep_recent_ratio: 0.25,
            aggressive_min_idle_ms: 60_000,
            force_min_age_ms: 300_000,
            probe_timeout_ms: 1_000,
        }
    }
}

/// Execution engine settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    /// Per-user concurrent agent run limit (semaphore size).
    pub max_concurrent_agents: usize,
    /// Run timeout ceiling for the free tier, in ms.
    pub free_tier_timeout_ms: u64,
    /// Run timeout ceiling for the paid tier, in ms.
    pub paid_tier_timeout_ms: u64,
    /// Maximum completed runs retained per user.
    pub max_history_size: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 3,
            free_tier_timeout_ms: 120_000,
            paid_tier_timeout_ms: 600_000,
            max_history_size: 100,
        }
    }
}

impl PulseConfig {
    /// Clamp ratio fields and correct invalid invariants.
    ///
    /// Called automatically during loading. Out-of-range values are clamped
    /// with a warning rather than rejected, so operators get corrected
    /// behavior instead of a startup failure.
    pub fn validate(&mut self) {
        let ratio = &mut self.cleanup.keep_recent_ratio;
        if *ratio < 0.0 || *ratio > 1.0 {
            let clamped = ratio.clamp(0.0, 1.0);
            warn!("keep_recent_ratio out of range ({ratio}), clamped to {clamped}");
            *ratio = clamped;
        }

        let jitter = &mut self.delivery.jitter_factor;
        if *jitter < 0.0 || *jitter > 1.0 {
            let clamped = jitter.clamp(0.0, 1.0);
            warn!("jitter_factor out of range ({jitter}), clamped to {clamped}");
            *jitter = clamped;
        }

        if self.gateway.max_connections_per_user == 0 {
            warn!("max_connections_per_user must be at least 1, correcting");
            self.gateway.max_connections_per_user = 1;
        }
        if self.execution.max_concurrent_agents == 0 {
            warn!("max_concurrent_agents must be at least 1, correcting");
            self.execution.max_concurrent_agents = 1;
        }
        if self.execution.paid_tier_timeout_ms < self.execution.free_tier_timeout_ms {
            warn!(
                "paid tier timeout ({}) < free tier timeout ({}), correcting",
                self.execution.paid_tier_timeout_ms, self.execution.free_tier_timeout_ms
            );
            self.execution.paid_tier_timeout_ms = self.execution.free_tier_timeout_ms;
        }
    }
}

/// Load configuration from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_config_from_path(path: &Path) -> Result<PulseConfig> {
    let defaults = serde_json::to_value(PulseConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: PulseConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validate();
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded configuration.
///
/// Invalid or out-of-range values are silently ignored (fall back to
/// file/default).
pub fn apply_env_overrides(config: &mut PulseConfig) {
    if let Some(v) = read_env_usize("PULSE_MAX_CONNECTIONS_PER_USER", 1, 10_000) {
        config.gateway.max_connections_per_user = v;
    }
    if let Some(v) = read_env_usize("PULSE_MAX_CONCURRENT_AGENTS", 1, 1_000) {
        config.execution.max_concurrent_agents = v;
    }
    if let Some(v) = read_env_u64("PULSE_FREE_TIER_TIMEOUT_MS", 1_000, 86_400_000) {
        config.execution.free_tier_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("PULSE_PAID_TIER_TIMEOUT_MS", 1_000, 86_400_000) {
        config.execution.paid_tier_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("PULSE_IDLE_THRESHOLD_MS", 1_000, 86_400_000) {
        config.cleanup.idle_threshold_ms = v;
    }
    if let Ok(v) = std::env::var("PULSE_LOG_LEVEL") {
        if !v.is_empty() {
            config.log_level = v;
        }
    }
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    let parsed: usize = raw.trim().parse().ok()?;
    (min..=max).contains(&parsed).then_some(parsed)
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    let parsed: u64 = raw.trim().parse().ok()?;
    (min..=max).contains(&parsed).then_some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_sane() {
        let config = PulseConfig::default();
        assert_eq!(config.gateway.max_connections_per_user, 20);
        assert_eq!(config.execution.max_concurrent_agents, 3);
        assert_eq!(config.execution.max_history_size, 100);
        assert_eq!(config.cleanup.error_count_threshold, 5);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn partial_json_gets_defaults() {
        let json = r#"{"gateway": {"maxConnectionsPerUser": 5}}"#;
        let config: PulseConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.gateway.max_connections_per_user, 5);
        assert_eq!(config.gateway.send_buffer, 256);
        assert_eq!(config.execution.max_concurrent_agents, 3);
    }

    #[test]
    fn validate_clamps_ratio() {
        let mut config = PulseConfig::default();
        config.cleanup.keep_recent_ratio = 3.5;
        config.validate();
        assert!((config.cleanup.keep_recent_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn validate_corrects_zero_limits() {
        let mut config = PulseConfig::default();
        config.gateway.max_connections_per_user = 0;
        config.execution.max_concurrent_agents = 0;
        config.validate();
        assert_eq!(config.gateway.max_connections_per_user, 1);
        assert_eq!(config.execution.max_concurrent_agents, 1);
    }

    #[test]
    fn validate_orders_tier_timeouts() {
        let mut config = PulseConfig::default();
        config.execution.free_tier_timeout_ms = 500_000;
        config.execution.paid_tier_timeout_ms = 100_000;
        config.validate();
        assert_eq!(config.execution.paid_tier_timeout_ms, 500_000);
    }

    #[test]
    fn deep_merge_objects_recursively() {
        let target = json!({"a": {"x": 1, "y": 2}, "b": 3});
        let source = json!({"a": {"y": 20}});
        let merged = deep_merge(target, source);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 20}, "b": 3}));
    }

    #[test]
    fn deep_merge_skips_nulls() {
        let target = json!({"a": 1});
        let source = json!({"a": null, "b": 2});
        let merged = deep_merge(target, source);
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let target = json!({"a": [1, 2, 3]});
        let source = json!({"a": [9]});
        let merged = deep_merge(target, source);
        assert_eq!(merged, json!({"a": [9]}));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.gateway.max_connections_per_user, 20);
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.json");
        std::fs::write(
            &path,
            r#"{"execution": {"maxConcurrentAgents": 7}, "logLevel": "debug"}"#,
        )
        .unwrap();
        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.execution.max_concurrent_agents, 7);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.gateway.max_connections_per_user, 20);
    }

    #[test]
    fn load_invalid_json_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_config_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn env_parse_bounds() {
        // Pure helpers are exercised via absent vars returning None.
        assert_eq!(read_env_usize("PULSE_TEST_UNSET_VAR_XYZ", 1, 10), None);
        assert_eq!(read_env_u64("PULSE_TEST_UNSET_VAR_XYZ", 1, 10), None);
    }
}

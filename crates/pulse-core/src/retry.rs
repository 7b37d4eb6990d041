//! Retry configuration and backoff calculation.
//!
//! Portable, sync-only building blocks for delivery retries. The actual
//! async retry loop (with sleeps) lives in `pulse-gateway`, which has access
//! to tokio; this module contains the parameters and the math.

use serde::{Deserialize, Serialize};

/// Default maximum delivery attempts per connection.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 50;
/// Default maximum delay between attempts in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 2_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Configuration for delivery retry logic.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Maximum attempts per connection, first try included (default: 3).
    pub max_attempts: u32,
    /// Base delay for exponential backoff in ms (default: 50).
    pub base_delay_ms: u64,
    /// Maximum delay between attempts in ms (default: 2000).
    pub max_delay_ms: u64,
    /// Jitter factor 0.0–1.0 (default: 0.2).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

/// Calculate exponential backoff delay with jitter.
///
/// Formula: `min(max_delay, base_delay * 2^attempt) * (1 + jitter_sample * jitter_factor)`
///
/// `jitter_sample` must be in [-1.0, 1.0]; a factor of 0.2 means the delay
/// varies by ±20% from the exponential value. Callers pass a real random
/// sample in production and a fixed value in tests.
///
/// `attempt` is the zero-based index of the retry (0 for the first retry).
#[must_use]
pub fn backoff_delay_ms(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    jitter_sample: f64,
) -> u64 {
    let exp = base_delay_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(max_delay_ms);
    let jittered = capped as f64 * (1.0 + jitter_sample.clamp(-1.0, 1.0) * jitter_factor);
    jittered.max(0.0) as u64
}

impl RetryConfig {
    /// Backoff delay for the given zero-based retry attempt.
    #[must_use]
    pub fn delay_ms(&self, attempt: u32, jitter_sample: f64) -> u64 {
        backoff_delay_ms(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            jitter_sample,
        )
    }
}

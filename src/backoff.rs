use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential standoff between client reset attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExponentialBackoff {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    /// Jitter factor (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts,
            jitter_factor: 0.1,
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` once exhausted
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let exp_delay = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        let clamped = exp_delay.min(self.max_delay_ms);

        let jitter_factor = self.jitter_factor.clamp(0.0, 1.0);
        let jitter = (clamped as f64 * jitter_factor * (fastrand::f64() - 0.5) * 2.0) as i64;
        let with_jitter = (clamped as i64 + jitter).max(0) as u64;

        Some(Duration::from_millis(with_jitter.min(self.max_delay_ms)))
    }
}

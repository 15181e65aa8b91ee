use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Linear backoff used when the service rejects sends for being too frequent.
///
/// Attempt `0` goes out immediately; attempt `n` waits `n * step_delay_ms`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendRetryPolicy {
    step_delay_ms: u64,
    max_attempts: u32,
}

impl SendRetryPolicy {
    pub fn new(step_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            step_delay_ms,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn step_delay_ms(&self) -> u64 {
        self.step_delay_ms
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.step_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

impl Default for SendRetryPolicy {
    fn default() -> Self {
        Self::new(100, 5)
    }
}

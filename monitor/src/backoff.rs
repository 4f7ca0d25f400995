//! Exponential backoff shared by reconnects and notification retries

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay before attempt `n` is `min(base * 2^n, max)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Attempt limit, `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Backoff {
    pub const fn new(base: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self { base, max, max_attempts }
    }

    /// Delay to wait before attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }

    /// Whether attempt number `attempt` (1-based) is allowed
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map(|max| attempt <= max).unwrap_or(true)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), Some(5))
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attempt budget and backoff shared by credential refresh and record sends.
///
/// `max_attempts` counts every attempt including the first one, so a budget
/// of 3 means at most 3 calls to the external capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 100,
            max_ms: 5_000,
            jitter_ms: 50,
        }
    }
}

impl RetryPolicy {
    /// A policy with the given budget and no waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_ms: 0,
            max_ms: 0,
            jitter_ms: 0,
        }
    }

    /// Budget clamped to at least one attempt.
    pub fn budget(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.budget()
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff(attempt) + jitter_delay(self.jitter_ms)
    }

    /// Exponential part of the delay, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.base_ms == 0 {
            return Duration::ZERO;
        }
        let max = self.max_ms.max(self.base_ms);
        let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
        let exp = self.base_ms.saturating_mul(pow);
        Duration::from_millis(exp.min(max))
    }

    /// Pause between two rounds of exhausted attempts.
    pub fn round_delay(&self) -> Duration {
        Duration::from_millis(self.max_ms.max(self.base_ms)) + jitter_delay(self.jitter_ms)
    }
}

fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

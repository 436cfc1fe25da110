//! Exponential backoff for retrying quote requests
//!
//! Delay for attempt `n` (0-based) is `base * 2^n`, capped at `max_delay`,
//! then jittered by ±`jitter_pct` so chunks that failed together don't retry
//! together.

use rand::Rng;
use std::time::Duration;

/// Configuration for exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay
    pub max_delay: Duration,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Symmetric jitter as a fraction of the delay (0.0 to 1.0)
    pub jitter_pct: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            max_retries: 3,
            jitter_pct: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Short delays, few retries (tests, local replay)
    pub fn aggressive() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            max_retries: 2,
            jitter_pct: 0.1,
        }
    }

    /// Long delays for a fragile upstream
    pub fn conservative() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
            max_retries: 5,
            jitter_pct: 0.3,
        }
    }

    /// Un-jittered delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // 2^31 * anything useful is already past any sane cap
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Scale `delay` by a random factor in `[1 - pct, 1 + pct]`
pub fn apply_jitter(delay: Duration, pct: f64) -> Duration {
    let pct = if pct.is_finite() { pct.clamp(0.0, 1.0) } else { 0.0 };
    if pct == 0.0 || delay.is_zero() {
        return delay;
    }

    let factor = rand::thread_rng().gen_range((1.0 - pct)..=(1.0 + pct));
    delay.mul_f64(factor)
}

/// Per-task retry state
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Next jittered delay, or None once retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }
        let delay = apply_jitter(self.config.delay_for(self.attempt), self.config.jitter_pct);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Retries handed out so far
    pub fn attempt_number(&self) -> u32 {
        self.attempt
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.config.max_retries
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

//! Timestamp-gated circuit breaker for the quote upstream
//!
//! ## State Machine
//!
//! ```text
//!     CLOSED ──streak ≥ threshold──→ OPEN(until)
//!        ▲                               │
//!        └────── now ≥ until ────────────┘
//! ```
//!
//! - **Closed**: calls proceed; each final task failure extends the streak,
//!   any success resets it to zero
//! - **Open**: every call fails fast with `QuoteError::BreakerOpen` until the
//!   deadline passes
//!
//! There is no half-open probe. The streak is not cleared when the breaker
//! opens, so if the upstream is still down the first failure after the
//! cooldown reopens it immediately.
//!
//! Deadlines use `tokio::time::Instant` so paused-clock tests can step
//! through a cooldown.

use crate::core::QuoteError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// How long the breaker stays open
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    opens: u64,
}

impl BreakerState {
    /// Clears an elapsed deadline, logging the OPEN → CLOSED edge once
    fn refresh(&mut self, now: Instant) {
        if let Some(until) = self.open_until {
            if now >= until {
                self.open_until = None;
                info!(
                    streak = self.consecutive_failures,
                    "Circuit breaker: OPEN → CLOSED (cooldown elapsed)"
                );
            }
        }
    }
}

/// Shared breaker handle; clones observe the same state
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(BreakerState::default())),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Fail fast while open
    pub fn check(&self) -> Result<(), QuoteError> {
        match self.remaining() {
            Some(remaining) => Err(QuoteError::BreakerOpen { remaining }),
            None => Ok(()),
        }
    }

    /// Time left until the breaker closes, or None if closed
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.refresh(now);
        state.open_until.map(|until| until - now)
    }

    pub fn is_open(&self) -> bool {
        self.remaining().is_some()
    }

    pub fn state(&self) -> CircuitState {
        if self.is_open() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.consecutive_failures > 0 {
            debug!(
                previous_streak = state.consecutive_failures,
                "Circuit breaker: failure streak reset"
            );
        }
        state.consecutive_failures = 0;
    }

    /// Count one failed task; returns true if this failure opened the breaker
    pub fn record_failure(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.refresh(now);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.open_until.is_none() && state.consecutive_failures >= self.config.failure_threshold
        {
            state.open_until = Some(now + self.config.cooldown);
            state.opens += 1;
            warn!(
                streak = state.consecutive_failures,
                threshold = self.config.failure_threshold,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Circuit breaker: CLOSED → OPEN (failure threshold reached)"
            );
            return true;
        }

        debug!(
            streak = state.consecutive_failures,
            threshold = self.config.failure_threshold,
            "Circuit breaker: failure recorded"
        );
        false
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Times the breaker has opened since creation
    pub fn open_count(&self) -> u64 {
        self.state.lock().opens
    }

    /// Close the breaker and clear the streak (manual override)
    pub fn reset(&self) {
        let mut state = self.state.lock();
        info!("Circuit breaker manually reset to CLOSED");
        state.consecutive_failures = 0;
        state.open_until = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

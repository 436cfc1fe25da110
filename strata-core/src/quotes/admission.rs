//! Admission control: minimum spacing plus a rolling-window request budget
//!
//! ```text
//! window = 1000ms, budget = 2
//!
//!   t=0     t=0     t=1000
//!    │       │        │
//!    ▼       ▼        ▼
//!  [req1]  [req2]   [req3]   ← req3 waits until req1 leaves the window
//! ```
//!
//! A slot is reserved under the lock only when no wait is required. Callers
//! that had to sleep re-check after waking, so two callers sleeping on the
//! same wait can never both dispatch into a full window.
//!
//! One `AdmissionControl` is shared by every caller of a guard: they all draw
//! from the same upstream budget.

use crate::resilience::apply_jitter;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Admission limits
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    /// Minimum gap between two dispatches
    pub min_spacing: Duration,
    /// Max dispatches inside any trailing `window`
    pub max_requests: usize,
    pub window: Duration,
    /// Jitter applied to admission sleeps (0.0 to 1.0)
    pub jitter_pct: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_millis(120),
            max_requests: 8,
            window: Duration::from_millis(1_000),
            jitter_pct: 0.2,
        }
    }
}

#[derive(Debug, Default)]
struct AdmissionState {
    last_dispatch: Option<Instant>,
    dispatched: VecDeque<Instant>,
    total: u64,
}

impl AdmissionState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.dispatched.front() {
            if now.duration_since(oldest) >= window {
                self.dispatched.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Shared spacing and rolling-window limiter
#[derive(Debug)]
pub struct AdmissionControl {
    config: AdmissionConfig,
    state: Mutex<AdmissionState>,
}

impl AdmissionControl {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AdmissionState::default()),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Wait still required at `now`: the larger of spacing and window waits
    pub fn required_wait(&self, now: Instant) -> Duration {
        let mut state = self.state.lock();
        self.wait_locked(&mut state, now)
    }

    fn wait_locked(&self, state: &mut AdmissionState, now: Instant) -> Duration {
        state.prune(now, self.config.window);

        let spacing_wait = state
            .last_dispatch
            .map(|last| (last + self.config.min_spacing).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);

        let budget = self.config.max_requests.max(1);
        let window_wait = if state.dispatched.len() >= budget {
            // The slot frees when the entry `len - budget` ages out
            let idx = state.dispatched.len() - budget;
            (state.dispatched[idx] + self.config.window).saturating_duration_since(now)
        } else {
            Duration::ZERO
        };

        spacing_wait.max(window_wait)
    }

    /// Reserve a dispatch slot at `now`, or return how long to wait
    pub fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let wait = self.wait_locked(&mut state, now);
        if !wait.is_zero() {
            return Err(wait);
        }

        state.last_dispatch = Some(now);
        state.dispatched.push_back(now);
        state.total += 1;
        Ok(())
    }

    /// Sleep (jittered) until a dispatch slot is reserved
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire_at(Instant::now()) {
                Ok(()) => return,
                Err(wait) => {
                    let jittered = apply_jitter(wait, self.config.jitter_pct);
                    // Waking early just re-checks; never spin on a zero sleep
                    tokio::time::sleep(jittered.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Dispatches currently inside the window
    pub fn in_window(&self) -> usize {
        let mut state = self.state.lock();
        state.prune(Instant::now(), self.config.window);
        state.dispatched.len()
    }

    /// Dispatches admitted since creation
    pub fn total_admitted(&self) -> u64 {
        self.state.lock().total
    }
}

//! Resilience primitives for the quote path
//!
//! - `backoff`: exponential retry delays with jitter
//! - `circuit_breaker`: consecutive-failure breaker with a timed cooldown

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::{apply_jitter, BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

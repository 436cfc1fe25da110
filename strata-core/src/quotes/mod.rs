//! Guarded access to the upstream quote API
//!
//! - `client`: the `QuoteClient` seam and quote value types
//! - `admission`: minimum spacing and rolling-window budget
//! - `guard`: chunking, queueing, retries and the circuit breaker

pub mod admission;
pub mod client;
pub mod guard;

pub use admission::{AdmissionConfig, AdmissionControl};
pub use client::{QuoteClient, QuoteMap, QuoteMeta, QuoteRecord};
pub use guard::{GuardStats, QuoteGuard, QuoteGuardConfig};

//! Strata Core - intraday market data ingestion and guarded quote access
//!
//! Turns a raw tick stream into time-bucketed OHLCV candles, persists them
//! through a bounded batching buffer, and mediates every on-demand quote
//! lookup through admission control, retry/backoff and a circuit breaker.
//!
//! ## Data flow
//! ```text
//! ticks ─► CandleBuilder::on_ticks ─► closed candles ─► CandleWriteBuffer::enqueue
//!                                                            │ flush timer
//!                                                            ▼
//!                                                       CandleSink
//!
//! caller ─► QuoteGuard::get_quote_guarded ─► QuoteClient (upstream API)
//! ```
//!
//! ## Core Modules
//! - `core`: ticks, candles, error types
//! - `data`: bucket clock and candle builder
//! - `storage`: sinks and the write buffer
//! - `resilience`: backoff and circuit breaker
//! - `quotes`: quote client seam, admission control, the guard
//! - `engine`: market hours gate and pipeline composition
//! - `config`: TOML/env configuration
//! - `monitoring`: Prometheus metrics
//! - `utils`: logging setup

pub mod core;

pub mod config;
pub mod data;
pub mod engine;
pub mod monitoring;
pub mod quotes;
pub mod resilience;
pub mod storage;
pub mod utils;

pub use core::{Candle, CandleKey, CandleSource, ConfigError, FinalizedBy, QuoteError, Tick};

pub use config::StrataConfig;
pub use data::{BucketClock, CandleBuilder, FinalizeOptions};
pub use engine::{MarketDataPipeline, PipelineConfig};
pub use quotes::{QuoteClient, QuoteGuard, QuoteGuardConfig, QuoteMap};
pub use storage::{CandleSink, CandleWriteBuffer};

// Re-export error types
pub use anyhow::{Error, Result};

/// Prelude for convenient imports
pub mod prelude {
    // Core types
    pub use crate::core::{Candle, CandleKey, FinalizedBy, QuoteError, Tick};

    // Candles
    pub use crate::data::{BucketClock, CandleBuilder, FinalizeOptions};
    pub use crate::storage::{CandleSink, CandleWriteBuffer, JsonlSink, MemorySink};

    // Quotes
    pub use crate::quotes::{QuoteClient, QuoteGuard, QuoteGuardConfig, QuoteMap, QuoteMeta};

    // Composition
    pub use crate::engine::{MarketDataPipeline, PipelineConfig};
    pub use crate::config::StrataConfig;

    // Error types
    pub use crate::{Error, Result};
}

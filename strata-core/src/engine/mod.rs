//! Composition layer
//!
//! - `market_gate`: market-hours predicate and open/close edge events
//! - `pipeline`: builder + write buffer + finalizer wired together

pub mod market_gate;
pub mod pipeline;

pub use market_gate::{MarketEvent, MarketGate, MarketHours, SessionHours};
pub use pipeline::{FinalizerConfig, MarketDataPipeline, PipelineConfig, PipelineStats};

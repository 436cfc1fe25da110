//! Core value types and error types shared by every module

pub mod errors;
pub mod types;

pub use errors::{ConfigError, QuoteError};
pub use types::{Candle, CandleKey, CandleSource, Depth, DepthLevel, FinalizedBy, Tick};

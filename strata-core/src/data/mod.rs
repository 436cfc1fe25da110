//! Market data ingestion
//!
//! - `bucket`: interval alignment in the exchange's UTC offset
//! - `candle_builder`: tick → OHLCV aggregation with timer finalization

pub mod bucket;
pub mod candle_builder;

pub use bucket::{parse_utc_offset, width_ms, BucketClock};
pub use candle_builder::{BuilderStats, CandleBuilder, FinalizeOptions};

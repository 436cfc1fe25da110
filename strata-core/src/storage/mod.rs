//! Candle persistence
//!
//! - `sink`: the bulk-insert seam plus memory and JSON-lines sinks
//! - `write_buffer`: bounded, batched, timer-driven flushing

pub mod sink;
pub mod write_buffer;

pub use sink::{CandleSink, JsonlSink, MemorySink};
pub use write_buffer::{BufferStats, CandleWriteBuffer, FlushReport, WriteBufferConfig};

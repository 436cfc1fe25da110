//! Market data pipeline: ticks → candles → write buffer → sink
//!
//! ```text
//! on_ticks ──► CandleBuilder (mutex) ──closed──► CandleWriteBuffer ──flush timer──► CandleSink
//!                    ▲
//!   finalizer timer ─┘ finalize_due(now)
//! ```
//!
//! The builder lock is only held for the synchronous `on_ticks` /
//! `finalize_due` call, never across an await, so the finalizer and the tick
//! path cannot observe a half-applied batch.

use super::market_gate::MarketHours;
use crate::config::StrataConfig;
use crate::core::{Candle, CandleKey, ConfigError, Tick};
use crate::data::{BucketClock, BuilderStats, CandleBuilder, FinalizeOptions};
use crate::storage::{BufferStats, CandleSink, CandleWriteBuffer, FlushReport, WriteBufferConfig};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timer-driven finalization settings
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizerConfig {
    pub enabled: bool,
    /// How often `finalize_due` runs
    pub every: Duration,
    pub options: FinalizeOptions,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every: Duration::from_secs(1),
            options: FinalizeOptions::default(),
        }
    }
}

/// Everything the pipeline needs at construction
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub intervals: Vec<u32>,
    pub clock: BucketClock,
    pub buffer: WriteBufferConfig,
    pub finalizer: FinalizerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            intervals: vec![1, 3, 5, 15],
            clock: BucketClock::default(),
            buffer: WriteBufferConfig::default(),
            finalizer: FinalizerConfig::default(),
        }
    }
}

/// Combined stats snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub builder: BuilderStats,
    pub buffer: BufferStats,
    pub open_candles: usize,
}

struct Finalizer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the builder, the write buffer and the background tasks
pub struct MarketDataPipeline {
    builder: Arc<Mutex<CandleBuilder>>,
    buffer: CandleWriteBuffer,
    finalize_opts: FinalizeOptions,
    finalizer: Option<Finalizer>,
}

impl MarketDataPipeline {
    /// Build the pipeline without starting any background task
    pub fn new(config: PipelineConfig, sink: Arc<dyn CandleSink>) -> Self {
        let builder = CandleBuilder::new(config.intervals.iter().copied(), config.clock);
        Self {
            builder: Arc::new(Mutex::new(builder)),
            buffer: CandleWriteBuffer::new(config.buffer, sink),
            finalize_opts: config.finalizer.options,
            finalizer: None,
        }
    }

    /// Build and start the flush timer and, if enabled, the finalizer timer
    pub fn start(config: PipelineConfig, sink: Arc<dyn CandleSink>) -> Self {
        Self::start_with_hours(config, sink, None)
    }

    /// Like [`start`](Self::start), skipping timer finalization while `hours`
    /// reports the market closed (no synthetic bars overnight)
    pub fn start_with_hours(
        config: PipelineConfig,
        sink: Arc<dyn CandleSink>,
        hours: Option<Arc<dyn MarketHours>>,
    ) -> Self {
        let finalizer_cfg = config.finalizer.clone();
        let mut pipeline = Self::new(config, sink);
        pipeline.buffer.start();

        if finalizer_cfg.enabled {
            pipeline.finalizer = Some(pipeline.spawn_finalizer(finalizer_cfg, hours));
        }

        info!(
            intervals = ?pipeline.builder.lock().intervals(),
            "Market data pipeline started"
        );
        pipeline
    }

    /// Start from loaded configuration, gating the finalizer on market hours
    /// when `market.gate_finalizer` is set
    pub fn from_config(cfg: &StrataConfig, sink: Arc<dyn CandleSink>) -> Result<Self, ConfigError> {
        let config = cfg.pipeline_config()?;
        let hours = cfg.finalizer_hours()?;
        Ok(Self::start_with_hours(config, sink, hours))
    }

    fn spawn_finalizer(
        &self,
        cfg: FinalizerConfig,
        hours: Option<Arc<dyn MarketHours>>,
    ) -> Finalizer {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let builder = Arc::clone(&self.builder);
        let buffer = self.buffer.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cfg.every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let now = Utc::now();
                if let Some(hours) = &hours {
                    if !hours.is_open(now) {
                        continue;
                    }
                }

                let closed = builder.lock().finalize_due(now.timestamp_millis(), cfg.options);
                if !closed.is_empty() {
                    debug!(count = closed.len(), "Timer finalized candles");
                    forward(&buffer, closed);
                }
            }
        });

        Finalizer { cancel, handle }
    }

    /// Feed a batch of ticks; returns how many candles were closed
    pub fn on_ticks(&self, ticks: &[Tick]) -> usize {
        let closed = self.builder.lock().on_ticks(ticks);
        forward(&self.buffer, closed)
    }

    /// Feed ticks with an explicit fallback clock (replay)
    pub fn on_ticks_at(&self, ticks: &[Tick], now_ms: i64) -> usize {
        let closed = self.builder.lock().on_ticks_at(ticks, now_ms);
        forward(&self.buffer, closed)
    }

    /// Run timer finalization once at `now_ms`
    pub fn finalize_at(&self, now_ms: i64) -> usize {
        let closed = self.builder.lock().finalize_due(now_ms, self.finalize_opts);
        forward(&self.buffer, closed)
    }

    pub fn current(&self, key: &CandleKey) -> Option<Candle> {
        self.builder.lock().current(key).cloned()
    }

    pub fn buffer(&self) -> &CandleWriteBuffer {
        &self.buffer
    }

    pub fn stats(&self) -> PipelineStats {
        let builder = self.builder.lock();
        PipelineStats {
            builder: builder.stats(),
            buffer: self.buffer.stats(),
            open_candles: builder.open_count(),
        }
    }

    /// Stop the finalizer, then stop the buffer with a final flush
    pub async fn stop(mut self) -> FlushReport {
        if let Some(Finalizer { cancel, handle }) = self.finalizer.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Finalizer task ended abnormally");
            }
        }

        let report = self.buffer.stop().await;
        let stats = self.stats();
        info!(
            ticks = stats.builder.ticks_seen,
            closed_by_tick = stats.builder.closed_by_tick,
            closed_by_timer = stats.builder.closed_by_timer,
            flushed = stats.buffer.flushed,
            dropped = stats.buffer.dropped,
            "Market data pipeline stopped"
        );
        report
    }
}

fn forward(buffer: &CandleWriteBuffer, closed: Vec<Candle>) -> usize {
    let n = closed.len();
    for candle in closed {
        buffer.enqueue(candle);
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySink;

    const T0: i64 = 1_700_000_040_000; // minute-aligned

    fn config() -> PipelineConfig {
        PipelineConfig {
            intervals: vec![1],
            clock: BucketClock::utc(),
            buffer: WriteBufferConfig {
                flush_interval: Duration::from_millis(100),
                ..Default::default()
            },
            finalizer: FinalizerConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_rollover_reaches_sink_on_stop() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = MarketDataPipeline::start(config(), sink.clone());

        pipeline.on_ticks(&[
            Tick::new("NSE:TCS", 100.0, T0),
            Tick::new("NSE:TCS", 105.0, T0 + 30_000),
        ]);
        assert_eq!(pipeline.on_ticks(&[Tick::new("NSE:TCS", 103.0, T0 + 60_000)]), 1);

        let report = pipeline.stop().await;
        assert!(report.is_clean());
        let stored = sink.candles(1);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].close, 105.0);
        assert_eq!(stored[0].bucket_start, T0);
    }

    #[tokio::test]
    async fn test_manual_finalize_forwards_to_buffer() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = MarketDataPipeline::new(config(), sink.clone());

        pipeline.on_ticks(&[Tick::new("NSE:TCS", 100.0, T0)]);
        assert_eq!(pipeline.finalize_at(T0 + 60_000 + 2_000), 1);
        assert_eq!(pipeline.buffer().stats().buffered, 1);

        let placeholder = pipeline.current(&CandleKey::new("NSE:TCS", 1)).unwrap();
        assert!(placeholder.is_synthetic());

        pipeline.stop().await;
        assert_eq!(sink.total(), 1);
    }

    #[tokio::test]
    async fn test_from_config_uses_configured_intervals() {
        let mut cfg = StrataConfig::default();
        cfg.builder.intervals = vec![1, 5];
        cfg.builder.utc_offset = "+00:00".into();
        cfg.market.gate_finalizer = true;
        // Wall-clock finalization would race the assertions below
        cfg.finalizer.enabled = false;

        let sink = Arc::new(MemorySink::new());
        let pipeline = MarketDataPipeline::from_config(&cfg, sink.clone()).unwrap();
        pipeline.on_ticks(&[Tick::new("NSE:TCS", 100.0, T0)]);
        assert_eq!(pipeline.stats().open_candles, 2);

        pipeline.on_ticks(&[Tick::new("NSE:TCS", 101.0, T0 + 60_000)]);
        pipeline.stop().await;
        assert_eq!(sink.candles(1).len(), 1);
    }

    #[tokio::test]
    async fn test_finalizer_task_stops_cleanly() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = MarketDataPipeline::start(
            PipelineConfig {
                finalizer: FinalizerConfig {
                    enabled: true,
                    every: Duration::from_millis(10),
                    ..Default::default()
                },
                ..config()
            },
            sink,
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = pipeline.stop().await;
        assert_eq!(report.written, 0);
    }
}

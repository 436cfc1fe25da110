//! Prometheus metrics for the market data pipeline
//!
//! Components keep their own counters (`BuilderStats`, `BufferStats`,
//! `GuardStats`); this registry mirrors snapshots of them so the hot paths
//! never touch Prometheus directly. Call the `record_*` methods on whatever
//! cadence the exporter scrapes at.
//!
//! Metric families:
//! - Candles (ticks by outcome, closes by trigger, open candles)
//! - Write buffer (buffered, enqueued, dropped, flushed, failed batches)
//! - Quote guard (requests, retries, failures, breaker state, queue depth)

use crate::engine::PipelineStats;
use crate::quotes::GuardStats;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::info;

/// Raise a counter to a cumulative total taken from a stats snapshot
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::with_opts(Opts::new(name, help).namespace("strata"))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let g = IntGauge::with_opts(Opts::new(name, help).namespace("strata"))?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

/// Central registry for all Prometheus metrics
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    candles: Arc<CandleMetrics>,
    buffer: Arc<BufferMetrics>,
    guard: Arc<GuardMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let candles = Arc::new(CandleMetrics::new(&registry)?);
        let buffer = Arc::new(BufferMetrics::new(&registry)?);
        let guard = Arc::new(GuardMetrics::new(&registry)?);

        info!("Prometheus metrics registry initialized");

        Ok(Self {
            registry,
            candles,
            buffer,
            guard,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn candles(&self) -> &CandleMetrics {
        &self.candles
    }

    pub fn buffer(&self) -> &BufferMetrics {
        &self.buffer
    }

    pub fn guard(&self) -> &GuardMetrics {
        &self.guard
    }

    /// Mirror builder and buffer counters
    pub fn record_pipeline(&self, stats: &PipelineStats) {
        let b = &stats.builder;
        let c = &self.candles;
        advance(&c.ticks_total.with_label_values(&["applied"]), b.ticks_applied);
        advance(&c.ticks_total.with_label_values(&["skipped"]), b.ticks_skipped);
        advance(&c.ticks_total.with_label_values(&["late"]), b.late_ticks);
        advance(&c.closed_total.with_label_values(&["tick"]), b.closed_by_tick);
        advance(&c.closed_total.with_label_values(&["timer"]), b.closed_by_timer);
        advance(&c.synthetic_flips_total, b.synthetic_flips);
        c.open_candles.set(stats.open_candles as i64);

        let s = &stats.buffer;
        let m = &self.buffer;
        m.buffered.set(s.buffered as i64);
        advance(&m.enqueued_total, s.enqueued);
        advance(&m.dropped_total, s.dropped);
        advance(&m.flushed_total, s.flushed);
        advance(&m.failed_batches_total, s.failed_batches);
    }

    /// Mirror guard counters
    pub fn record_guard(&self, stats: &GuardStats) {
        let g = &self.guard;
        advance(&g.requests_total, stats.requests);
        advance(&g.retries_total, stats.retries);
        advance(&g.failures_total, stats.failures);
        advance(&g.breaker_opens_total, stats.breaker_opens);
        advance(&g.breaker_rejections_total, stats.breaker_rejections);
        g.in_flight.set(stats.in_flight as i64);
        g.queued.set(stats.queued as i64);
        g.breaker_open.set(i64::from(stats.breaker_open));
    }

    /// Prometheus text exposition of every registered family
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Candle aggregation metrics
pub struct CandleMetrics {
    /// Ticks by outcome: applied, skipped, late
    pub ticks_total: IntCounterVec,
    /// Closed candles by trigger: tick, timer
    pub closed_total: IntCounterVec,
    pub synthetic_flips_total: IntCounter,
    pub open_candles: IntGauge,
}

impl CandleMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let ticks_total = IntCounterVec::new(
            Opts::new("candle_ticks_total", "Ticks handled by the candle builder")
                .namespace("strata"),
            &["outcome"],
        )?;
        registry.register(Box::new(ticks_total.clone()))?;

        let closed_total = IntCounterVec::new(
            Opts::new("candle_closed_total", "Candles closed").namespace("strata"),
            &["by"],
        )?;
        registry.register(Box::new(closed_total.clone()))?;

        Ok(Self {
            ticks_total,
            closed_total,
            synthetic_flips_total: counter(
                registry,
                "candle_synthetic_flips_total",
                "Synthetic placeholders converted to live by a tick",
            )?,
            open_candles: gauge(registry, "candle_open", "In-progress candles")?,
        })
    }
}

/// Write buffer metrics
pub struct BufferMetrics {
    pub buffered: IntGauge,
    pub enqueued_total: IntCounter,
    pub dropped_total: IntCounter,
    pub flushed_total: IntCounter,
    pub failed_batches_total: IntCounter,
}

impl BufferMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            buffered: gauge(registry, "buffer_candles", "Candles waiting to be written")?,
            enqueued_total: counter(registry, "buffer_enqueued_total", "Candles accepted")?,
            dropped_total: counter(
                registry,
                "buffer_dropped_total",
                "Candles dropped because the buffer was full",
            )?,
            flushed_total: counter(registry, "buffer_flushed_total", "Candles written to the sink")?,
            failed_batches_total: counter(
                registry,
                "buffer_failed_batches_total",
                "Sink inserts that failed and were requeued",
            )?,
        })
    }
}

/// Quote guard metrics
pub struct GuardMetrics {
    pub requests_total: IntCounter,
    pub retries_total: IntCounter,
    pub failures_total: IntCounter,
    pub breaker_opens_total: IntCounter,
    pub breaker_rejections_total: IntCounter,
    pub in_flight: IntGauge,
    pub queued: IntGauge,
    /// 1 while the breaker is open
    pub breaker_open: IntGauge,
}

impl GuardMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            requests_total: counter(registry, "quote_requests_total", "Upstream quote attempts")?,
            retries_total: counter(registry, "quote_retries_total", "Retried quote attempts")?,
            failures_total: counter(
                registry,
                "quote_failures_total",
                "Quote tasks failed after retries",
            )?,
            breaker_opens_total: counter(
                registry,
                "quote_breaker_opens_total",
                "Circuit breaker openings",
            )?,
            breaker_rejections_total: counter(
                registry,
                "quote_breaker_rejections_total",
                "Calls rejected while the breaker was open",
            )?,
            in_flight: gauge(registry, "quote_in_flight", "Quote tasks running")?,
            queued: gauge(registry, "quote_queued", "Quote tasks waiting")?,
            breaker_open: gauge(registry, "quote_breaker_open", "Breaker state (1 = open)")?,
        })
    }
}

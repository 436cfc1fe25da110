//! Candle Builder - turns a tick stream into time-bucketed OHLCV bars
//!
//! One in-progress candle is kept per (instrument, interval). A tick that
//! lands in a later bucket closes the current candle and opens the next one
//! in the same step, so no tick is ever applied to two candles.
//!
//! ## Flow
//!
//! ```text
//!  on_ticks(batch)                         finalize_due(now)
//!       │                                        │
//!       ▼                                        ▼
//!  ┌───────────────┐  later bucket   ┌──────────────────────┐
//!  │ in-progress   │ ──────────────► │ closed (by = tick)   │
//!  │ candle / key  │                 └──────────────────────┘
//!  │               │  bucket + grace ┌──────────────────────┐
//!  │               │ ──────────────► │ closed (by = timer)  │
//!  └───────────────┘     elapsed     └──────────────────────┘
//!          ▲                                     │
//!          └──── synthetic placeholder ◄─────────┘
//!                (seeded at prev close, zero volume)
//! ```
//!
//! Both entry points are synchronous and never suspend; callers that share
//! the builder across tasks wrap it in a mutex (see `engine::pipeline`).

use super::bucket::BucketClock;
use crate::core::{Candle, CandleKey, CandleSource, FinalizedBy, Tick};
use chrono::Utc;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Limits for one `finalize_due` pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeOptions {
    /// How long past the bucket end to wait for a rollover tick
    pub grace_ms: i64,
    /// Max bars closed per key per call (bounds catch-up work)
    pub max_bars: usize,
}

impl Default for FinalizeOptions {
    fn default() -> Self {
        Self {
            grace_ms: 1_500,
            max_bars: 3,
        }
    }
}

/// Counters for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuilderStats {
    /// Ticks handed to `on_ticks`
    pub ticks_seen: u64,
    /// Ticks applied to at least one candle
    pub ticks_applied: u64,
    /// Ticks skipped as malformed (non-finite price, missing instrument)
    pub ticks_skipped: u64,
    /// (tick, interval) updates ignored because the tick predates the open bucket
    pub late_ticks: u64,
    pub closed_by_tick: u64,
    pub closed_by_timer: u64,
    /// Placeholders converted to live by a real tick
    pub synthetic_flips: u64,
}

/// Aggregates ticks into candles for a fixed set of interval widths
#[derive(Debug)]
pub struct CandleBuilder {
    intervals: Vec<u32>,
    clock: BucketClock,
    /// In-progress candle per (instrument, interval)
    candles: HashMap<CandleKey, Candle>,
    /// Last seen cumulative day volume per instrument
    volume_baseline: HashMap<String, f64>,
    /// Timestamp of the last real tick per (instrument, interval)
    last_tick_at: HashMap<CandleKey, i64>,
    /// Instruments already warned about missing volume
    volume_warned: HashSet<String>,
    stats: BuilderStats,
}

impl CandleBuilder {
    /// Create a builder for the given interval widths (minutes)
    pub fn new(intervals: impl IntoIterator<Item = u32>, clock: BucketClock) -> Self {
        let mut intervals: Vec<u32> = intervals.into_iter().filter(|i| *i > 0).collect();
        intervals.sort_unstable();
        intervals.dedup();

        Self {
            intervals,
            clock,
            candles: HashMap::new(),
            volume_baseline: HashMap::new(),
            last_tick_at: HashMap::new(),
            volume_warned: HashSet::new(),
            stats: BuilderStats::default(),
        }
    }

    pub fn intervals(&self) -> &[u32] {
        &self.intervals
    }

    pub fn clock(&self) -> BucketClock {
        self.clock
    }

    /// Apply a batch of ticks in order, returning candles closed by rollover.
    ///
    /// Ticks without an exchange timestamp are stamped with the wall clock.
    pub fn on_ticks(&mut self, ticks: &[Tick]) -> Vec<Candle> {
        self.on_ticks_at(ticks, Utc::now().timestamp_millis())
    }

    /// Same as [`on_ticks`](Self::on_ticks) with an explicit fallback clock
    pub fn on_ticks_at(&mut self, ticks: &[Tick], now_ms: i64) -> Vec<Candle> {
        let mut closed = Vec::new();

        for tick in ticks {
            self.stats.ticks_seen += 1;

            if !tick.last_price.is_finite() || tick.instrument.trim().is_empty() {
                self.stats.ticks_skipped += 1;
                continue;
            }

            let ts = tick.timestamp_ms.unwrap_or(now_ms);
            if !self.has_buckets(ts) {
                self.stats.ticks_skipped += 1;
                debug!(instrument = %tick.instrument, ts, "Skipping tick with out-of-range timestamp");
                continue;
            }

            self.warn_if_volumeless(tick);
            let delta = self.volume_delta(tick);

            if self.apply_tick(tick, ts, delta, &mut closed) {
                self.stats.ticks_applied += 1;
            }
        }

        closed
    }

    /// Close every candle whose bucket (plus grace) has elapsed without a
    /// rollover tick, opening a synthetic placeholder for the next bucket.
    pub fn finalize_due(&mut self, now_ms: i64, opts: FinalizeOptions) -> Vec<Candle> {
        let mut closed = Vec::new();

        let mut keys: Vec<CandleKey> = self.candles.keys().cloned().collect();
        keys.sort_unstable();

        for key in keys {
            let Some(now_bucket) = self.clock.bucket_start(now_ms, key.interval) else {
                continue;
            };

            for _ in 0..opts.max_bars {
                let Some(candle) = self.candles.get(&key) else {
                    break;
                };

                if candle.bucket_start >= now_bucket
                    || now_ms < candle.bucket_end().saturating_add(opts.grace_ms)
                {
                    break;
                }

                let placeholder = Candle::open_synthetic(&key, candle.bucket_end(), candle.close);
                let stale_ms = self.last_tick_at.get(&key).map(|t| now_ms.saturating_sub(*t));

                if let Some(prev) = self.candles.insert(key.clone(), placeholder) {
                    debug!(
                        key = %key,
                        bucket_start = prev.bucket_start,
                        stale_ms = ?stale_ms,
                        "Finalized candle by timer"
                    );
                    closed.push(prev.close_with(now_ms, FinalizedBy::Timer, stale_ms));
                    self.stats.closed_by_timer += 1;
                }
            }
        }

        closed
    }

    /// In-progress candle for a key
    pub fn current(&self, key: &CandleKey) -> Option<&Candle> {
        self.candles.get(key)
    }

    /// Number of in-progress candles
    pub fn open_count(&self) -> usize {
        self.candles.len()
    }

    pub fn stats(&self) -> BuilderStats {
        self.stats.clone()
    }

    /// Apply one validated tick to every interval; returns true if any candle changed
    fn apply_tick(&mut self, tick: &Tick, ts: i64, delta: f64, closed: &mut Vec<Candle>) -> bool {
        let price = tick.last_price;
        let mut applied = false;

        for &interval in &self.intervals {
            let Some(bucket) = self.clock.bucket_start(ts, interval) else {
                continue;
            };
            let key = CandleKey::new(tick.instrument.as_str(), interval);

            match self.candles.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(Candle::open_live(&key, bucket, price, delta));
                }
                Entry::Occupied(mut slot) => {
                    let current_bucket = slot.get().bucket_start;

                    if bucket > current_bucket {
                        let fresh = Candle::open_live(&key, bucket, price, delta);
                        let prev = std::mem::replace(slot.get_mut(), fresh);
                        closed.push(prev.close_with(ts, FinalizedBy::Tick, None));
                        self.stats.closed_by_tick += 1;
                    } else if bucket < current_bucket {
                        self.stats.late_ticks += 1;
                        continue;
                    } else {
                        let candle = slot.get_mut();
                        if candle.source == CandleSource::Synthetic {
                            candle.source = CandleSource::Live;
                            // A zero-volume placeholder price is not a real observation
                            if candle.volume == 0.0 {
                                candle.open = price;
                                candle.high = price;
                                candle.low = price;
                                candle.close = price;
                            }
                            self.stats.synthetic_flips += 1;
                        }
                        candle.apply(price, delta);
                    }
                }
            }

            self.last_tick_at.insert(key, ts);
            applied = true;
        }

        applied
    }

    /// True when `ts` maps to a representable bucket for every interval
    fn has_buckets(&self, ts: i64) -> bool {
        self.intervals
            .iter()
            .all(|&interval| self.clock.bucket_start(ts, interval).is_some())
    }

    /// Volume contributed by one tick.
    ///
    /// LTQ wins when positive; otherwise the increase in cumulative volume since
    /// the last tick. A drop in cumulative volume is treated as a day rollover
    /// and the new value is used as-is. The baseline moves on every tick.
    fn volume_delta(&mut self, tick: &Tick) -> f64 {
        let cumulative_delta = tick
            .cumulative_volume
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|cumulative| {
                match self.volume_baseline.insert(tick.instrument.clone(), cumulative) {
                    Some(prev) if cumulative >= prev => cumulative - prev,
                    Some(prev) => {
                        debug!(
                            instrument = %tick.instrument,
                            prev,
                            cumulative,
                            "Cumulative volume decreased, treating as day rollover"
                        );
                        cumulative
                    }
                    None => 0.0,
                }
            });

        match tick.last_traded_qty {
            Some(qty) if qty.is_finite() && qty > 0.0 => qty,
            _ => cumulative_delta.unwrap_or(0.0),
        }
    }

    fn warn_if_volumeless(&mut self, tick: &Tick) {
        if tick.has_volume_info() || tick.is_index() {
            return;
        }
        if self.volume_warned.insert(tick.instrument.clone()) {
            warn!(
                instrument = %tick.instrument,
                "Tick carries no volume information; subscribe in quote or full mode to build candle volume"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const T0: i64 = 1_700_000_040_000; // aligned to a UTC minute

    fn builder(intervals: &[u32]) -> CandleBuilder {
        CandleBuilder::new(intervals.iter().copied(), BucketClock::utc())
    }

    fn key(interval: u32) -> CandleKey {
        CandleKey::new("NSE:INFY", interval)
    }

    fn tick(price: f64, offset_ms: i64) -> Tick {
        Tick::new("NSE:INFY", price, T0 + offset_ms)
    }

    #[test]
    fn test_intervals_are_sorted_and_deduped() {
        let b = builder(&[5, 1, 5, 0, 15]);
        assert_eq!(b.intervals(), &[1, 5, 15]);
    }

    #[test]
    fn test_ohlc_within_one_bucket() {
        let mut b = builder(&[1]);
        let closed = b.on_ticks(&[tick(100.0, 0), tick(105.0, 30_000), tick(102.0, 59_000)]);

        assert!(closed.is_empty());
        let c = b.current(&key(1)).unwrap();
        assert_eq!((c.open, c.high, c.low, c.close), (100.0, 105.0, 100.0, 102.0));
        assert_eq!(c.bucket_start, T0);
        assert_eq!(c.source, CandleSource::Live);
    }

    #[test]
    fn test_rollover_closes_exactly_one_candle() {
        let mut b = builder(&[1]);
        b.on_ticks(&[tick(100.0, 0), tick(105.0, 30_000), tick(102.0, 59_000)]);

        let closed = b.on_ticks(&[tick(103.0, 60_000)]);
        assert_eq!(closed.len(), 1);

        let prev = &closed[0];
        assert_eq!(prev.close, 102.0);
        assert_eq!(prev.high, 105.0);
        assert_eq!(prev.finalized_by, Some(FinalizedBy::Tick));
        assert_eq!(prev.closed_at, Some(T0 + 60_000));

        let next = b.current(&key(1)).unwrap();
        assert_eq!(next.open, 103.0);
        assert_eq!(next.bucket_start, T0 + 60_000);
    }

    #[test]
    fn test_each_interval_tracked_independently() {
        let mut b = builder(&[1, 5]);
        b.on_ticks(&[tick(100.0, 0)]);
        let closed = b.on_ticks(&[tick(101.0, 61_000)]);

        // 1m rolls over, 5m bucket may or may not depending on alignment of T0
        assert!(closed.iter().any(|c| c.interval == 1));
        assert_eq!(b.open_count(), 2);
    }

    #[test]
    fn test_malformed_ticks_are_skipped() {
        let mut b = builder(&[1]);
        let closed = b.on_ticks(&[
            tick(f64::NAN, 0),
            tick(f64::INFINITY, 1),
            Tick::new("  ", 10.0, T0),
        ]);
        assert!(closed.is_empty());
        assert_eq!(b.open_count(), 0);
        assert_eq!(b.stats().ticks_skipped, 3);
    }

    #[test]
    fn test_cumulative_volume_delta() {
        let mut b = builder(&[1]);
        b.on_ticks(&[
            tick(100.0, 0).with_cumulative_volume(1_000.0),
            tick(100.5, 10_000).with_cumulative_volume(1_250.0),
            tick(101.0, 20_000).with_cumulative_volume(1_400.0),
        ]);
        assert_eq!(b.current(&key(1)).unwrap().volume, 400.0);
    }

    #[test]
    fn test_cumulative_volume_rollover_uses_new_value() {
        let mut b = builder(&[1]);
        b.on_ticks(&[
            tick(100.0, 0).with_cumulative_volume(5_000.0),
            tick(100.0, 10_000).with_cumulative_volume(5_100.0),
            tick(100.0, 20_000).with_cumulative_volume(40.0),
        ]);
        // 100 from the increase, then 40 from the rollover
        assert_eq!(b.current(&key(1)).unwrap().volume, 140.0);
    }

    #[test]
    fn test_ltq_preferred_but_baseline_still_moves() {
        let mut b = builder(&[1]);
        b.on_ticks(&[
            tick(100.0, 0).with_cumulative_volume(1_000.0),
            tick(100.0, 1_000).with_ltq(7.0).with_cumulative_volume(1_500.0),
            tick(100.0, 2_000).with_cumulative_volume(1_510.0),
        ]);
        // 0 (first baseline) + 7 (ltq) + 10 (increase from 1500, not 1000)
        assert_eq!(b.current(&key(1)).unwrap().volume, 17.0);
    }

    #[test]
    fn test_zero_ltq_falls_back_to_cumulative() {
        let mut b = builder(&[1]);
        b.on_ticks(&[
            tick(100.0, 0).with_cumulative_volume(10.0),
            tick(100.0, 1_000).with_ltq(0.0).with_cumulative_volume(25.0),
        ]);
        assert_eq!(b.current(&key(1)).unwrap().volume, 15.0);
    }

    #[test]
    fn test_late_tick_does_not_reopen_old_bucket() {
        let mut b = builder(&[1]);
        b.on_ticks(&[tick(100.0, 0), tick(101.0, 60_000)]);
        let closed = b.on_ticks(&[tick(99.0, 30_000)]);

        assert!(closed.is_empty());
        let c = b.current(&key(1)).unwrap();
        assert_eq!(c.bucket_start, T0 + 60_000);
        assert_eq!(c.low, 101.0);
        assert_eq!(b.stats().late_ticks, 1);
    }

    #[test]
    fn test_finalize_due_closes_stalled_bucket() {
        let mut b = builder(&[1]);
        b.on_ticks(&[tick(100.0, 0), tick(105.0, 30_000), tick(102.0, 59_000)]);

        let opts = FinalizeOptions {
            grace_ms: 1_500,
            max_bars: 3,
        };

        // Inside grace: nothing happens
        assert!(b.finalize_due(T0 + 61_000, opts).is_empty());

        let closed = b.finalize_due(T0 + 62_000, opts);
        assert_eq!(closed.len(), 1);
        let c = &closed[0];
        assert_eq!(c.finalized_by, Some(FinalizedBy::Timer));
        assert_eq!(c.close, 102.0);
        assert_eq!(c.stale_ms, Some(62_000 - 59_000));

        let placeholder = b.current(&key(1)).unwrap();
        assert!(placeholder.is_synthetic());
        assert_eq!(placeholder.bucket_start, T0 + 60_000);
        assert_eq!(placeholder.open, 102.0);
        assert_eq!(placeholder.volume, 0.0);
    }

    #[test]
    fn test_finalize_due_bounded_by_max_bars() {
        let mut b = builder(&[1]);
        b.on_ticks(&[tick(100.0, 0)]);

        let opts = FinalizeOptions {
            grace_ms: 0,
            max_bars: 3,
        };

        // Ten minutes of silence: only three bars per call
        let now = T0 + 10 * 60_000 + 1;
        let first = b.finalize_due(now, opts);
        assert_eq!(first.len(), 3);
        assert!(!first[0].is_synthetic());
        assert!(first[1].is_synthetic());

        let second = b.finalize_due(now, opts);
        assert_eq!(second.len(), 3);
        let third = b.finalize_due(now, opts);
        assert_eq!(third.len(), 3);
        let fourth = b.finalize_due(now, opts);
        assert_eq!(fourth.len(), 1);
        assert!(b.finalize_due(now, opts).is_empty());

        assert_eq!(b.current(&key(1)).unwrap().bucket_start, T0 + 10 * 60_000);
    }

    #[test]
    fn test_synthetic_flip_resets_zero_volume_placeholder() {
        let mut b = builder(&[1]);
        b.on_ticks(&[tick(100.0, 0)]);
        b.finalize_due(T0 + 62_000, FinalizeOptions::default());
        assert!(b.current(&key(1)).unwrap().is_synthetic());

        b.on_ticks(&[tick(110.0, 62_500)]);
        let c = b.current(&key(1)).unwrap();
        assert_eq!(c.source, CandleSource::Live);
        assert_eq!((c.open, c.high, c.low, c.close), (110.0, 110.0, 110.0, 110.0));
        assert_eq!(b.stats().synthetic_flips, 1);
    }

    #[test]
    fn test_rollover_of_synthetic_placeholder() {
        let mut b = builder(&[1]);
        b.on_ticks(&[tick(100.0, 0)]);
        b.finalize_due(T0 + 62_000, FinalizeOptions::default());

        // No tick during the placeholder's bucket; next tick lands two minutes later
        let closed = b.on_ticks(&[tick(90.0, 125_000)]);
        assert_eq!(closed.len(), 1);
        assert!(closed[0].is_synthetic());
        assert_eq!(closed[0].finalized_by, Some(FinalizedBy::Tick));
        assert_eq!(b.current(&key(1)).unwrap().open, 90.0);
    }

    #[test]
    fn test_out_of_range_timestamp_is_skipped() {
        let mut b = CandleBuilder::new([1, 15], BucketClock::from_offset_str("+05:30").unwrap());
        let closed = b.on_ticks(&[
            Tick::new("NSE:INFY", 100.0, i64::MAX),
            Tick::new("NSE:INFY", 101.0, i64::MIN),
            tick(102.0, 0).with_ltq(5.0),
        ]);

        assert!(closed.is_empty());
        let stats = b.stats();
        assert_eq!(stats.ticks_seen, 3);
        assert_eq!(stats.ticks_skipped, 2);
        assert_eq!(stats.ticks_applied, 1);
        let c = b.current(&key(1)).unwrap();
        assert_eq!(c.open, 102.0);
        assert_eq!(c.volume, 5.0);
    }

    #[test]
    fn test_finalize_due_near_end_of_time_does_not_panic() {
        let mut b = builder(&[1]);
        let last = (i64::MAX / 60_000 - 1) * 60_000;
        b.on_ticks(&[Tick::new("NSE:INFY", 100.0, last)]);

        let closed = b.finalize_due(i64::MAX, FinalizeOptions::default());
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].bucket_start, last);

        // The placeholder's end saturates instead of wrapping
        let placeholder = b.current(&key(1)).unwrap();
        assert_eq!(placeholder.bucket_start, last + 60_000);
        assert_eq!(placeholder.bucket_end(), i64::MAX);

        let opts = FinalizeOptions {
            grace_ms: i64::MAX,
            max_bars: 3,
        };
        assert!(b.finalize_due(i64::MAX, opts).is_empty());
        assert!(b.finalize_due(i64::MIN, opts).is_empty());
    }

    #[test]
    fn test_missing_timestamp_uses_fallback_clock() {
        let mut b = builder(&[1]);
        let mut t = tick(100.0, 0);
        t.timestamp_ms = None;
        b.on_ticks_at(&[t], T0 + 5 * 60_000 + 10);
        assert_eq!(b.current(&key(1)).unwrap().bucket_start, T0 + 5 * 60_000);
    }

    #[test]
    fn test_index_ticks_do_not_need_volume() {
        let mut b = builder(&[1]);
        let t = Tick::new("NSE:NIFTY 50", 22_000.0, T0).with_segment("INDICES");
        b.on_ticks(&[t]);
        assert!(b.volume_warned.is_empty());

        b.on_ticks(&[tick(100.0, 0), tick(100.0, 1)]);
        assert_eq!(b.volume_warned.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_ohlc_matches_prices(prices in prop::collection::vec(1.0f64..10_000.0, 1..50)) {
            let mut b = builder(&[1]);
            let ticks: Vec<Tick> = prices
                .iter()
                .enumerate()
                .map(|(i, p)| tick(*p, i as i64 * 100))
                .collect();
            let closed = b.on_ticks(&ticks);
            prop_assert!(closed.is_empty());

            let c = b.current(&key(1)).unwrap();
            let max = prices.iter().cloned().fold(f64::MIN, f64::max);
            let min = prices.iter().cloned().fold(f64::MAX, f64::min);
            prop_assert_eq!(c.open, prices[0]);
            prop_assert_eq!(c.close, *prices.last().unwrap());
            prop_assert_eq!(c.high, max);
            prop_assert_eq!(c.low, min);
        }

        #[test]
        fn prop_volume_never_negative(volumes in prop::collection::vec(0.0f64..1e7, 1..50)) {
            let mut b = builder(&[1]);
            let ticks: Vec<Tick> = volumes
                .iter()
                .enumerate()
                .map(|(i, v)| tick(100.0, i as i64 * 100).with_cumulative_volume(*v))
                .collect();
            b.on_ticks(&ticks);
            prop_assert!(b.current(&key(1)).unwrap().volume >= 0.0);
        }
    }
}

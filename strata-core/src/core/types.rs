//! Market data value types
//!
//! Ticks come in from the upstream feed, candles go out to the write buffer.
//! All timestamps are epoch milliseconds (UTC); bucket alignment to the
//! exchange's local day happens in [`crate::data::BucketClock`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Best price level on one side of the book
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Top-of-book snapshot carried on full-mode ticks
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Depth {
    #[serde(default)]
    pub best_bid: Option<DepthLevel>,
    #[serde(default)]
    pub best_ask: Option<DepthLevel>,
}

impl Depth {
    /// True when neither side carries a level
    pub fn is_empty(&self) -> bool {
        self.best_bid.is_none() && self.best_ask.is_none()
    }
}

/// A single market data update for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument key (e.g. "NSE:RELIANCE" or an exchange token)
    pub instrument: String,
    /// Last traded price
    pub last_price: f64,
    /// Last traded quantity (LTQ)
    #[serde(default)]
    pub last_traded_qty: Option<f64>,
    /// Cumulative day volume as reported by the exchange
    #[serde(default)]
    pub cumulative_volume: Option<f64>,
    /// Exchange timestamp; the builder falls back to wall clock when absent
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
    #[serde(default)]
    pub depth: Option<Depth>,
    /// Exchange segment (e.g. "NSE", "INDICES")
    #[serde(default)]
    pub segment: Option<String>,
    /// Instrument type (e.g. "EQ", "FUT", "INDEX")
    #[serde(default)]
    pub instrument_type: Option<String>,
    #[serde(default)]
    pub tradable: Option<bool>,
}

impl Tick {
    /// Minimal tick: instrument, price and exchange timestamp
    pub fn new(instrument: impl Into<String>, last_price: f64, timestamp_ms: i64) -> Self {
        Self {
            instrument: instrument.into(),
            last_price,
            last_traded_qty: None,
            cumulative_volume: None,
            timestamp_ms: Some(timestamp_ms),
            depth: None,
            segment: None,
            instrument_type: None,
            tradable: None,
        }
    }

    pub fn with_ltq(mut self, qty: f64) -> Self {
        self.last_traded_qty = Some(qty);
        self
    }

    pub fn with_cumulative_volume(mut self, volume: f64) -> Self {
        self.cumulative_volume = Some(volume);
        self
    }

    pub fn with_depth(mut self, depth: Depth) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    pub fn with_tradable(mut self, tradable: bool) -> Self {
        self.tradable = Some(tradable);
        self
    }

    /// Index instruments never carry volume.
    ///
    /// Recognised by segment/type flag, or by a non-tradable tick without depth.
    pub fn is_index(&self) -> bool {
        let segment_is_index = self
            .segment
            .as_deref()
            .map(|s| s.to_ascii_uppercase().contains("INDICES"))
            .unwrap_or(false);

        let type_is_index = self
            .instrument_type
            .as_deref()
            .map(|t| matches!(t.to_ascii_uppercase().as_str(), "INDEX" | "IDX"))
            .unwrap_or(false);

        let no_depth = self.depth.map(|d| d.is_empty()).unwrap_or(true);

        segment_is_index || type_is_index || (no_depth && self.tradable == Some(false))
    }

    /// True when the tick carries either LTQ or cumulative volume
    pub fn has_volume_info(&self) -> bool {
        self.last_traded_qty.is_some() || self.cumulative_volume.is_some()
    }
}

/// Identifies one in-progress candle: (instrument, interval minutes)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandleKey {
    pub instrument: String,
    pub interval: u32,
}

impl CandleKey {
    pub fn new(instrument: impl Into<String>, interval: u32) -> Self {
        Self {
            instrument: instrument.into(),
            interval,
        }
    }
}

impl fmt::Display for CandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}m", self.instrument, self.interval)
    }
}

/// Where a candle's data came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleSource {
    /// Opened by a real tick
    Live,
    /// Placeholder opened by the timer finalizer, seeded at the previous close
    Synthetic,
}

/// What closed a candle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizedBy {
    /// A tick for a later bucket arrived
    Tick,
    /// The bucket elapsed (plus grace) without a rollover tick
    Timer,
}

/// OHLCV bar for one instrument and one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    /// Interval width in minutes
    pub interval: u32,
    /// Bucket start (epoch ms)
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub source: CandleSource,
    /// Set once the candle is closed
    #[serde(default)]
    pub closed_at: Option<i64>,
    #[serde(default)]
    pub finalized_by: Option<FinalizedBy>,
    /// Time since the last real tick when closed by the timer
    #[serde(default)]
    pub stale_ms: Option<i64>,
}

impl Candle {
    /// Open a live candle from its first tick
    pub fn open_live(key: &CandleKey, bucket_start: i64, price: f64, volume: f64) -> Self {
        Self {
            instrument: key.instrument.clone(),
            interval: key.interval,
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            source: CandleSource::Live,
            closed_at: None,
            finalized_by: None,
            stale_ms: None,
        }
    }

    /// Open a zero-volume placeholder seeded at `seed_price`
    pub fn open_synthetic(key: &CandleKey, bucket_start: i64, seed_price: f64) -> Self {
        Self {
            source: CandleSource::Synthetic,
            ..Self::open_live(key, bucket_start, seed_price, 0.0)
        }
    }

    pub fn key(&self) -> CandleKey {
        CandleKey::new(self.instrument.clone(), self.interval)
    }

    /// Interval width in milliseconds
    pub fn width_ms(&self) -> i64 {
        i64::from(self.interval) * 60_000
    }

    /// Exclusive bucket end (epoch ms), saturating at the end of time
    pub fn bucket_end(&self) -> i64 {
        self.bucket_start.saturating_add(self.width_ms())
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    pub fn is_synthetic(&self) -> bool {
        self.source == CandleSource::Synthetic
    }

    /// Bucket start as a UTC datetime
    pub fn bucket_start_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.bucket_start).single()
    }

    /// Fold a price (and volume delta) into an open candle
    pub(crate) fn apply(&mut self, price: f64, volume_delta: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume_delta;
    }

    /// Freeze the candle, tagging who closed it and when
    pub(crate) fn close_with(mut self, closed_at: i64, by: FinalizedBy, stale_ms: Option<i64>) -> Self {
        self.closed_at = Some(closed_at);
        self.finalized_by = Some(by);
        self.stale_ms = stale_ms;
        self
    }
}

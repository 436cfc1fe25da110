use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrataConfig {
    #[serde(default)]
    pub builder: BuilderConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub finalizer: FinalizerSettings,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Candle aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Interval widths in minutes
    #[serde(default = "default_intervals")]
    pub intervals: Vec<u32>,

    /// Exchange UTC offset used for bucket alignment ("+05:30")
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

/// Candle write buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Max candles per bulk insert
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Candles held before new ones are dropped
    #[serde(default = "default_max_buffered")]
    pub max_buffered: usize,

    #[serde(default = "default_drop_log_interval_secs")]
    pub drop_log_interval_secs: u64,
}

/// Timer-driven finalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_finalize_every_ms")]
    pub every_ms: u64,

    /// Wait past the bucket end before closing without a tick
    #[serde(default = "default_grace_ms")]
    pub grace_ms: i64,

    /// Max bars closed per key per pass
    #[serde(default = "default_max_bars")]
    pub max_bars: usize,
}

/// Quote guard admission, retry and breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_min_spacing_ms")]
    pub min_spacing_ms: u64,

    /// Requests allowed inside one rolling window
    #[serde(default = "default_window_max_requests")]
    pub window_max_requests: usize,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Jitter on admission and backoff sleeps (0.0 to 1.0)
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: f64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Consecutive failed tasks before the breaker opens
    #[serde(default = "default_breaker_failures")]
    pub breaker_failures: u32,

    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,
}

/// Trading session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Local open time "HH:MM"
    #[serde(default = "default_market_open")]
    pub open: String,

    /// Local close time "HH:MM" (exclusive)
    #[serde(default = "default_market_close")]
    pub close: String,

    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,

    /// Skip timer finalization outside the session
    #[serde(default)]
    pub gate_finalizer: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json: bool,
}

// Default value functions
fn default_intervals() -> Vec<u32> {
    vec![1, 3, 5, 15]
}

fn default_utc_offset() -> String {
    "+05:30".to_string() // IST
}

fn default_flush_interval_ms() -> u64 {
    2_000
}

fn default_batch_size() -> usize {
    500
}

fn default_max_buffered() -> usize {
    50_000
}

fn default_drop_log_interval_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_finalize_every_ms() -> u64 {
    1_000
}

fn default_grace_ms() -> i64 {
    1_500
}

fn default_max_bars() -> usize {
    3
}

fn default_chunk_size() -> usize {
    500
}

fn default_concurrency() -> usize {
    2
}

fn default_min_spacing_ms() -> u64 {
    120
}

fn default_window_max_requests() -> usize {
    8
}

fn default_window_ms() -> u64 {
    1_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    4_000
}

fn default_jitter_pct() -> f64 {
    0.2 // ±20%
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_breaker_failures() -> u32 {
    5
}

fn default_breaker_cooldown_ms() -> u64 {
    30_000
}

fn default_market_open() -> String {
    "09:15".to_string()
}

fn default_market_close() -> String {
    "15:30".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            intervals: default_intervals(),
            utc_offset: default_utc_offset(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            batch_size: default_batch_size(),
            max_buffered: default_max_buffered(),
            drop_log_interval_secs: default_drop_log_interval_secs(),
        }
    }
}

impl Default for FinalizerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            every_ms: default_finalize_every_ms(),
            grace_ms: default_grace_ms(),
            max_bars: default_max_bars(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
            min_spacing_ms: default_min_spacing_ms(),
            window_max_requests: default_window_max_requests(),
            window_ms: default_window_ms(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_pct: default_jitter_pct(),
            request_timeout_ms: default_request_timeout_ms(),
            breaker_failures: default_breaker_failures(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            open: default_market_open(),
            close: default_market_close(),
            utc_offset: default_utc_offset(),
            gate_finalizer: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

pub mod types;

pub use types::*;

use crate::core::ConfigError;
use crate::data::{parse_utc_offset, BucketClock, FinalizeOptions};
use crate::engine::{FinalizerConfig, MarketHours, PipelineConfig, SessionHours};
use crate::quotes::{AdmissionConfig, QuoteGuardConfig};
use crate::resilience::{BackoffConfig, CircuitBreakerConfig};
use crate::storage::WriteBufferConfig;
use anyhow::{Context, Result};
use config::{Config as ConfigLoader, Environment, File};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const MINUTES_PER_DAY: u32 = 1_440;
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl StrataConfig {
    /// Load configuration from file with environment variable overrides
    /// (`STRATA__GUARD__CONCURRENCY=4` overrides `guard.concurrency`)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = path.as_ref();

        let config = ConfigLoader::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load from TOML file
            .add_source(File::from(config_path))
            // Override with environment variables (STRATA__)
            .add_source(
                Environment::with_prefix("STRATA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let cfg: StrataConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        cfg.validate()
            .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;

        Ok(cfg)
    }

    /// Load from default location (./config/default.toml)
    pub fn load_default() -> Result<Self> {
        Self::load("config/default.toml")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.builder;
        if b.intervals.is_empty() {
            return Err(ConfigError::invalid("builder.intervals", "at least one interval is required"));
        }
        for &interval in &b.intervals {
            if interval == 0 {
                return Err(ConfigError::invalid("builder.intervals", "intervals must be positive"));
            }
            if MINUTES_PER_DAY % interval != 0 {
                return Err(ConfigError::invalid(
                    "builder.intervals",
                    format!("{}m does not divide a trading day evenly", interval),
                ));
            }
        }
        parse_utc_offset(&b.utc_offset)?;

        let buf = &self.buffer;
        if buf.batch_size == 0 {
            return Err(ConfigError::invalid("buffer.batch_size", "must be positive"));
        }
        if buf.batch_size > buf.max_buffered {
            return Err(ConfigError::invalid(
                "buffer.batch_size",
                format!("{} exceeds max_buffered {}", buf.batch_size, buf.max_buffered),
            ));
        }
        if buf.flush_interval_ms == 0 {
            return Err(ConfigError::invalid("buffer.flush_interval_ms", "must be positive"));
        }

        let fin = &self.finalizer;
        if fin.grace_ms < 0 {
            return Err(ConfigError::invalid("finalizer.grace_ms", "must not be negative"));
        }
        if fin.enabled && fin.max_bars == 0 {
            return Err(ConfigError::invalid("finalizer.max_bars", "must be positive"));
        }

        let g = &self.guard;
        if g.chunk_size == 0 {
            return Err(ConfigError::invalid("guard.chunk_size", "must be positive"));
        }
        if g.concurrency == 0 {
            return Err(ConfigError::invalid("guard.concurrency", "must be positive"));
        }
        if g.window_max_requests == 0 || g.window_ms == 0 {
            return Err(ConfigError::invalid(
                "guard.window_max_requests",
                "rolling window budget must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&g.jitter_pct) {
            return Err(ConfigError::invalid(
                "guard.jitter_pct",
                format!("{} is outside [0, 1]", g.jitter_pct),
            ));
        }
        if g.max_backoff_ms < g.base_backoff_ms {
            return Err(ConfigError::invalid(
                "guard.max_backoff_ms",
                "must be at least base_backoff_ms",
            ));
        }
        if g.breaker_failures == 0 {
            return Err(ConfigError::invalid("guard.breaker_failures", "must be positive"));
        }

        SessionHours::parse(&self.market.open, &self.market.close, &self.market.utc_offset)?;

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("'{}', must be one of: {:?}", self.logging.level, VALID_LOG_LEVELS),
            ));
        }

        Ok(())
    }

    pub fn clock(&self) -> Result<BucketClock, ConfigError> {
        BucketClock::from_offset_str(&self.builder.utc_offset)
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        Ok(PipelineConfig {
            intervals: self.builder.intervals.clone(),
            clock: self.clock()?,
            buffer: WriteBufferConfig {
                flush_interval: Duration::from_millis(self.buffer.flush_interval_ms),
                batch_size: self.buffer.batch_size,
                max_buffered: self.buffer.max_buffered,
                drop_log_interval: Duration::from_secs(self.buffer.drop_log_interval_secs),
            },
            finalizer: FinalizerConfig {
                enabled: self.finalizer.enabled,
                every: Duration::from_millis(self.finalizer.every_ms),
                options: FinalizeOptions {
                    grace_ms: self.finalizer.grace_ms,
                    max_bars: self.finalizer.max_bars,
                },
            },
        })
    }

    pub fn quote_guard_config(&self) -> QuoteGuardConfig {
        let g = &self.guard;
        QuoteGuardConfig {
            enabled: g.enabled,
            chunk_size: g.chunk_size,
            concurrency: g.concurrency,
            admission: AdmissionConfig {
                min_spacing: Duration::from_millis(g.min_spacing_ms),
                max_requests: g.window_max_requests,
                window: Duration::from_millis(g.window_ms),
                jitter_pct: g.jitter_pct,
            },
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(g.base_backoff_ms),
                max_delay: Duration::from_millis(g.max_backoff_ms),
                max_retries: g.max_retries,
                jitter_pct: g.jitter_pct,
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: g.breaker_failures,
                cooldown: Duration::from_millis(g.breaker_cooldown_ms),
            },
            request_timeout: Duration::from_millis(g.request_timeout_ms),
            ..QuoteGuardConfig::default()
        }
    }

    pub fn session_hours(&self) -> Result<SessionHours, ConfigError> {
        SessionHours::parse(&self.market.open, &self.market.close, &self.market.utc_offset)
    }

    /// Session hours gating the finalizer, when `market.gate_finalizer` is set
    pub fn finalizer_hours(&self) -> Result<Option<Arc<dyn MarketHours>>, ConfigError> {
        if !self.market.gate_finalizer {
            return Ok(None);
        }
        let hours: Arc<dyn MarketHours> = Arc::new(self.session_hours()?);
        Ok(Some(hours))
    }
}

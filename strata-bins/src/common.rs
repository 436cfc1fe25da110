//! Common utilities for all binaries
//!
//! Shared initialization, CLI parsing, and setup code.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use strata_core::engine::PipelineStats;
use strata_core::utils::init_from_config;
use strata_core::StrataConfig;

/// Common CLI arguments for all binaries
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// TOML config file (defaults apply when omitted)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level, overrides the config file
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    pub json_logs: bool,

    /// Print Prometheus metrics on exit
    #[arg(long)]
    pub metrics: bool,
}

impl CommonArgs {
    /// Load the config file (or defaults) and apply CLI overrides
    pub fn load_config(&self) -> Result<StrataConfig> {
        let mut cfg = match &self.config {
            Some(path) => StrataConfig::load(path)?,
            None => StrataConfig::default(),
        };
        if let Some(level) = &self.log_level {
            cfg.logging.level = level.clone();
        }
        if self.json_logs {
            cfg.logging.json = true;
        }
        cfg.validate().context("Invalid configuration after CLI overrides")?;
        Ok(cfg)
    }
}

/// Initialize tracing/logging from the loaded config
pub fn init_logging(cfg: &StrataConfig) -> Result<()> {
    init_from_config(&cfg.logging)
}

/// Print final statistics
pub fn print_stats(stats: &PipelineStats) {
    let b = &stats.builder;
    let w = &stats.buffer;
    tracing::info!("=== Final Statistics ===");
    tracing::info!("Ticks seen: {}", b.ticks_seen);
    tracing::info!("Ticks applied: {} (skipped {}, late {})", b.ticks_applied, b.ticks_skipped, b.late_ticks);
    tracing::info!("Candles closed: {} by tick, {} by timer", b.closed_by_tick, b.closed_by_timer);
    tracing::info!("Open candles: {}", stats.open_candles);
    tracing::info!("Candles flushed: {} (dropped {}, failed batches {})", w.flushed, w.dropped, w.failed_batches);

    if w.buffered > 0 {
        tracing::warn!("{} candles were not persisted", w.buffered);
    }
}

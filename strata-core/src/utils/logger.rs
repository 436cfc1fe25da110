use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing logger; `RUST_LOG` takes precedence over `log_level`
pub fn init_logger(log_level: &str, json_logs: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log filter '{}'", log_level))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if json_logs {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
    };
    installed.context("Global tracing subscriber already set")
}

/// Initialize from the `[logging]` config section
pub fn init_from_config(cfg: &LoggingConfig) -> Result<()> {
    init_logger(&cfg.level, cfg.json)
}

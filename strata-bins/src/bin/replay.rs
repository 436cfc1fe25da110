//! Tick Replay
//!
//! Replays a JSON-lines tick file through the market data pipeline and
//! writes closed candles to per-interval JSON-lines files:
//! - one `Tick` object per line (`instrument`, `last_price`, `timestamp_ms`, ...)
//! - ticks are fed in batches, in file order
//! - Ctrl-C stops the replay and still drains the write buffer

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_bins::common::{init_logging, print_stats, CommonArgs};
use strata_core::data::width_ms;
use strata_core::monitoring::MetricsRegistry;
use strata_core::storage::JsonlSink;
use strata_core::{MarketDataPipeline, Tick};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay a tick file into candle files")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// JSON-lines tick file
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory for candles_<N>m.jsonl
    #[arg(short, long, default_value = "./data/candles")]
    out: PathBuf,

    /// Ticks per on_ticks call
    #[arg(long, default_value_t = 256)]
    batch: usize,

    /// Close candles still open at end of file
    #[arg(long)]
    close_open: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = args.common.load_config()?;
    init_logging(&cfg)?;

    info!("=== Strata: Tick Replay ===");
    info!("Input: {}", args.input.display());
    info!("Output: {}", args.out.display());

    let mut pipeline_cfg = cfg.pipeline_config()?;
    // Replay time is file time; the wall-clock finalizer would close everything at once
    pipeline_cfg.finalizer.enabled = false;
    let finalize_opts = pipeline_cfg.finalizer.options;
    let widest = pipeline_cfg.intervals.iter().copied().max().unwrap_or(1);

    let sink = Arc::new(JsonlSink::new(&args.out));
    let pipeline = MarketDataPipeline::start(pipeline_cfg, sink);

    let replay = replay_file(&pipeline, &args.input, args.batch.max(1));
    let last_ts = tokio::select! {
        res = replay => res?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping replay");
            None
        }
    };

    if args.close_open {
        if let Some(ts) = last_ts {
            let due = ts
                .saturating_add(width_ms(widest))
                .saturating_add(finalize_opts.grace_ms);
            let closed = pipeline.finalize_at(due);
            info!("Closed {} trailing candles", closed);
        }
    }

    let buffer = pipeline.buffer().clone();
    let mut final_stats = pipeline.stats();
    let report = pipeline.stop().await;
    if !report.is_clean() {
        warn!(intervals = ?report.failed_intervals, "Final flush incomplete");
    }

    final_stats.buffer = buffer.stats();
    print_stats(&final_stats);

    if args.common.metrics {
        let metrics = MetricsRegistry::new()?;
        metrics.record_pipeline(&final_stats);
        println!("{}", metrics.encode_text()?);
    }

    Ok(())
}

/// Feed the file through the pipeline; returns the last tick timestamp seen
async fn replay_file(
    pipeline: &MarketDataPipeline,
    path: &Path,
    batch_size: usize,
) -> Result<Option<i64>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut batch: Vec<Tick> = Vec::with_capacity(batch_size);
    let mut last_ts = None;
    let mut line_no = 0u64;
    let mut bad_lines = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Tick>(&line) {
            Ok(tick) => {
                if let Some(ts) = tick.timestamp_ms {
                    last_ts = Some(last_ts.map_or(ts, |prev: i64| prev.max(ts)));
                }
                batch.push(tick);
            }
            Err(e) => {
                bad_lines += 1;
                if bad_lines <= 10 {
                    warn!(line = line_no, error = %e, "Skipping unparsable tick line");
                }
            }
        }

        if batch.len() >= batch_size {
            feed(pipeline, &mut batch, last_ts);
            // Let the flush task run between batches
            tokio::task::yield_now().await;
        }
    }
    feed(pipeline, &mut batch, last_ts);

    info!(lines = line_no, bad_lines, "Replay finished");
    Ok(last_ts)
}

fn feed(pipeline: &MarketDataPipeline, batch: &mut Vec<Tick>, last_ts: Option<i64>) {
    if batch.is_empty() {
        return;
    }
    // Ticks without a timestamp are stamped with the latest file time
    pipeline.on_ticks_at(batch, last_ts.unwrap_or(0));
    batch.clear();
}

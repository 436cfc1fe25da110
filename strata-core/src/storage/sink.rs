//! Persistence sinks for closed candles
//!
//! The write buffer only needs `insert_many(interval, candles)`. The storage
//! layer behind it is responsible for idempotent upserts: the same bar may be
//! written more than once after a failed-then-retried batch.

use crate::core::Candle;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Bulk candle writer
#[async_trait]
pub trait CandleSink: Send + Sync {
    /// Best-effort bulk write of closed candles for one interval width
    async fn insert_many(&self, interval: u32, candles: &[Candle]) -> Result<()>;
}

#[async_trait]
impl<T: CandleSink + ?Sized> CandleSink for Arc<T> {
    async fn insert_many(&self, interval: u32, candles: &[Candle]) -> Result<()> {
        (**self).insert_many(interval, candles).await
    }
}

/// In-memory sink for dry runs and tests, with failure injection
#[derive(Debug, Default)]
pub struct MemorySink {
    stored: Mutex<BTreeMap<u32, Vec<Candle>>>,
    fail_next: AtomicUsize,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls, then recover
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every call until switched off
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Candles stored for one interval, in write order
    pub fn candles(&self, interval: u32) -> Vec<Candle> {
        self.stored.lock().get(&interval).cloned().unwrap_or_default()
    }

    /// Total candles stored across intervals
    pub fn total(&self) -> usize {
        self.stored.lock().values().map(Vec::len).sum()
    }

    /// Number of `insert_many` calls, including failed ones
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandleSink for MemorySink {
    async fn insert_many(&self, interval: u32, candles: &[Candle]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("memory sink is failing");
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            anyhow::bail!("injected insert failure");
        }

        self.stored
            .lock()
            .entry(interval)
            .or_default()
            .extend_from_slice(candles);
        Ok(())
    }
}

/// Append-only JSON-lines files, one per interval: `<dir>/candles_<N>m.jsonl`
#[derive(Debug, Clone)]
pub struct JsonlSink {
    dir: PathBuf,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, interval: u32) -> PathBuf {
        self.dir.join(format!("candles_{}m.jsonl", interval))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl CandleSink for JsonlSink {
    async fn insert_many(&self, interval: u32, candles: &[Candle]) -> Result<()> {
        let mut buf = Vec::with_capacity(candles.len() * 192);
        for candle in candles {
            serde_json::to_writer(&mut buf, candle).context("Failed to encode candle")?;
            buf.push(b'\n');
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.path_for(interval);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;

        file.write_all(&buf)
            .await
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

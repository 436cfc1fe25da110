//! Candle Write Buffer - batches closed candles and flushes them on a timer
//!
//! ## Backpressure policy
//!
//! ```text
//! enqueue(candle) ──► buffered < max ? ──yes──► pending[interval].push_back
//!                            │
//!                            no
//!                            ▼
//!                      drop + count (throttled warn)
//! ```
//!
//! `enqueue` never blocks the tick path. A failing store grows the pending
//! lists up to `max_buffered`, after which new candles are dropped: bounded
//! memory instead of an unbounded leak.
//!
//! ## Flush
//!
//! Flushes are serialized by an async mutex, so a second `flush()` waits for
//! the first. Each interval is drained in FIFO batches of `batch_size`; a
//! failed batch goes back to the front of its list and that interval is
//! retried on the next cycle. A batch in flight still counts toward the
//! buffered total until the store confirms it.
//!
//! There is no per-call timeout on the store: a store call that never returns
//! stalls the flush cycle.

use super::sink::CandleSink;
use crate::core::Candle;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the write buffer
#[derive(Debug, Clone)]
pub struct WriteBufferConfig {
    /// Period of the background flush timer
    pub flush_interval: Duration,
    /// Max candles handed to the sink per call
    pub batch_size: usize,
    /// Max candles held across all intervals before dropping
    pub max_buffered: usize,
    /// Minimum spacing between "dropping candles" warnings
    pub drop_log_interval: Duration,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(2),
            batch_size: 500,
            max_buffered: 50_000,
            drop_log_interval: Duration::from_secs(10),
        }
    }
}

/// Snapshot of buffer counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Candles currently held (including a batch in flight)
    pub buffered: usize,
    /// Candles accepted by `enqueue`
    pub enqueued: u64,
    /// Candles rejected because the buffer was full
    pub dropped: u64,
    /// Candles confirmed written by the sink
    pub flushed: u64,
    /// Sink calls that failed and were requeued
    pub failed_batches: u64,
    /// Completed flush cycles
    pub flushes: u64,
}

/// Outcome of one flush cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Candles written during this cycle
    pub written: usize,
    /// Intervals whose flush aborted on a sink error
    pub failed_intervals: Vec<u32>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed_intervals.is_empty()
    }
}

#[derive(Debug, Default)]
struct BufferState {
    pending: BTreeMap<u32, VecDeque<Candle>>,
    stats: BufferStats,
    last_drop_log: Option<Instant>,
}

struct FlushTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: WriteBufferConfig,
    sink: Arc<dyn CandleSink>,
    state: Mutex<BufferState>,
    /// Serializes flush cycles
    flush_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<FlushTask>>,
}

/// Cloneable handle to a shared write buffer
#[derive(Clone)]
pub struct CandleWriteBuffer {
    inner: Arc<Inner>,
}

impl CandleWriteBuffer {
    pub fn new(config: WriteBufferConfig, sink: Arc<dyn CandleSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                state: Mutex::new(BufferState::default()),
                flush_lock: tokio::sync::Mutex::new(()),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &WriteBufferConfig {
        &self.inner.config
    }

    /// Queue a closed candle for persistence.
    ///
    /// Returns false if the candle was dropped because the buffer is full.
    pub fn enqueue(&self, candle: Candle) -> bool {
        let mut state = self.inner.state.lock();

        if state.stats.buffered >= self.inner.config.max_buffered {
            state.stats.dropped += 1;

            let should_log = state
                .last_drop_log
                .map(|t| t.elapsed() >= self.inner.config.drop_log_interval)
                .unwrap_or(true);
            if should_log {
                state.last_drop_log = Some(Instant::now());
                warn!(
                    dropped_total = state.stats.dropped,
                    max_buffered = self.inner.config.max_buffered,
                    instrument = %candle.instrument,
                    interval = candle.interval,
                    "Candle write buffer full, dropping closed candles"
                );
            }
            return false;
        }

        state
            .pending
            .entry(candle.interval)
            .or_default()
            .push_back(candle);
        state.stats.buffered += 1;
        state.stats.enqueued += 1;
        true
    }

    /// Queue several candles, returning how many were accepted
    pub fn enqueue_all(&self, candles: impl IntoIterator<Item = Candle>) -> usize {
        candles
            .into_iter()
            .map(|c| self.enqueue(c))
            .filter(|accepted| *accepted)
            .count()
    }

    /// Drain pending candles to the sink in FIFO batches.
    ///
    /// Never returns an error: sink failures requeue the batch and are logged.
    pub async fn flush(&self) -> FlushReport {
        let _cycle = self.inner.flush_lock.lock().await;
        let mut report = FlushReport::default();

        let intervals: Vec<u32> = self.inner.state.lock().pending.keys().copied().collect();

        for interval in intervals {
            loop {
                let batch: Vec<Candle> = {
                    let mut state = self.inner.state.lock();
                    match state.pending.get_mut(&interval) {
                        Some(queue) if !queue.is_empty() => {
                            let n = self.inner.config.batch_size.max(1).min(queue.len());
                            queue.drain(..n).collect()
                        }
                        _ => break,
                    }
                };

                let len = batch.len();
                match self.inner.sink.insert_many(interval, &batch).await {
                    Ok(()) => {
                        let mut state = self.inner.state.lock();
                        state.stats.buffered = state.stats.buffered.saturating_sub(len);
                        state.stats.flushed += len as u64;
                        report.written += len;
                        debug!(interval, count = len, "Flushed candle batch");
                    }
                    Err(e) => {
                        let mut state = self.inner.state.lock();
                        let queue = state.pending.entry(interval).or_default();
                        for candle in batch.into_iter().rev() {
                            queue.push_front(candle);
                        }
                        state.stats.failed_batches += 1;
                        warn!(
                            interval,
                            count = len,
                            buffered = state.stats.buffered,
                            error = %e,
                            "Candle batch insert failed, will retry next flush"
                        );
                        report.failed_intervals.push(interval);
                        break;
                    }
                }
            }
        }

        self.inner.state.lock().stats.flushes += 1;
        report
    }

    /// Start the background flush timer (no-op if already running)
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let buffer = self.clone();
        let period = self.inner.config.flush_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        buffer.flush().await;
                    }
                }
            }
        });

        info!(
            flush_interval_ms = period.as_millis() as u64,
            batch_size = self.inner.config.batch_size,
            max_buffered = self.inner.config.max_buffered,
            "Candle write buffer started"
        );
        *task = Some(FlushTask { cancel, handle });
    }

    /// Stop the timer and make one best-effort final flush
    pub async fn stop(&self) -> FlushReport {
        let task = self.inner.task.lock().take();
        if let Some(FlushTask { cancel, handle }) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Candle flush task ended abnormally");
            }
        }

        let report = self.flush().await;
        let stats = self.stats();
        if stats.buffered > 0 {
            warn!(
                remaining = stats.buffered,
                dropped = stats.dropped,
                "Candle write buffer stopped with unflushed candles"
            );
        } else {
            info!(
                flushed = stats.flushed,
                dropped = stats.dropped,
                "Candle write buffer stopped"
            );
        }
        report
    }

    pub fn is_running(&self) -> bool {
        self.inner.task.lock().is_some()
    }

    /// Candles pending for one interval
    pub fn pending_len(&self, interval: u32) -> usize {
        self.inner
            .state
            .lock()
            .pending
            .get(&interval)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.state.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CandleKey;
    use crate::storage::sink::MemorySink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn candle(interval: u32, start: i64) -> Candle {
        Candle::open_live(&CandleKey::new("NSE:SBIN", interval), start, 600.0, 10.0)
    }

    fn buffer(max: usize, batch: usize, sink: Arc<dyn CandleSink>) -> CandleWriteBuffer {
        CandleWriteBuffer::new(
            WriteBufferConfig {
                flush_interval: Duration::from_millis(100),
                batch_size: batch,
                max_buffered: max,
                drop_log_interval: Duration::from_secs(10),
            },
            sink,
        )
    }

    #[test]
    fn test_enqueue_drops_over_max() {
        let buf = buffer(5, 2, Arc::new(MemorySink::new()));
        let accepted = (0..8).filter(|i| buf.enqueue(candle(1, i * 60_000))).count();

        assert_eq!(accepted, 5);
        let stats = buf.stats();
        assert_eq!(stats.buffered, 5);
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.enqueued, 5);
    }

    #[test]
    fn test_enqueue_all_counts_accepted() {
        let buf = buffer(3, 2, Arc::new(MemorySink::new()));
        let accepted = buf.enqueue_all((0..5).map(|i| candle(1, i * 60_000)));

        assert_eq!(accepted, 3);
        assert_eq!(buf.pending_len(1), 3);
        assert_eq!(buf.stats().dropped, 2);
    }

    #[tokio::test]
    async fn test_flush_writes_fifo_batches() {
        let sink = Arc::new(MemorySink::new());
        let buf = buffer(100, 2, sink.clone());
        for i in 0..5 {
            buf.enqueue(candle(1, i * 60_000));
        }
        buf.enqueue(candle(5, 0));

        let report = buf.flush().await;
        assert!(report.is_clean());
        assert_eq!(report.written, 6);
        // 3 batches for 1m, 1 batch for 5m
        assert_eq!(sink.calls(), 4);

        let starts: Vec<i64> = sink.candles(1).iter().map(|c| c.bucket_start).collect();
        assert_eq!(starts, vec![0, 60_000, 120_000, 180_000, 240_000]);
        assert_eq!(buf.stats().buffered, 0);
    }

    #[tokio::test]
    async fn test_failed_batch_is_requeued_at_front() {
        let sink = Arc::new(MemorySink::new());
        let buf = buffer(100, 2, sink.clone());
        for i in 0..4 {
            buf.enqueue(candle(1, i * 60_000));
        }

        let first = buf.flush().await;
        assert_eq!(first.written, 4);

        for i in 4..8 {
            buf.enqueue(candle(1, i * 60_000));
        }
        sink.fail_next(1);
        let failed = buf.flush().await;
        assert_eq!(failed.written, 0);
        assert_eq!(failed.failed_intervals, vec![1]);
        assert_eq!(buf.pending_len(1), 4);
        assert_eq!(buf.stats().buffered, 4);
        assert_eq!(buf.stats().failed_batches, 1);

        let retried = buf.flush().await;
        assert_eq!(retried.written, 4);
        let starts: Vec<i64> = sink.candles(1).iter().map(|c| c.bucket_start).collect();
        assert_eq!(starts, (0..8).map(|i| i * 60_000).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failure_in_one_interval_does_not_block_others() {
        let sink = Arc::new(MemorySink::new());
        let buf = buffer(100, 10, sink.clone());
        buf.enqueue(candle(1, 0));
        buf.enqueue(candle(5, 0));

        // The 1m interval flushes first (BTreeMap order) and fails
        sink.fail_next(1);
        let report = buf.flush().await;
        assert_eq!(report.failed_intervals, vec![1]);
        assert_eq!(report.written, 1);
        assert_eq!(sink.candles(5).len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_bounded() {
        let sink = Arc::new(MemorySink::new());
        sink.set_failing(true);
        let buf = buffer(10, 4, sink.clone());

        for i in 0..25 {
            buf.enqueue(candle(1, i * 60_000));
            if i % 5 == 0 {
                buf.flush().await;
            }
        }

        let stats = buf.stats();
        assert_eq!(stats.buffered, 10);
        assert_eq!(stats.dropped, 15);
        assert_eq!(sink.total(), 0);
    }

    struct SlowSink {
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl CandleSink for SlowSink {
        async fn insert_many(&self, _interval: u32, _candles: &[Candle]) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_are_serialized() {
        let sink = Arc::new(SlowSink {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        let buf = buffer(100, 1, sink.clone());
        for i in 0..6 {
            buf.enqueue(candle(1, i * 60_000));
        }

        let a = buf.clone();
        let b = buf.clone();
        let (ra, rb) = tokio::join!(a.flush(), b.flush());

        assert_eq!(ra.written + rb.written, 6);
        assert_eq!(sink.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_and_stop_drains() {
        let sink = Arc::new(MemorySink::new());
        let buf = buffer(100, 10, sink.clone());
        buf.start();
        assert!(buf.is_running());

        buf.enqueue(candle(1, 0));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sink.total(), 1);

        buf.enqueue(candle(1, 60_000));
        let report = buf.stop().await;
        assert_eq!(report.written, 1);
        assert!(!buf.is_running());
        assert_eq!(sink.total(), 2);
    }

    #[tokio::test]
    async fn test_stop_swallows_sink_errors() {
        let sink = Arc::new(MemorySink::new());
        sink.set_failing(true);
        let buf = buffer(100, 10, sink);
        buf.start();
        buf.enqueue(candle(1, 0));

        let report = buf.stop().await;
        assert_eq!(report.failed_intervals, vec![1]);
        assert_eq!(buf.stats().buffered, 1);
    }
}

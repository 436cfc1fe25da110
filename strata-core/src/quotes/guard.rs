//! QuoteGuard - admission control in front of the upstream quote API
//!
//! ## Request path
//!
//! ```text
//! get_quote_guarded(keys)
//!   │  breaker open? ──yes──► {} (no I/O)
//!   ▼
//! chunk(keys, chunk_size) ──► FIFO queue ──► drain loop (≤ concurrency in flight)
//!                                               │
//!                                               ▼
//!                           ┌─► breaker.check() ─► admission.acquire()
//!                           │          │
//!                           │          ▼
//!                           │   client.get_quote() under timeout
//!                           │          │
//!                           └─ retryable && retries left: sleep(backoff)
//! ```
//!
//! The queue, in-flight count, admission window and breaker are shared by
//! every caller of one guard. Chunks of one call are independent tasks: a
//! failed chunk is logged and the others still contribute to the result.
//!
//! `get_quote_guarded` never fails. The worst case is an empty map.

use super::admission::{AdmissionConfig, AdmissionControl};
use super::client::{QuoteClient, QuoteMap, QuoteMeta};
use crate::core::QuoteError;
use crate::resilience::{BackoffConfig, CircuitBreaker, CircuitBreakerConfig, ExponentialBackoff};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the quote guard
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteGuardConfig {
    /// When false, calls go straight to the client
    pub enabled: bool,
    /// Max keys per upstream request
    pub chunk_size: usize,
    /// Max tasks in flight at once
    pub concurrency: usize,
    pub admission: AdmissionConfig,
    pub backoff: BackoffConfig,
    pub breaker: CircuitBreakerConfig,
    /// Per-attempt deadline on the upstream call
    pub request_timeout: Duration,
    /// Minimum spacing between "breaker open" rejection warnings
    pub reject_log_interval: Duration,
}

impl Default for QuoteGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: 500,
            concurrency: 2,
            admission: AdmissionConfig::default(),
            backoff: BackoffConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            request_timeout: Duration::from_secs(5),
            reject_log_interval: Duration::from_secs(5),
        }
    }
}

impl QuoteGuardConfig {
    /// Tight budget for a fragile upstream
    pub fn conservative() -> Self {
        Self {
            chunk_size: 200,
            concurrency: 1,
            admission: AdmissionConfig {
                min_spacing: Duration::from_millis(250),
                max_requests: 3,
                window: Duration::from_millis(1_000),
                jitter_pct: 0.3,
            },
            backoff: BackoffConfig::conservative(),
            breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(60),
            },
            ..Default::default()
        }
    }

    /// Loose limits and short delays (tests, replay)
    pub fn aggressive() -> Self {
        Self {
            concurrency: 4,
            admission: AdmissionConfig {
                min_spacing: Duration::ZERO,
                max_requests: 50,
                window: Duration::from_millis(1_000),
                jitter_pct: 0.0,
            },
            backoff: BackoffConfig::aggressive(),
            breaker: CircuitBreakerConfig {
                failure_threshold: 10,
                cooldown: Duration::from_secs(5),
            },
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }
}

/// Snapshot of guard counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardStats {
    /// Chunks put on the queue
    pub enqueued: u64,
    /// Chunks taken off the queue by the drain loop
    pub dequeued: u64,
    /// Network attempts (including retries)
    pub requests: u64,
    pub retries: u64,
    /// Tasks that failed after retries (or fatally)
    pub failures: u64,
    pub breaker_opens: u64,
    /// Calls rejected up front because the breaker was open
    pub breaker_rejections: u64,
    pub in_flight: usize,
    pub queued: usize,
    pub breaker_open: bool,
}

type TaskResult = Result<QuoteMap, QuoteError>;

struct QueuedTask {
    client: Arc<dyn QuoteClient>,
    keys: Vec<String>,
    caller: String,
    reply: oneshot::Sender<TaskResult>,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    requests: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    breaker_rejections: AtomicU64,
}

struct GuardInner {
    config: QuoteGuardConfig,
    admission: AdmissionControl,
    breaker: CircuitBreaker,
    queue: Mutex<VecDeque<QueuedTask>>,
    queued: Notify,
    slots: Arc<Semaphore>,
    in_flight: AtomicUsize,
    counters: Counters,
    cancel: CancellationToken,
    drain: Mutex<Option<JoinHandle<()>>>,
    last_reject_log: Mutex<Option<Instant>>,
}

/// Shared handle to one upstream budget
#[derive(Clone)]
pub struct QuoteGuard {
    inner: Arc<GuardInner>,
}

impl QuoteGuard {
    pub fn new(config: QuoteGuardConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            inner: Arc::new(GuardInner {
                admission: AdmissionControl::new(config.admission.clone()),
                breaker: CircuitBreaker::new(config.breaker.clone()),
                queue: Mutex::new(VecDeque::new()),
                queued: Notify::new(),
                slots: Arc::new(Semaphore::new(concurrency)),
                in_flight: AtomicUsize::new(0),
                counters: Counters::default(),
                cancel: CancellationToken::new(),
                drain: Mutex::new(None),
                last_reject_log: Mutex::new(None),
                config,
            }),
        }
    }

    pub fn config(&self) -> &QuoteGuardConfig {
        &self.inner.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.inner.admission
    }

    /// Fetch quotes for `keys` through the guard.
    ///
    /// Returns whatever the successful chunks produced; failed chunks, an open
    /// breaker or a stopped guard all degrade to missing keys.
    pub async fn get_quote_guarded(
        &self,
        client: Arc<dyn QuoteClient>,
        keys: &[String],
        meta: &QuoteMeta,
    ) -> QuoteMap {
        let inner = &self.inner;

        if !inner.config.enabled {
            if keys.is_empty() {
                return QuoteMap::new();
            }
            return match client.get_quote(keys).await {
                Ok(map) => map,
                Err(e) => {
                    warn!(caller = %meta.caller, keys = keys.len(), error = %e, "Unguarded quote fetch failed");
                    QuoteMap::new()
                }
            };
        }

        if keys.is_empty() || inner.cancel.is_cancelled() {
            return QuoteMap::new();
        }

        if let Some(remaining) = inner.breaker.remaining() {
            inner.counters.breaker_rejections.fetch_add(1, Ordering::Relaxed);
            self.log_rejection(meta, keys.len(), remaining);
            return QuoteMap::new();
        }

        self.ensure_drain();

        let chunk_size = inner.config.chunk_size.max(1);
        let mut pending = Vec::with_capacity(keys.len().div_ceil(chunk_size));
        {
            let mut queue = inner.queue.lock();
            // shutdown cancels before its final settle under this lock, so a
            // push after this check is always drained or settled
            if inner.cancel.is_cancelled() {
                return QuoteMap::new();
            }
            for chunk in keys.chunks(chunk_size) {
                let (tx, rx) = oneshot::channel();
                queue.push_back(QueuedTask {
                    client: Arc::clone(&client),
                    keys: chunk.to_vec(),
                    caller: meta.caller.clone(),
                    reply: tx,
                });
                pending.push((chunk.len(), rx));
            }
        }
        inner
            .counters
            .enqueued
            .fetch_add(pending.len() as u64, Ordering::Relaxed);
        // One wake per chunk; Notify stores a permit if the loop isn't waiting yet
        for _ in 0..pending.len() {
            inner.queued.notify_one();
        }

        let chunks = pending.len();
        let mut result = QuoteMap::with_capacity(keys.len());
        let mut failed = 0usize;
        for (idx, (len, rx)) in pending.into_iter().enumerate() {
            match rx.await.unwrap_or(Err(QuoteError::Stopped)) {
                Ok(map) => result.extend(map),
                Err(e) => {
                    failed += 1;
                    warn!(
                        caller = %meta.caller,
                        chunk = idx,
                        chunks,
                        keys = len,
                        error = %e,
                        "Quote chunk failed"
                    );
                }
            }
        }

        if failed > 0 {
            debug!(
                caller = %meta.caller,
                failed,
                chunks,
                returned = result.len(),
                requested = keys.len(),
                "Returning partial quote map"
            );
        }
        result
    }

    fn log_rejection(&self, meta: &QuoteMeta, keys: usize, remaining: Duration) {
        let mut last = self.inner.last_reject_log.lock();
        let now = Instant::now();
        let due = last
            .map(|t| now.duration_since(t) >= self.inner.config.reject_log_interval)
            .unwrap_or(true);
        if due {
            *last = Some(now);
            warn!(
                caller = %meta.caller,
                keys,
                remaining_ms = remaining.as_millis() as u64,
                rejected_total = self.inner.counters.breaker_rejections.load(Ordering::Relaxed),
                "Quote breaker open, skipping fetch"
            );
        }
    }

    /// Spawn the drain loop on first use
    fn ensure_drain(&self) {
        let mut drain = self.inner.drain.lock();
        if drain.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *drain = Some(tokio::spawn(drain_loop(inner)));
        info!(
            concurrency = self.inner.config.concurrency,
            chunk_size = self.inner.config.chunk_size,
            budget = self.inner.config.admission.max_requests,
            window_ms = self.inner.config.admission.window.as_millis() as u64,
            "Quote guard drain loop started"
        );
    }

    /// Stop the drain loop; queued chunks settle with `QuoteError::Stopped`.
    ///
    /// Chunks already in flight run to completion.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.drain.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Quote drain loop ended abnormally");
            }
        }
        let settled = settle_queue(&self.inner);
        info!(settled, "Quote guard stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn stats(&self) -> GuardStats {
        let inner = &self.inner;
        let c = &inner.counters;
        GuardStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            dequeued: c.dequeued.load(Ordering::Relaxed),
            requests: c.requests.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            breaker_opens: inner.breaker.open_count(),
            breaker_rejections: c.breaker_rejections.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            queued: inner.queue.lock().len(),
            breaker_open: inner.breaker.is_open(),
        }
    }
}

/// Answer every queued task with `Stopped`
fn settle_queue(inner: &GuardInner) -> usize {
    let drained: Vec<QueuedTask> = inner.queue.lock().drain(..).collect();
    let n = drained.len();
    for task in drained {
        let _ = task.reply.send(Err(QuoteError::Stopped));
    }
    n
}

async fn drain_loop(inner: Arc<GuardInner>) {
    loop {
        let permit = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            permit = Arc::clone(&inner.slots).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let task = loop {
            if let Some(task) = inner.queue.lock().pop_front() {
                break Some(task);
            }
            tokio::select! {
                _ = inner.cancel.cancelled() => break None,
                _ = inner.queued.notified() => {}
            }
        };
        let Some(task) = task else { break };

        inner.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        inner.in_flight.fetch_add(1, Ordering::Relaxed);

        let worker = Arc::clone(&inner);
        tokio::spawn(async move {
            let _permit = permit;
            let result = run_task(&worker, &task.client, &task.keys, &task.caller).await;
            worker.in_flight.fetch_sub(1, Ordering::Relaxed);
            // Caller may have gone away; nothing to do then
            let _ = task.reply.send(result);
        });

        tokio::task::yield_now().await;
    }

    settle_queue(&inner);
    debug!("Quote drain loop exited");
}

/// One chunk: breaker gate, admission, request, retry with backoff
async fn run_task(
    inner: &GuardInner,
    client: &Arc<dyn QuoteClient>,
    keys: &[String],
    caller: &str,
) -> TaskResult {
    let mut backoff = ExponentialBackoff::new(inner.config.backoff.clone());

    loop {
        inner.breaker.check()?;
        inner.admission.acquire().await;
        inner.counters.requests.fetch_add(1, Ordering::Relaxed);

        let timeout = inner.config.request_timeout;
        let outcome = match tokio::time::timeout(timeout, client.get_quote(keys)).await {
            Ok(res) => res,
            Err(_) => Err(QuoteError::Timeout(timeout)),
        };

        match outcome {
            Ok(map) => {
                inner.breaker.record_success();
                return Ok(map);
            }
            Err(e) if e.is_retryable() => match backoff.next_delay() {
                Some(delay) => {
                    inner.counters.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        caller,
                        keys = keys.len(),
                        attempt = backoff.attempt_number(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying quote request"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(fail(inner, e)),
            },
            Err(e) => return Err(fail(inner, e)),
        }
    }
}

fn fail(inner: &GuardInner, err: QuoteError) -> QuoteError {
    inner.counters.failures.fetch_add(1, Ordering::Relaxed);
    inner.breaker.record_failure();
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quotes::client::QuoteRecord;
    use async_trait::async_trait;

    /// Returns a quote per key, failing the first `fail_first` calls with `error`
    struct ScriptedClient {
        calls: AtomicUsize,
        fail_first: usize,
        error: QuoteError,
    }

    impl ScriptedClient {
        fn ok() -> Arc<Self> {
            Self::failing(0, QuoteError::Upstream(String::new()))
        }

        fn failing(fail_first: usize, error: QuoteError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_first,
                error,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QuoteClient for ScriptedClient {
        async fn get_quote(&self, keys: &[String]) -> Result<QuoteMap, QuoteError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(self.error.clone());
            }
            Ok(keys
                .iter()
                .map(|k| (k.clone(), QuoteRecord::new(k.clone(), 100.0)))
                .collect())
        }
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("NSE:K{}", i)).collect()
    }

    fn fast_config() -> QuoteGuardConfig {
        QuoteGuardConfig {
            admission: AdmissionConfig {
                min_spacing: Duration::ZERO,
                max_requests: 100,
                window: Duration::from_millis(1_000),
                jitter_pct: 0.0,
            },
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                max_retries: 2,
                jitter_pct: 0.0,
            },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_and_merges() {
        let guard = QuoteGuard::new(QuoteGuardConfig {
            chunk_size: 3,
            ..fast_config()
        });
        let client = ScriptedClient::ok();

        let map = guard
            .get_quote_guarded(client.clone(), &keys(7), &QuoteMeta::new("test"))
            .await;

        assert_eq!(map.len(), 7);
        assert_eq!(client.calls(), 3);
        let stats = guard.stats();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.dequeued, 3);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_keys_short_circuit() {
        let guard = QuoteGuard::new(fast_config());
        let client = ScriptedClient::ok();
        let map = guard
            .get_quote_guarded(client.clone(), &[], &QuoteMeta::default())
            .await;
        assert!(map.is_empty());
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_is_retried() {
        let guard = QuoteGuard::new(fast_config());
        let client = ScriptedClient::failing(
            2,
            QuoteError::Http {
                status: 503,
                message: "unavailable".into(),
            },
        );

        let map = guard
            .get_quote_guarded(client.clone(), &keys(2), &QuoteMeta::default())
            .await;

        assert_eq!(map.len(), 2);
        assert_eq!(client.calls(), 3);
        assert_eq!(guard.stats().retries, 2);
        assert_eq!(guard.breaker().consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_not_retried() {
        let guard = QuoteGuard::new(fast_config());
        let client = ScriptedClient::failing(
            1,
            QuoteError::Http {
                status: 400,
                message: "bad request".into(),
            },
        );

        let map = guard
            .get_quote_guarded(client.clone(), &keys(2), &QuoteMeta::default())
            .await;

        assert!(map.is_empty());
        assert_eq!(client.calls(), 1);
        assert_eq!(guard.stats().failures, 1);
        assert_eq!(guard.breaker().consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_counts_one_failure() {
        let guard = QuoteGuard::new(fast_config());
        let client = ScriptedClient::failing(usize::MAX, QuoteError::Connection("reset".into()));

        let map = guard
            .get_quote_guarded(client.clone(), &keys(1), &QuoteMeta::default())
            .await;

        assert!(map.is_empty());
        // First attempt plus two retries
        assert_eq!(client.calls(), 3);
        assert_eq!(guard.stats().failures, 1);
        assert_eq!(guard.breaker().consecutive_failures(), 1);
    }

    struct HangingClient;

    #[async_trait]
    impl QuoteClient for HangingClient {
        async fn get_quote(&self, _keys: &[String]) -> Result<QuoteMap, QuoteError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_is_retryable() {
        let guard = QuoteGuard::new(QuoteGuardConfig {
            request_timeout: Duration::from_millis(200),
            ..fast_config()
        });
        let start = Instant::now();

        let map = guard
            .get_quote_guarded(Arc::new(HangingClient), &keys(1), &QuoteMeta::default())
            .await;

        assert!(map.is_empty());
        let stats = guard.stats();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.retries, 2);
        // 3 timeouts plus 10ms and 20ms backoff
        assert!(start.elapsed() >= Duration::from_millis(630));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_guard_calls_client_directly() {
        let guard = QuoteGuard::new(QuoteGuardConfig {
            enabled: false,
            chunk_size: 1,
            ..fast_config()
        });
        let client = ScriptedClient::ok();
        let map = guard
            .get_quote_guarded(client.clone(), &keys(4), &QuoteMeta::default())
            .await;
        assert_eq!(map.len(), 4);
        assert_eq!(client.calls(), 1);
        assert_eq!(guard.stats().enqueued, 0);

        let failing = ScriptedClient::failing(1, QuoteError::Upstream("down".into()));
        let map = guard
            .get_quote_guarded(failing, &keys(4), &QuoteMeta::default())
            .await;
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap() {
        struct Slow {
            active: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl QuoteClient for Slow {
            async fn get_quote(&self, keys: &[String]) -> Result<QuoteMap, QuoteError> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(keys
                    .iter()
                    .map(|k| (k.clone(), QuoteRecord::new(k.clone(), 1.0)))
                    .collect())
            }
        }

        let guard = QuoteGuard::new(QuoteGuardConfig {
            chunk_size: 1,
            concurrency: 2,
            ..fast_config()
        });
        let client = Arc::new(Slow {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let map = guard
            .get_quote_guarded(client.clone(), &keys(6), &QuoteMeta::default())
            .await;
        assert_eq!(map.len(), 6);
        assert_eq!(client.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_returns_empty() {
        let guard = QuoteGuard::new(fast_config());
        let client = ScriptedClient::ok();
        assert_eq!(
            guard
                .get_quote_guarded(client.clone(), &keys(1), &QuoteMeta::default())
                .await
                .len(),
            1
        );

        guard.shutdown().await;
        assert!(guard.is_stopped());
        let map = guard
            .get_quote_guarded(client.clone(), &keys(1), &QuoteMeta::default())
            .await;
        assert!(map.is_empty());
        assert_eq!(client.calls(), 1);
    }
}

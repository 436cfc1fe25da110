//! Market hours gate
//!
//! `MarketHours` answers "is the market open at this instant"; `MarketGate`
//! polls one on a timer and publishes open/close edges on a channel so the
//! composing application can start and stop its feeds.

use crate::core::ConfigError;
use crate::data::parse_utc_offset;
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Offset, Utc, Weekday};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Market-open predicate
pub trait MarketHours: Send + Sync {
    fn is_open(&self, now: DateTime<Utc>) -> bool;
}

/// Fixed daily session in a local UTC offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHours {
    pub open: NaiveTime,
    /// Exclusive
    pub close: NaiveTime,
    pub weekdays: Vec<Weekday>,
    pub offset: FixedOffset,
}

impl SessionHours {
    pub fn new(open: NaiveTime, close: NaiveTime, weekdays: Vec<Weekday>, offset: FixedOffset) -> Self {
        Self {
            open,
            close,
            weekdays,
            offset,
        }
    }

    /// Parse "HH:MM" open/close times and a "+HH:MM" offset, Monday to Friday
    pub fn parse(open: &str, close: &str, offset: &str) -> Result<Self, ConfigError> {
        let open_t = NaiveTime::parse_from_str(open, "%H:%M")
            .map_err(|e| ConfigError::invalid("market.open", format!("'{}': {}", open, e)))?;
        let close_t = NaiveTime::parse_from_str(close, "%H:%M")
            .map_err(|e| ConfigError::invalid("market.close", format!("'{}': {}", close, e)))?;
        if close_t <= open_t {
            return Err(ConfigError::invalid(
                "market.close",
                format!("close {} must be after open {}", close, open),
            ));
        }
        Ok(Self::new(open_t, close_t, weekdays_mon_fri(), parse_utc_offset(offset)?))
    }

    /// NSE cash session: 09:15 to 15:30 IST, Monday to Friday
    pub fn nse() -> Self {
        Self::new(
            NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
            weekdays_mon_fri(),
            FixedOffset::east_opt(19_800).unwrap_or_else(|| Utc.fix()),
        )
    }
}

fn weekdays_mon_fri() -> Vec<Weekday> {
    vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
}

impl MarketHours for SessionHours {
    fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.offset);
        if !self.weekdays.contains(&local.weekday()) {
            return false;
        }
        let t = local.time();
        t >= self.open && t < self.close
    }
}

/// Open/close edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketEvent {
    Opened { at: DateTime<Utc> },
    Closed { at: DateTime<Utc> },
}

/// Background poller publishing market open/close edges
pub struct MarketGate {
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl MarketGate {
    /// Start polling `hours` every `poll`.
    ///
    /// The gate starts closed, so a market that is already open produces an
    /// `Opened` event on the first poll.
    pub fn spawn(hours: Arc<dyn MarketHours>, poll: Duration) -> (Self, mpsc::Receiver<MarketEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let open = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let state = Arc::clone(&open);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let now = Utc::now();
                let is_open = hours.is_open(now);
                let was_open = state.swap(is_open, Ordering::SeqCst);
                if is_open == was_open {
                    continue;
                }

                let event = if is_open {
                    info!(at = %now, "Market opened");
                    MarketEvent::Opened { at: now }
                } else {
                    info!(at = %now, "Market closed");
                    MarketEvent::Closed { at: now }
                };
                if tx.send(event).await.is_err() {
                    debug!("Market event receiver dropped, stopping gate");
                    break;
                }
            }
        });

        (
            Self {
                open,
                cancel,
                handle: Some(handle),
            },
            rx,
        )
    }

    /// State as of the last poll
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Market gate task ended abnormally");
            }
        }
    }
}

impl Drop for MarketGate {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

//! Upstream quote client seam
//!
//! The guard never talks HTTP itself. A broker adapter implements
//! [`QuoteClient`] and maps its transport failures onto [`QuoteError`] so the
//! retry policy can tell transient failures from fatal ones.

use crate::core::{Depth, QuoteError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Snapshot quote for one instrument key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub instrument: String,
    pub last_price: f64,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub depth: Option<Depth>,
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

impl QuoteRecord {
    pub fn new(instrument: impl Into<String>, last_price: f64) -> Self {
        Self {
            instrument: instrument.into(),
            last_price,
            volume: None,
            depth: None,
            timestamp_ms: None,
        }
    }
}

/// Quotes keyed by the instrument key the caller asked for
pub type QuoteMap = HashMap<String, QuoteRecord>;

/// Caller context carried into logs
#[derive(Debug, Clone, Default)]
pub struct QuoteMeta {
    /// Short label for the calling component (e.g. "option-chain", "exit-monitor")
    pub caller: String,
}

impl QuoteMeta {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
        }
    }
}

/// "Fetch quotes for N instrument keys"
#[async_trait]
pub trait QuoteClient: Send + Sync {
    /// One network request for `keys`; missing keys are simply absent from the map
    async fn get_quote(&self, keys: &[String]) -> Result<QuoteMap, QuoteError>;
}

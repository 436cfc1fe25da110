//! Monitoring: Prometheus mirrors of component stats

pub mod metrics;

pub use metrics::{BufferMetrics, CandleMetrics, GuardMetrics, MetricsRegistry};

use hdrhistogram::Histogram;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Latency percentiles in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: u64,
}

/// Metrics collector for the storage engine.
///
/// Latencies are kept per operation name (`set`, `get`, ...) in HDR
/// histograms with microsecond resolution.
pub struct Metrics {
    operation_latencies: Mutex<BTreeMap<&'static str, Histogram<u64>>>,
    operations: AtomicU64,
    fsync_count: AtomicU64,
    flush_count: AtomicU64,
    compaction_count: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            operation_latencies: Mutex::new(BTreeMap::new()),
            operations: AtomicU64::new(0),
            fsync_count: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            compaction_count: AtomicU64::new(0),
        }
    }

    /// Record one completed operation and its latency.
    pub fn record_latency(&self, operation: &'static str, duration: Duration) {
        self.operations.fetch_add(1, Ordering::Relaxed);

        let mut latencies = self
            .operation_latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !latencies.contains_key(operation) {
            match Histogram::<u64>::new(3) {
                Ok(histogram) => {
                    latencies.insert(operation, histogram);
                }
                Err(e) => {
                    tracing::warn!("Cannot create latency histogram for {}: {}", operation, e);
                    return;
                }
            }
        }
        if let Some(histogram) = latencies.get_mut(operation) {
            histogram.saturating_record(duration.as_micros() as u64);
        }
    }

    pub fn increment_fsync(&self) {
        self.fsync_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_flush(&self) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_compaction(&self) {
        self.compaction_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Percentiles for one operation; zeros if it was never recorded.
    pub fn get_percentiles(&self, operation: &str) -> Percentiles {
        let latencies = self
            .operation_latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        latencies.get(operation).map(percentiles).unwrap_or_default()
    }

    pub fn report(&self) -> MetricsReport {
        let latencies = self
            .operation_latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        MetricsReport {
            operations: self.operations.load(Ordering::Relaxed),
            fsync_count: self.fsync_count.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            compaction_count: self.compaction_count.load(Ordering::Relaxed),
            operation_latencies: latencies
                .iter()
                .map(|(op, histogram)| (op.to_string(), percentiles(histogram)))
                .collect(),
        }
    }
}

fn percentiles(histogram: &Histogram<u64>) -> Percentiles {
    Percentiles {
        p50: histogram.value_at_quantile(0.50) as f64,
        p95: histogram.value_at_quantile(0.95) as f64,
        p99: histogram.value_at_quantile(0.99) as f64,
        count: histogram.len(),
    }
}

#[derive(Debug, Clone)]
pub struct MetricsReport {
    pub operations: u64,
    pub fsync_count: u64,
    pub flush_count: u64,
    pub compaction_count: u64,
    pub operation_latencies: BTreeMap<String, Percentiles>,
}

//! # Server Metrics
//!
//! Lightweight counters and a latency histogram shared by every command
//! worker, reported through `INFO`.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events cheaply.
//! 2. **Fixed Buckets**: Histogram buckets live in a contiguous array.
//! 3. **Snapshot Reads**: Readers get plain structs; writers never block.
//!
//! `Ordering::Relaxed` is used throughout: fields are independent and only
//! need eventual consistency.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Latency bucket boundaries in microseconds.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 12] =
    [10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 100_000];

/// Snapshot of all server metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub commands_total: u64,
    pub errors_total: u64,
    pub inflight: u64,
    pub connections_total: u64,
    pub connections_active: u64,
    pub latency: LatencySnapshot,
}

impl MetricsSnapshot {
    /// Renders the `INFO`-style `key:value` section.
    pub fn render(&self, out: &mut String) {
        let _ = write!(
            out,
            "total_connections_received:{}\r\n\
             connected_clients:{}\r\n\
             total_commands_processed:{}\r\n\
             total_error_replies:{}\r\n\
             commands_inflight:{}\r\n\
             latency_p50_us:{}\r\n\
             latency_p99_us:{}\r\n",
            self.connections_total,
            self.connections_active,
            self.commands_total,
            self.errors_total,
            self.inflight,
            self.latency.percentile_us(0.50),
            self.latency.percentile_us(0.99),
        );
    }
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    pub samples: u64,
    pub sum_us: u64,
}

impl LatencySnapshot {
    /// Upper bound of the bucket holding quantile `q` (0.0..=1.0).
    ///
    /// Returns 0 with no samples; the overflow bucket reports the last bound.
    pub fn percentile_us(&self, q: f64) -> u64 {
        if self.samples == 0 {
            return 0;
        }
        let target = ((self.samples as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for (idx, count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= target {
                return self
                    .bounds_us
                    .get(idx)
                    .or(self.bounds_us.last())
                    .copied()
                    .unwrap_or(0);
            }
        }
        self.bounds_us.last().copied().unwrap_or(0)
    }
}

/// Thread-safe metrics aggregator for the server.
pub struct Metrics {
    commands_total: AtomicU64,
    errors_total: AtomicU64,
    inflight: AtomicU64,
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    latency: LatencyHistogram,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            commands_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            inflight: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            latency: LatencyHistogram::new(DEFAULT_LATENCY_BUCKETS_US.to_vec()),
        }
    }

    /// Records the start of a command.
    pub fn record_command_start(&self) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the end of a command and its latency.
    pub fn record_command_end(&self, latency: Duration, is_error: bool) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        if is_error {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.record(latency);
    }

    pub fn record_connection_open(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_close(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_total: self.commands_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket latency histogram.
///
/// Bucket selection is a binary search over the sorted bounds.
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with ascending bucket boundaries (microseconds).
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);
        let idx = self.bounds_us.partition_point(|&bound| bound < micros);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}

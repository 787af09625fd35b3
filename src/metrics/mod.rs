//! Shared instrumentation: detection latency histogram, health gauges, and
//! per-market noise counters.
//!
//! Scanner tasks write, the HTTP surface reads. Everything here is cheap
//! enough for the hot path: atomics, per-entry map locks, and one mutex
//! around the histogram.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;

/// Detection latency percentiles, recorded by the detector on every tick.
/// Values are microseconds; the histogram tracks 1us..100s at 3 significant
/// figures.
pub struct LatencyStats {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

impl LatencyStats {
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 100_000_000, 3)
            .expect("valid histogram bounds");
        Self {
            inner: Mutex::new(histogram),
        }
    }

    pub fn record_us(&self, us: u64) {
        if let Ok(mut h) = self.inner.lock() {
            let _ = h.record(us);
        }
    }

    /// Clamped to zero on clock anomalies by `Duration`'s saturating math.
    pub fn record(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        self.record_us(us);
    }

    /// `(p50, p95, p99)` in microseconds; None until the first sample.
    pub fn percentiles(&self) -> Option<(u64, u64, u64)> {
        let h = self.inner.lock().ok()?;
        if h.len() == 0 {
            return None;
        }
        Some((
            h.value_at_quantile(0.50),
            h.value_at_quantile(0.95),
            h.value_at_quantile(0.99),
        ))
    }

    pub fn sample_count(&self) -> u64 {
        self.inner.lock().map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Health gauges surfaced by `GET /health`.
#[derive(Default)]
pub struct HealthState {
    feed_connected: AtomicBool,
    last_window_at_ns: AtomicU64,
    /// Window events accepted into the writer queue (monotonic).
    writes_enqueued: AtomicU64,
    /// Rows the writer has finished persisting (monotonic).
    writes_completed: AtomicU64,
    /// Open events dropped because the writer queue was full.
    opens_dropped: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_feed_connected(&self, connected: bool) {
        self.feed_connected.store(connected, Ordering::Relaxed);
    }

    pub fn feed_connected(&self) -> bool {
        self.feed_connected.load(Ordering::Relaxed)
    }

    pub fn set_last_window_at_ns(&self, ns: u64) {
        self.last_window_at_ns.store(ns, Ordering::Relaxed);
    }

    pub fn last_window_at_ns(&self) -> u64 {
        self.last_window_at_ns.load(Ordering::Relaxed)
    }

    pub fn inc_writes_enqueued(&self) {
        self.writes_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_writes_completed(&self) {
        self.writes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_opens_dropped(&self) {
        self.opens_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn opens_dropped(&self) -> u64 {
        self.opens_dropped.load(Ordering::Relaxed)
    }

    /// Writer backlog: enqueued minus completed.
    pub fn pending_writes(&self) -> u64 {
        let enqueued = self.writes_enqueued.load(Ordering::Relaxed);
        let completed = self.writes_completed.load(Ordering::Relaxed);
        enqueued.saturating_sub(completed)
    }
}

/// Per-market counters of pending windows discarded before confirmation.
/// Discards never reach the database, so the scorer reads its noise ratio
/// from here.
#[derive(Default)]
pub struct NoiseStats {
    discards: DashMap<String, u64>,
}

impl NoiseStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_discard(&self, market_id: &str) {
        *self.discards.entry(market_id.to_string()).or_insert(0) += 1;
    }

    pub fn discards(&self, market_id: &str) -> u64 {
        self.discards.get(market_id).map(|c| *c).unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.discards.iter().map(|e| *e.value()).sum()
    }
}

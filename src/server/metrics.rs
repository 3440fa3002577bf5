//! Request counters and latency percentiles for the control surface.

use itertools::Itertools as _;
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Thread-safe request metrics. Connection threads record into it, the
/// control surface snapshots it.
pub struct Metrics {
    inner: Mutex<Inner>,
}

struct Inner {
    total_requests: u64,
    success_count: u64,
    fail_count: u64,
    latencies: Vec<Duration>,
    start: Instant,
}

/// A metrics snapshot, as served by `/metrics`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub success_count: u64,
    pub fail_count: u64,
    /// Successful requests per second since the last reset.
    pub throughput: f64,
    pub latency_avg_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub uptime_seconds: f64,
}

impl Metrics {
    /// Creates empty metrics; uptime counts from here.
    pub fn new() -> Metrics {
        Metrics {
            inner: Mutex::new(Inner {
                total_requests: 0,
                success_count: 0,
                fail_count: 0,
                latencies: Vec::with_capacity(10_000),
                start: Instant::now(),
            }),
        }
    }

    /// Records a successful operation and its latency.
    pub fn record_success(&self, latency: Duration) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.total_requests += 1;
        inner.success_count += 1;
        inner.latencies.push(latency);
    }

    /// Records a failed operation.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.total_requests += 1;
        inner.fail_count += 1;
    }

    /// Clears all counters and restarts the uptime clock.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.total_requests = 0;
        inner.success_count = 0;
        inner.fail_count = 0;
        inner.latencies = Vec::with_capacity(10_000);
        inner.start = Instant::now();
    }

    /// Computes a snapshot with throughput and latency percentiles.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        let uptime = inner.start.elapsed().as_secs_f64();
        let (latency_avg_ms, latency_p50_ms, latency_p95_ms, latency_p99_ms) =
            latency_stats(&inner.latencies);
        MetricsSnapshot {
            total_requests: inner.total_requests,
            success_count: inner.success_count,
            fail_count: inner.fail_count,
            throughput: if uptime > 0.0 { inner.success_count as f64 / uptime } else { 0.0 },
            latency_avg_ms,
            latency_p50_ms,
            latency_p95_ms,
            latency_p99_ms,
            uptime_seconds: uptime,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes (avg, p50, p95, p99) latencies in milliseconds. All zero when
/// there are no samples.
pub(crate) fn latency_stats(latencies: &[Duration]) -> (f64, f64, f64, f64) {
    if latencies.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let sorted: Vec<Duration> = latencies.iter().copied().sorted_unstable().collect();
    let ms = |d: Duration| d.as_micros() as f64 / 1000.0;
    let avg = ms(sorted.iter().sum::<Duration>()) / sorted.len() as f64;
    let percentile = |p: usize| ms(sorted[(sorted.len() * p / 100).min(sorted.len() - 1)]);
    (avg, percentile(50), percentile(95), percentile(99))
}

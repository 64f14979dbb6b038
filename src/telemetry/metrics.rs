// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process metrics for the coordinator.
//!
//! Operation latencies are kept per name with a coarse histogram, and merge
//! results are counted by outcome. Nothing is exported; the daemon logs a
//! report on shutdown and `status` can print one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    operations: RwLock<HashMap<String, OperationMetrics>>,
    merges: MergeCounters,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            merges: MergeCounters::default(),
            start_time: Instant::now(),
        }
    }

    /// Record one timed operation.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        if let Ok(mut ops) = self.operations.write() {
            ops.entry(name.to_string())
                .or_insert_with(OperationMetrics::new)
                .record(duration);
        }
    }

    /// Count a merge result by its outcome label.
    pub fn record_merge_outcome(&self, label: &str) {
        let counter = match label {
            "merged" => &self.merges.merged,
            "conflict" => &self.merges.conflict,
            _ => &self.merges.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_metrics(&self, name: &str) -> Option<OperationMetrics> {
        self.operations.read().ok()?.get(name).cloned()
    }

    /// `(merged, conflict, failed)` totals.
    pub fn merge_counts(&self) -> (u64, u64, u64) {
        (
            self.merges.merged.load(Ordering::Relaxed),
            self.merges.conflict.load(Ordering::Relaxed),
            self.merges.failed.load(Ordering::Relaxed),
        )
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let operations = self
            .operations
            .read()
            .map(|ops| ops.clone())
            .unwrap_or_default();
        let (merged, conflict, failed) = self.merge_counts();
        MetricsSnapshot {
            operations,
            merged,
            conflict,
            failed,
            uptime: self.uptime(),
        }
    }

    pub fn reset(&self) {
        if let Ok(mut ops) = self.operations.write() {
            ops.clear();
        }
        self.merges.merged.store(0, Ordering::Relaxed);
        self.merges.conflict.store(0, Ordering::Relaxed);
        self.merges.failed.store(0, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct MergeCounters {
    merged: AtomicU64,
    conflict: AtomicU64,
    failed: AtomicU64,
}

/// Latency statistics for one operation name.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    pub count: u64,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub histogram: Histogram,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self {
            count: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
            histogram: Histogram::default(),
        }
    }

    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
        self.histogram.record(duration);
    }

    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket latency histogram.
#[derive(Debug, Clone)]
pub struct Histogram {
    /// Upper bucket bounds in milliseconds; one overflow bucket follows.
    bounds_ms: Vec<u64>,
    counts: Vec<u64>,
}

impl Histogram {
    pub fn with_bounds(bounds_ms: Vec<u64>) -> Self {
        let counts = vec![0; bounds_ms.len() + 1];
        Self { bounds_ms, counts }
    }

    pub fn record(&mut self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        let idx = self
            .bounds_ms
            .iter()
            .position(|&b| ms <= b)
            .unwrap_or(self.bounds_ms.len());
        self.counts[idx] += 1;
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Upper bound of the bucket holding the `p`th percentile.
    pub fn percentile(&self, p: f64) -> Duration {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }
        let wanted = (total as f64 * p / 100.0).ceil() as u64;
        let mut seen = 0;
        for (i, &count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= wanted {
                let ms = self
                    .bounds_ms
                    .get(i)
                    .copied()
                    .unwrap_or_else(|| self.bounds_ms.last().copied().unwrap_or(0) * 10);
                return Duration::from_millis(ms);
            }
        }
        Duration::ZERO
    }

    pub fn p50(&self) -> Duration {
        self.percentile(50.0)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // Git subprocesses dominate: 10ms up to a minute.
        Self::with_bounds(vec![10, 100, 1_000, 10_000, 60_000])
    }
}

/// Point-in-time copy of all metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub operations: HashMap<String, OperationMetrics>,
    pub merged: u64,
    pub conflict: u64,
    pub failed: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Human-readable report, operations sorted by name.
    pub fn format_report(&self) -> String {
        let mut report = format!(
            "Uptime {:.1?}; merges: {} merged, {} conflicted, {} failed\n",
            self.uptime, self.merged, self.conflict, self.failed
        );
        let mut names: Vec<_> = self.operations.keys().collect();
        names.sort();
        for name in names {
            let m = &self.operations[name];
            report.push_str(&format!(
                "  {}: {} ops, avg {:.2?}, p99 <= {:.0?}\n",
                name,
                m.count,
                m.avg_duration(),
                m.histogram.p99()
            ));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_metrics() {
        let mut metrics = OperationMetrics::new();
        metrics.record(Duration::from_millis(10));
        metrics.record(Duration::from_millis(30));
        assert_eq!(metrics.count, 2);
        assert_eq!(metrics.avg_duration(), Duration::from_millis(20));
        assert_eq!(metrics.min_duration, Duration::from_millis(10));
    }

    #[test]
    fn test_histogram_buckets() {
        let mut hist = Histogram::default();
        hist.record(Duration::from_millis(5));
        hist.record(Duration::from_millis(500));
        hist.record(Duration::from_secs(120));
        assert_eq!(hist.counts(), &[1, 0, 1, 0, 0, 1]);
        assert_eq!(hist.p50(), Duration::from_millis(1_000));
        assert_eq!(hist.p99(), Duration::from_millis(600_000));
    }

    #[test]
    fn test_merge_outcome_counters() {
        let metrics = Metrics::new();
        metrics.record_merge_outcome("merged");
        metrics.record_merge_outcome("merged");
        metrics.record_merge_outcome("conflict");
        metrics.record_merge_outcome("failed");
        assert_eq!(metrics.merge_counts(), (2, 1, 1));

        metrics.record_operation("queue.merge", Duration::from_millis(40));
        let report = metrics.snapshot().format_report();
        assert!(report.contains("2 merged, 1 conflicted, 1 failed"));
        assert!(report.contains("queue.merge: 1 ops"));

        metrics.reset();
        assert_eq!(metrics.merge_counts(), (0, 0, 0));
        assert!(metrics.operation_metrics("queue.merge").is_none());
    }
}

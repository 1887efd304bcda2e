//! Read-path performance counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Point-in-time view of the store's read counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Completed read operations since open or the last reset.
    pub total_reads: u64,
    /// Reads served from an in-memory cache.
    pub cache_hits: u64,
    /// Reads that had to consult the filesystem.
    pub cache_misses: u64,
    /// Reads that attached to an identical operation already in flight
    /// instead of issuing their own filesystem traversal.
    pub coalesced_reads: u64,
    /// Mean wall-clock latency of completed reads, in milliseconds.
    pub avg_read_latency_ms: f64,
    /// Reads currently in flight.
    pub concurrent_reads: u64,
    /// High-water mark of concurrent reads.
    pub max_concurrent_reads: u64,
}

/// Shared atomic counters behind [`MetricsSnapshot`]. All ordering is
/// relaxed; the counters are advisory.
#[derive(Debug, Default)]
pub(crate) struct ReadMetrics {
    total_reads: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    coalesced_reads: AtomicU64,
    read_latency_ns: AtomicU64,
    concurrent_reads: AtomicU64,
    max_concurrent_reads: AtomicU64,
}

impl ReadMetrics {
    /// Marks a read as started; the guard completes it on drop.
    pub(crate) fn begin(&self) -> ReadGuard<'_> {
        let now = self.concurrent_reads.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_concurrent_reads.fetch_max(now, Ordering::Relaxed);
        ReadGuard {
            metrics: self,
            started: Instant::now(),
        }
    }

    pub(crate) fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_reads.load(Ordering::Relaxed);
        let latency_ns = self.read_latency_ns.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_reads: total,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            coalesced_reads: self.coalesced_reads.load(Ordering::Relaxed),
            avg_read_latency_ms: if total == 0 {
                0.0
            } else {
                latency_ns as f64 / total as f64 / 1_000_000.0
            },
            concurrent_reads: self.concurrent_reads.load(Ordering::Relaxed),
            max_concurrent_reads: self.max_concurrent_reads.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter, including the concurrency high-water mark.
    pub(crate) fn reset(&self) {
        self.total_reads.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.coalesced_reads.store(0, Ordering::Relaxed);
        self.read_latency_ns.store(0, Ordering::Relaxed);
        self.max_concurrent_reads
            .store(self.concurrent_reads.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

/// Completes one read on drop: decrements the concurrency gauge and folds
/// the elapsed time into the latency accumulator.
pub(crate) struct ReadGuard<'a> {
    metrics: &'a ReadMetrics,
    started: Instant,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.metrics.concurrent_reads.fetch_sub(1, Ordering::Relaxed);
        self.metrics.total_reads.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .read_latency_ns
            .fetch_add(self.started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}

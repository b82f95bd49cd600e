//! Monotonic counters for cache activity (spec §4.5).
//!
//! The actual metrics *sink* (where a snapshot ends up — logs, a /metrics
//! endpoint, a StatsD client) is an external collaborator; this module only
//! owns the counters and produces a consistent snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A single consistent capture of all counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub reads_bytes: u64,
    pub writes_bytes: u64,
    pub trims_count: u64,
    pub trims_bytes: u64,
    pub get_calls: u64,
    pub get_latency_total_nanos: u64,
    pub set_calls: u64,
    pub set_latency_total_nanos: u64,
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    disk_hits: AtomicU64,
    disk_misses: AtomicU64,
    reads_bytes: AtomicU64,
    writes_bytes: AtomicU64,
    trims_count: AtomicU64,
    trims_bytes: AtomicU64,
    get_calls: AtomicU64,
    get_latency_total_nanos: AtomicU64,
    set_calls: AtomicU64,
    set_latency_total_nanos: AtomicU64,
}

/// Commutative-add counter set, snapshotable from any thread.
///
/// The `Mutex` is held only while copying all fields for [`Metrics::snapshot`];
/// individual recorders never take it, so recording never blocks on a
/// concurrent snapshot (or vice versa) for more than that copy.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Counters,
    snapshot_guard: Mutex<()>,
}

impl Metrics {
    /// A fresh, all-zero counter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_miss(&self) {
        self.counters.memory_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self, bytes: u64) {
        self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
        self.counters.reads_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_disk_miss(&self) {
        self.counters.disk_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_bytes(&self, bytes: u64) {
        self.counters.writes_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_trim(&self, count: u64, bytes: u64) {
        self.counters.trims_count.fetch_add(count, Ordering::Relaxed);
        self.counters.trims_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_get(&self, latency: std::time::Duration) {
        self.counters.get_calls.fetch_add(1, Ordering::Relaxed);
        self.counters
            .get_latency_total_nanos
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_set(&self, latency: std::time::Duration) {
        self.counters.set_calls.fetch_add(1, Ordering::Relaxed);
        self.counters
            .set_latency_total_nanos
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Take a consistent, immutable capture of all counters at one instant.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let _guard = self.snapshot_guard.lock();
        MetricsSnapshot {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            memory_misses: self.counters.memory_misses.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            disk_misses: self.counters.disk_misses.load(Ordering::Relaxed),
            reads_bytes: self.counters.reads_bytes.load(Ordering::Relaxed),
            writes_bytes: self.counters.writes_bytes.load(Ordering::Relaxed),
            trims_count: self.counters.trims_count.load(Ordering::Relaxed),
            trims_bytes: self.counters.trims_bytes.load(Ordering::Relaxed),
            get_calls: self.counters.get_calls.load(Ordering::Relaxed),
            get_latency_total_nanos: self
                .counters
                .get_latency_total_nanos
                .load(Ordering::Relaxed),
            set_calls: self.counters.set_calls.load(Ordering::Relaxed),
            set_latency_total_nanos: self
                .counters
                .set_latency_total_nanos
                .load(Ordering::Relaxed),
        }
    }
}

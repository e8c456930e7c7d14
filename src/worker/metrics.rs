//! Point-in-time views of worker health and throughput.
//!
//! The hot counters live in [`MetricCounters`] as atomics so the build path
//! never takes the state lock just to bump a number. [`WorkerMetrics`] and
//! [`WorkerHealth`] are plain values copied out on request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use jiff::Timestamp;

/// An `Option<Instant>` that fits in an atomic: nanoseconds since a fixed
/// epoch, with 0 reserved for "never".
#[derive(Debug)]
pub(crate) struct AtomicInstant {
    epoch: Instant,
    nanos: AtomicU64,
}

impl AtomicInstant {
    pub(crate) fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            nanos: AtomicU64::new(0),
        }
    }

    pub(crate) fn store(&self, at: Instant) {
        let nanos = at.saturating_duration_since(self.epoch).as_nanos() as u64;
        self.nanos.store(nanos.max(1), Ordering::Release);
    }

    pub(crate) fn load(&self) -> Option<Instant> {
        match self.nanos.load(Ordering::Acquire) {
            0 => None,
            n => Some(self.epoch + Duration::from_nanos(n)),
        }
    }
}

pub(crate) fn store_duration(cell: &AtomicU64, d: Duration) {
    cell.store(d.as_nanos() as u64, Ordering::Relaxed);
}

pub(crate) fn load_duration(cell: &AtomicU64) -> Duration {
    Duration::from_nanos(cell.load(Ordering::Relaxed))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerMetrics {
    pub processing_count: u64,
    /// Duration of the most recent build cycle.
    pub processing_duration: Duration,
    pub phase1_duration: Duration,
    pub phase2_duration: Duration,
    pub coalesce_count: u64,
    pub queue_depth: u64,
    pub snapshot_version: u64,
    pub snapshot_size_bytes: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    /// Time spent in idle reclamation while the last build ran.
    pub gc_pause_delta: Duration,
    pub swap_latency: Duration,
    pub ui_update_latency: Duration,
    pub last_file_change_at: Option<Instant>,
    pub last_snapshot_ready_at: Option<Instant>,
    pub incremental_list_count: u64,
    pub full_list_count: u64,
    pub incremental_list_ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerHealth {
    pub started: bool,
    /// Started, not stopped, and heartbeating within the timeout.
    pub alive: bool,
    pub last_heartbeat: Option<Instant>,
    pub recovery_count: u32,
    pub uptime_since: Option<Timestamp>,

    pub idle_gc_enabled: bool,
    pub idle_gc_count: u64,
    pub idle_gc_total: Duration,
    pub idle_gc_last_duration: Duration,
    pub idle_gc_last_at: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct MetricCounters {
    pub processing_count: AtomicU64,
    pub processing_ns: AtomicU64,
    pub phase1_ns: AtomicU64,
    pub phase2_ns: AtomicU64,
    pub coalesce_count: AtomicU64,
    pub queue_depth: AtomicU64,
    pub snapshot_size_bytes: AtomicU64,
    pub gc_pause_ns: AtomicU64,
    pub swap_ns: AtomicU64,
    pub ui_update_ns: AtomicU64,
    pub pool_hits: AtomicU64,
    pub pool_misses: AtomicU64,
    pub snapshot_version: AtomicU64,
    pub incremental_lists: AtomicU64,
    pub full_lists: AtomicU64,
    pub last_file_change: AtomicInstant,
    pub last_snapshot_ready: AtomicInstant,
}

impl MetricCounters {
    pub(crate) fn new(epoch: Instant) -> Self {
        Self {
            processing_count: AtomicU64::new(0),
            processing_ns: AtomicU64::new(0),
            phase1_ns: AtomicU64::new(0),
            phase2_ns: AtomicU64::new(0),
            coalesce_count: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            snapshot_size_bytes: AtomicU64::new(0),
            gc_pause_ns: AtomicU64::new(0),
            swap_ns: AtomicU64::new(0),
            ui_update_ns: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            snapshot_version: AtomicU64::new(0),
            incremental_lists: AtomicU64::new(0),
            full_lists: AtomicU64::new(0),
            last_file_change: AtomicInstant::new(epoch),
            last_snapshot_ready: AtomicInstant::new(epoch),
        }
    }

    pub(crate) fn snapshot(&self) -> WorkerMetrics {
        let incremental = self.incremental_lists.load(Ordering::Relaxed);
        let full = self.full_lists.load(Ordering::Relaxed);
        let total = incremental + full;
        let ratio = if total > 0 {
            incremental as f64 / total as f64
        } else {
            0.0
        };

        WorkerMetrics {
            processing_count: self.processing_count.load(Ordering::Relaxed),
            processing_duration: load_duration(&self.processing_ns),
            phase1_duration: load_duration(&self.phase1_ns),
            phase2_duration: load_duration(&self.phase2_ns),
            coalesce_count: self.coalesce_count.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            snapshot_version: self.snapshot_version.load(Ordering::Acquire),
            snapshot_size_bytes: self.snapshot_size_bytes.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            gc_pause_delta: load_duration(&self.gc_pause_ns),
            swap_latency: load_duration(&self.swap_ns),
            ui_update_latency: load_duration(&self.ui_update_ns),
            last_file_change_at: self.last_file_change.load(),
            last_snapshot_ready_at: self.last_snapshot_ready.load(),
            incremental_list_count: incremental,
            full_list_count: full,
            incremental_list_ratio: ratio,
        }
    }
}

//! Idle-time memory reclamation.
//!
//! While the worker sits idle it periodically hands memory back through an
//! [`IdleReclaimer`]. Passes are taken under the state lock so they can never
//! overlap a transition into `Processing`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;

use super::Inner;
use super::messages::WorkerState;
use super::metrics::{AtomicInstant, load_duration};
use crate::config::WorkerLogLevel;
use crate::loader::IssuePool;

/// Something that can give memory back when the worker is idle.
pub trait IdleReclaimer: Send + Sync {
    /// Run one reclamation pass.
    fn reclaim(&self);

    /// Apply an aggressiveness percentage (100 = neutral) and return the
    /// previous one so it can be restored.
    fn set_gc_percent(&self, percent: u32) -> u32;
}

/// Trims the idle free-list of an [`IssuePool`]. The GC percent scales how
/// many idle buffers the pool retains.
pub struct PoolReclaimer {
    pool: Arc<IssuePool>,
}

impl PoolReclaimer {
    pub fn new(pool: Arc<IssuePool>) -> Self {
        Self { pool }
    }
}

impl IdleReclaimer for PoolReclaimer {
    fn reclaim(&self) {
        let released = self.pool.trim();
        if released > 0 {
            tracing::trace!(released, "trimmed idle issue buffers");
        }
    }

    fn set_gc_percent(&self, percent: u32) -> u32 {
        self.pool.set_retention_percent(percent)
    }
}

#[derive(Debug)]
pub(crate) struct IdleStats {
    count: AtomicU64,
    total_ns: AtomicU64,
    last_ns: AtomicU64,
    last_at: AtomicInstant,
}

impl IdleStats {
    pub(crate) fn new(epoch: Instant) -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            last_ns: AtomicU64::new(0),
            last_at: AtomicInstant::new(epoch),
        }
    }

    fn record(&self, at: Instant, took: Duration) {
        let nanos = took.as_nanos() as u64;
        self.last_at.store(at);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(nanos, Ordering::Relaxed);
        self.last_ns.store(nanos, Ordering::Relaxed);
    }

    pub(crate) fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn total(&self) -> Duration {
        load_duration(&self.total_ns)
    }

    pub(crate) fn last_duration(&self) -> Duration {
        load_duration(&self.last_ns)
    }

    pub(crate) fn last_at(&self) -> Option<Instant> {
        self.last_at.load()
    }
}

impl Inner {
    pub(super) async fn idle_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.idle_gc.check_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.root.cancelled() => return,
                _ = ticker.tick() => self.maybe_idle_gc(Instant::now()),
            }
        }
    }

    /// Run a reclamation pass if the worker has been idle long enough and the
    /// previous pass is old enough.
    pub(super) fn maybe_idle_gc(&self, now: Instant) {
        let gc = &self.config.idle_gc;
        if !gc.enabled || self.shared.lock().state != WorkerState::Idle {
            return;
        }

        let shared = self.shared.lock();
        if shared.state != WorkerState::Idle {
            return;
        }

        let Some(last_activity) = self.last_activity.load() else {
            self.last_activity.store(now);
            return;
        };
        if now.saturating_duration_since(last_activity) < gc.threshold {
            return;
        }
        if self
            .idle
            .last_at()
            .is_some_and(|last| now.saturating_duration_since(last) < gc.min_interval)
        {
            return;
        }

        let started = Instant::now();
        self.reclaimer.reclaim();
        let took = started.elapsed();
        self.idle.record(Instant::now(), took);
        drop(shared);

        self.log.event(
            WorkerLogLevel::Debug,
            "idle_gc",
            json!({ "duration_us": took.as_micros() as u64, "count": self.idle.count() }),
        );
    }
}

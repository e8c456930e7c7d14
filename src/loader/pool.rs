//! Reusable backing storage for loaded issue collections.
//!
//! Every load draws a `Vec<Issue>` from an [`IssuePool`] and hands it out as a
//! [`PooledIssues`]. The allocation goes back to the pool exactly once: either
//! through an explicit [`PooledIssues::release`] or when the value is dropped
//! (superseded snapshot, dedup no-op, stale build). Ownership makes a double
//! return impossible.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use crate::types::Issue;

/// Idle collections kept around at 100% retention.
pub const DEFAULT_MAX_IDLE: usize = 4;

static GLOBAL_POOL: LazyLock<Arc<IssuePool>> =
    LazyLock::new(|| Arc::new(IssuePool::new(DEFAULT_MAX_IDLE)));

/// Counters describing pool effectiveness since the pool was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub returns: u64,
    pub idle: usize,
}

#[derive(Debug)]
pub struct IssuePool {
    free: Mutex<Vec<Vec<Issue>>>,
    base_max_idle: usize,
    retention_percent: AtomicU32,
    hits: AtomicU64,
    misses: AtomicU64,
    returns: AtomicU64,
}

impl IssuePool {
    pub fn new(base_max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            base_max_idle,
            retention_percent: AtomicU32::new(100),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            returns: AtomicU64::new(0),
        }
    }

    /// Process-wide pool used by the default loader.
    pub fn global() -> Arc<IssuePool> {
        Arc::clone(&GLOBAL_POOL)
    }

    /// Take a cleared collection with at least `capacity` slots reserved.
    pub fn acquire(self: &Arc<Self>, capacity: usize) -> PooledIssues {
        let reused = self.free.lock().pop();
        let mut issues = match reused {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                v
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        };
        issues.reserve(capacity);
        PooledIssues {
            issues,
            pool: Some(Arc::clone(self)),
        }
    }

    fn put(&self, mut issues: Vec<Issue>) {
        self.returns.fetch_add(1, Ordering::Relaxed);
        issues.clear();
        let max_idle = self.max_idle();
        let mut free = self.free.lock();
        if free.len() < max_idle {
            free.push(issues);
        }
    }

    fn max_idle(&self) -> usize {
        let percent = self.retention_percent.load(Ordering::Relaxed) as usize;
        (self.base_max_idle * percent / 100).max(1)
    }

    /// Drop every idle collection. Returns how many were freed.
    pub fn trim(&self) -> usize {
        let mut free = self.free.lock();
        let n = free.len();
        free.clear();
        free.shrink_to_fit();
        n
    }

    /// Scale idle retention; returns the previous percentage.
    pub fn set_retention_percent(&self, percent: u32) -> u32 {
        self.retention_percent.swap(percent.max(1), Ordering::Relaxed)
    }

    pub fn retention_percent(&self) -> u32 {
        self.retention_percent.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            idle: self.free.lock().len(),
        }
    }
}

/// An issue collection whose allocation belongs to an [`IssuePool`].
#[derive(Debug)]
pub struct PooledIssues {
    issues: Vec<Issue>,
    pool: Option<Arc<IssuePool>>,
}

impl PooledIssues {
    /// A collection that is not backed by any pool.
    pub fn detached(issues: Vec<Issue>) -> Self {
        Self { issues, pool: None }
    }

    pub fn as_vec_mut(&mut self) -> &mut Vec<Issue> {
        &mut self.issues
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Hand the allocation back to its pool now.
    pub fn release(mut self) {
        self.return_to_pool();
    }

    fn return_to_pool(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.put(std::mem::take(&mut self.issues));
        }
    }
}

impl Deref for PooledIssues {
    type Target = [Issue];

    fn deref(&self) -> &[Issue] {
        &self.issues
    }
}

impl DerefMut for PooledIssues {
    fn deref_mut(&mut self) -> &mut [Issue] {
        &mut self.issues
    }
}

impl Drop for PooledIssues {
    fn drop(&mut self) {
        self.return_to_pool();
    }
}

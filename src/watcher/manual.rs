use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;

use super::{FilesystemType, Watcher};
use crate::error::{BeadworkError, Result};

/// A watcher driven by hand. Used by tests and by embedders that learn about
/// changes some other way.
#[derive(Debug)]
pub struct ManualWatcher {
    changes: watch::Sender<u64>,
    started: AtomicBool,
    starts: AtomicUsize,
    fail_start: AtomicBool,
}

impl Default for ManualWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualWatcher {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            changes,
            started: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
        }
    }

    /// Signal one (already debounced) change.
    pub fn notify_change(&self) {
        self.changes.send_modify(|n| *n += 1);
    }

    /// Make subsequent `start()` calls fail.
    pub fn set_fail_on_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Number of successful starts so far.
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl Watcher for ManualWatcher {
    fn start(&self) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(BeadworkError::WatcherError("manual watcher refused to start".to_string()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BeadworkError::WatcherError("watcher already started".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn is_polling(&self) -> bool {
        false
    }

    fn poll_interval(&self) -> Duration {
        Duration::ZERO
    }

    fn filesystem_type(&self) -> FilesystemType {
        FilesystemType::Unknown
    }
}

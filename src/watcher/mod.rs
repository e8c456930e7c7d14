//! Change detection for the issues file.
//!
//! [`FileWatcher`] watches the file's parent directory with
//! `notify::RecommendedWatcher` and bridges events into tokio, falling back to
//! mtime/size polling when native events are unavailable, forced off, or the
//! file lives on a network filesystem. Bursts are debounced before the change
//! counter published through [`Watcher::subscribe`] is bumped.

mod fs_type;
mod manual;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::{EventKind, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{BeadworkError, Result};

pub use fs_type::{FilesystemType, classify_from_mounts, detect as detect_filesystem_type};
pub use manual::ManualWatcher;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A source of debounced change notifications.
///
/// The receiver returned by [`Watcher::subscribe`] carries a counter that is
/// bumped once per debounced change. It stays valid across `stop()`/`start()`.
pub trait Watcher: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self);
    fn subscribe(&self) -> watch::Receiver<u64>;
    fn is_polling(&self) -> bool;
    fn poll_interval(&self) -> Duration;
    fn filesystem_type(&self) -> FilesystemType;
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub debounce: Duration,
    pub poll_interval: Duration,
    pub force_poll: bool,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            debounce: crate::config::DEFAULT_DEBOUNCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            force_poll: false,
        }
    }
}

#[derive(Default)]
struct Running {
    started: bool,
    polling: bool,
    fs_type: FilesystemType,
    cancel: Option<CancellationToken>,
    // Dropping this deregisters the OS watch.
    native: Option<notify::RecommendedWatcher>,
}

pub struct FileWatcher {
    path: PathBuf,
    options: WatcherOptions,
    changes: Arc<watch::Sender<u64>>,
    running: Mutex<Running>,
}

impl FileWatcher {
    pub fn new(path: impl Into<PathBuf>, options: WatcherOptions) -> Self {
        let path = path.into();
        let path = std::path::absolute(&path).unwrap_or(path);
        let (changes, _) = watch::channel(0);
        Self {
            path,
            options,
            changes: Arc::new(changes),
            running: Mutex::new(Running::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_started(&self) -> bool {
        self.running.lock().started
    }

    fn native_watcher(&self, tx: mpsc::Sender<()>) -> Result<notify::RecommendedWatcher> {
        let target = self.path.file_name().map(|n| n.to_os_string());
        let mut watcher = notify::RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == target);
                    if !ours {
                        return;
                    }
                    match event.kind {
                        EventKind::Create(_) | EventKind::Modify(_) => {
                            // Full means a change is already queued.
                            let _ = tx.try_send(());
                        }
                        EventKind::Remove(_) => {
                            tracing::warn!("watched file was removed");
                        }
                        _ => {}
                    }
                }
                Err(e) => tracing::warn!("filesystem watcher error: {e}"),
            },
            notify::Config::default(),
        )
        .map_err(|e| BeadworkError::WatcherError(format!("failed to create filesystem watcher: {e}")))?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| BeadworkError::WatcherError(format!("failed to watch {}: {e}", dir.display())))?;
        Ok(watcher)
    }
}

impl Watcher for FileWatcher {
    fn start(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| BeadworkError::NoRuntime(e.to_string()))?;

        let mut running = self.running.lock();
        if running.started {
            return Err(BeadworkError::WatcherError("watcher already started".to_string()));
        }

        match std::fs::metadata(&self.path) {
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(BeadworkError::WatcherError(format!(
                    "permission denied: {}",
                    self.path.display()
                )));
            }
            _ => {}
        }

        let fs_type = fs_type::detect(&self.path);
        let mut polling = self.options.force_poll || fs_type.is_remote();

        let (tx, rx) = mpsc::channel::<()>(1);
        let mut native = None;
        if !polling {
            match self.native_watcher(tx.clone()) {
                Ok(w) => native = Some(w),
                Err(e) => {
                    tracing::warn!("{e}; falling back to polling");
                    polling = true;
                }
            }
        }

        let cancel = CancellationToken::new();
        handle.spawn(debounce_loop(
            rx,
            Arc::clone(&self.changes),
            self.options.debounce,
            cancel.clone(),
        ));
        if polling {
            handle.spawn(poll_loop(
                self.path.clone(),
                stamp(&self.path).ok(),
                self.options.poll_interval,
                tx,
                cancel.clone(),
            ));
        }

        tracing::debug!(
            path = %self.path.display(),
            polling,
            fs_type = %fs_type,
            "file watcher started"
        );

        *running = Running {
            started: true,
            polling,
            fs_type,
            cancel: Some(cancel),
            native,
        };
        Ok(())
    }

    fn stop(&self) {
        let mut running = self.running.lock();
        if !running.started {
            return;
        }
        if let Some(cancel) = running.cancel.take() {
            cancel.cancel();
        }
        running.native = None;
        running.started = false;
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn is_polling(&self) -> bool {
        self.running.lock().polling
    }

    fn poll_interval(&self) -> Duration {
        self.options.poll_interval
    }

    fn filesystem_type(&self) -> FilesystemType {
        self.running.lock().fs_type
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait for a raw change, absorb the burst that follows, then publish once.
async fn debounce_loop(
    mut rx: mpsc::Receiver<()>,
    changes: Arc<watch::Sender<u64>>,
    debounce: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            msg = rx.recv() => {
                if msg.is_none() {
                    return;
                }
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                res = tokio::time::timeout(debounce, rx.recv()) => match res {
                    Ok(Some(())) => continue,
                    Ok(None) | Err(_) => break,
                },
            }
        }

        changes.send_modify(|n| *n += 1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

fn stamp(path: &Path) -> std::io::Result<FileStamp> {
    let meta = std::fs::metadata(path)?;
    Ok(FileStamp {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

async fn poll_loop(
    path: PathBuf,
    mut last: Option<FileStamp>,
    every: Duration,
    tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match stamp(&path) {
            Ok(now) => {
                if last != Some(now) {
                    last = Some(now);
                    let _ = tx.try_send(());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if last.take().is_some() {
                    tracing::warn!(path = %path.display(), "watched file was removed");
                }
            }
            Err(e) => tracing::warn!(path = %path.display(), "poll failed: {e}"),
        }
    }
}

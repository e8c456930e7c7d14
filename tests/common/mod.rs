#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use beadwork::config::IdleGcConfig;
use beadwork::{
    FileWatcher, MessageReceiver, SnapshotReady, WorkerConfig, WorkerError, WorkerMessage,
    WatcherOptions,
};
use serde_json::json;
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(10);
pub const LONG: Duration = Duration::from_secs(3600);

/// An issues file in its own temp directory.
pub struct BeadsFile {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl BeadsFile {
    pub fn new(lines: &[String]) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("issues.jsonl");
        let file = BeadsFile { dir, path };
        file.write(lines);
        file
    }

    pub fn write(&self, lines: &[String]) {
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(&self.path, content).expect("Failed to write issues file");
    }

    /// A polling watcher on this file that notices changes quickly.
    pub fn fast_watcher(&self) -> Arc<FileWatcher> {
        Arc::new(FileWatcher::new(
            &self.path,
            WatcherOptions {
                debounce: Duration::from_millis(20),
                poll_interval: Duration::from_millis(25),
                force_poll: true,
            },
        ))
    }
}

pub fn issue_line(id: &str, status: &str, blocked_by: &[&str]) -> String {
    let deps: Vec<_> = blocked_by
        .iter()
        .map(|dep| json!({ "issue_id": id, "depends_on_id": dep, "type": "blocks" }))
        .collect();
    json!({
        "id": id,
        "title": format!("Issue {id}"),
        "status": status,
        "priority": 2,
        "created_at": "2026-01-01T00:00:00Z",
        "dependencies": deps,
    })
    .to_string()
}

/// Timers far in the future so only the test drives the worker.
pub fn quiet_config(path: &Path) -> WorkerConfig {
    WorkerConfig {
        beads_path: Some(path.to_path_buf()),
        heartbeat_interval: LONG,
        watchdog_interval: LONG,
        heartbeat_timeout: LONG,
        processing_timeout: LONG,
        idle_gc: IdleGcConfig::disabled(),
        test_mode: true,
        ..WorkerConfig::default()
    }
}

pub async fn next_message(rx: &MessageReceiver) -> WorkerMessage {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no worker message in time")
        .expect("worker channel closed")
}

pub async fn next_ready(rx: &MessageReceiver) -> SnapshotReady {
    loop {
        match next_message(rx).await {
            WorkerMessage::SnapshotReady(ready) => return ready,
            WorkerMessage::Phase2Ready { .. } => continue,
            WorkerMessage::SnapshotError { error, .. } => panic!("unexpected worker error: {error}"),
        }
    }
}

pub async fn next_error(rx: &MessageReceiver) -> (WorkerError, bool) {
    loop {
        if let WorkerMessage::SnapshotError { error, recoverable } = next_message(rx).await {
            return (error, recoverable);
        }
    }
}

pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

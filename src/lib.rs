pub mod analysis;
pub mod config;
pub mod error;
pub mod loader;
pub mod recipe;
pub mod snapshot;
pub mod types;
pub mod watcher;
pub mod worker;

#[doc(hidden)]
pub mod test_guards;

pub use analysis::graph::GraphStats;
pub use analysis::{IssueDiff, content_hash};
pub use config::{IdleGcConfig, WorkerConfig, WorkerLogLevel};
pub use error::{BeadworkError, Result};
pub use loader::{IssueLoader, IssuePool, JsonlLoader, LoadOptions, PooledIssues};
pub use recipe::Recipe;
pub use snapshot::{DatasetTier, ListItem, Snapshot, SnapshotBuilder};
pub use types::{Dependency, DependencyType, Issue, IssueType, Status};
pub use watcher::{FileWatcher, FilesystemType, ManualWatcher, Watcher, WatcherOptions};
pub use worker::{
    BackgroundWorker, ErrorPhase, IdleReclaimer, MessageReceiver, PoolReclaimer, SnapshotReady,
    WatcherInfo, WorkerComponents, WorkerError, WorkerHealth, WorkerMessage, WorkerMetrics,
    WorkerState,
};

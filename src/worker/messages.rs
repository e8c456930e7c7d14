use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use jiff::Timestamp;
use thiserror::Error;

use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    Processing,
    /// Terminal.
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Processing => "processing",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where in the pipeline a [`WorkerError`] originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    Load,
    AnalyzePhase1,
    /// The worker stopped responding and could not be recovered.
    Watchdog,
}

impl ErrorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPhase::Load => "load",
            ErrorPhase::AnalyzePhase1 => "analyze_phase1",
            ErrorPhase::Watchdog => "watchdog",
        }
    }
}

impl fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failed build step. Cheap to clone so it can ride in messages and be
/// handed out by `last_error()`.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{phase} failed: {cause} (retries: {retries})")]
pub struct WorkerError {
    pub phase: ErrorPhase,
    pub cause: String,
    pub time: Timestamp,
    /// Consecutive failures including this one.
    pub retries: u32,
}

impl WorkerError {
    pub fn new(phase: ErrorPhase, cause: impl Into<String>) -> Self {
        Self {
            phase,
            cause: cause.into(),
            time: Timestamp::now(),
            retries: 0,
        }
    }
}

/// A freshly published snapshot plus delivery timing.
#[derive(Debug, Clone)]
pub struct SnapshotReady {
    pub snapshot: Arc<Snapshot>,
    /// Most recent file change observed before this build, if any.
    pub file_change_at: Option<Instant>,
    pub sent_at: Instant,
    pub version: u64,
    /// Change notifications folded into this build.
    pub queue_depth: u64,
    /// Triggers that arrived while this build was running.
    pub coalesce_count: u64,
}

/// Everything the worker delivers to its consumer.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    SnapshotReady(SnapshotReady),
    SnapshotError {
        error: WorkerError,
        /// `false` means the worker has given up and stopped.
        recoverable: bool,
    },
    /// Phase 2 finished for the snapshot with this content hash. Compare it
    /// against the current snapshot before using the new scores.
    Phase2Ready { data_hash: String },
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::SnapshotReady(_) => "snapshot_ready",
            WorkerMessage::SnapshotError { .. } => "snapshot_error",
            WorkerMessage::Phase2Ready { .. } => "phase2_ready",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_error_display() {
        let mut err = WorkerError::new(ErrorPhase::AnalyzePhase1, "boom");
        err.retries = 2;
        assert_eq!(err.to_string(), "analyze_phase1 failed: boom (retries: 2)");
    }

    #[test]
    fn test_state_names() {
        assert_eq!(WorkerState::default(), WorkerState::Idle);
        assert_eq!(WorkerState::Stopped.to_string(), "stopped");
    }
}

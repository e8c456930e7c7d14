use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BeadworkError {
    #[error("no issues file found at {}", .0.display())]
    DataFileNotFound(PathBuf),

    #[error("line {line} exceeds the maximum line size of {limit} bytes")]
    LineTooLong { line: usize, limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml_ng::Error),

    #[error("watcher error: {0}")]
    WatcherError(String),

    #[error("worker has been stopped")]
    WorkerStopped,

    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, BeadworkError>;

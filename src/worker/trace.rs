//! The worker's structured event log.
//!
//! Events go to `tracing` when they pass the configured [`WorkerLogLevel`].
//! With a trace path configured, every event is also appended to that file as
//! one JSON object per line, whatever the level.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use jiff::Timestamp;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};

use crate::config::WorkerLogLevel;

pub const COMPONENT: &str = "background_worker";

pub struct EventLog {
    level: WorkerLogLevel,
    path: Option<PathBuf>,
    sink: Mutex<Option<File>>,
}

impl EventLog {
    pub fn new(level: WorkerLogLevel, path: Option<PathBuf>) -> Self {
        Self {
            level,
            path,
            sink: Mutex::new(None),
        }
    }

    pub fn level(&self) -> WorkerLogLevel {
        self.level
    }

    pub fn trace_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_tracing(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Whether an event at `level` would be recorded anywhere.
    pub fn enabled(&self, level: WorkerLogLevel) -> bool {
        level != WorkerLogLevel::None && (self.passes(level) || self.is_tracing())
    }

    fn passes(&self, level: WorkerLogLevel) -> bool {
        self.level != WorkerLogLevel::None && level <= self.level
    }

    /// Open the trace file for appending. A failure is logged and tracing
    /// stays off.
    pub fn open(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let opened = {
            let mut sink = self.sink.lock();
            if sink.is_some() {
                return;
            }
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    *sink = Some(file);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = opened {
            self.event(
                WorkerLogLevel::Warn,
                "trace_open_failed",
                json!({ "path": path.display().to_string(), "error": e.to_string() }),
            );
        }
    }

    pub fn close(&self) {
        let Some(file) = self.sink.lock().take() else {
            return;
        };
        if let Err(e) = file.sync_all() {
            self.event(
                WorkerLogLevel::Warn,
                "trace_close_failed",
                json!({ "error": e.to_string() }),
            );
        }
    }

    /// Record `event` with the key/value pairs of `fields` (a JSON object).
    pub fn event(&self, level: WorkerLogLevel, event: &str, fields: Value) {
        if level == WorkerLogLevel::None {
            return;
        }
        let emit = self.passes(level);
        let mut sink = self.sink.lock();
        if !emit && sink.is_none() {
            return;
        }

        let mut payload = Map::new();
        payload.insert("ts".to_string(), Value::String(Timestamp::now().to_string()));
        payload.insert("level".to_string(), Value::String(level.as_str().to_string()));
        payload.insert("component".to_string(), Value::String(COMPONENT.to_string()));
        payload.insert("event".to_string(), Value::String(event.to_string()));
        if let Value::Object(extra) = fields {
            payload.extend(extra);
        }
        let payload = Value::Object(payload);

        if let Some(file) = sink.as_mut() {
            let mut line = payload.to_string();
            line.push('\n');
            if let Err(e) = file.write_all(line.as_bytes()) {
                tracing::debug!("failed to write worker trace: {e}");
            }
        }
        drop(sink);

        if emit {
            emit_tracing(level, event, &payload);
        }
    }
}

fn emit_tracing(level: WorkerLogLevel, event: &str, payload: &Value) {
    match level {
        WorkerLogLevel::None => {}
        WorkerLogLevel::Error => tracing::error!(component = COMPONENT, event, "{payload}"),
        WorkerLogLevel::Warn => tracing::warn!(component = COMPONENT, event, "{payload}"),
        WorkerLogLevel::Info => tracing::info!(component = COMPONENT, event, "{payload}"),
        WorkerLogLevel::Debug => tracing::debug!(component = COMPONENT, event, "{payload}"),
        WorkerLogLevel::Trace => tracing::trace!(component = COMPONENT, event, "{payload}"),
    }
}

//! Worker configuration.
//!
//! Every tunable the background worker consumes lives in [`WorkerConfig`].
//! Environment overrides are read exactly once, by [`WorkerConfig::from_env`],
//! and zero-valued fields are replaced with defaults by
//! [`WorkerConfig::normalized`] at construction time. Nothing re-reads the
//! environment mid-run.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::BeadworkError;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);
pub const DEFAULT_MESSAGE_BUFFER: usize = 8;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RECOVERIES: u32 = 3;
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECOVERY_WAIT: Duration = Duration::from_secs(2);

pub const DEFAULT_IDLE_GC_THRESHOLD: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_GC_CHECK_EVERY: Duration = Duration::from_secs(1);
pub const DEFAULT_IDLE_GC_MIN_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_GC_PERCENT: u32 = 200;

/// Verbosity of the worker's own event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum WorkerLogLevel {
    None,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl WorkerLogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerLogLevel::None => "none",
            WorkerLogLevel::Error => "error",
            WorkerLogLevel::Warn => "warn",
            WorkerLogLevel::Info => "info",
            WorkerLogLevel::Debug => "debug",
            WorkerLogLevel::Trace => "trace",
        }
    }

    /// Lenient parse: unknown values fall back to `Warn`.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or(WorkerLogLevel::Warn)
    }
}

impl fmt::Display for WorkerLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkerLogLevel {
    type Err = BeadworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "off" | "0" => Ok(WorkerLogLevel::None),
            "error" | "err" | "1" => Ok(WorkerLogLevel::Error),
            "warn" | "warning" | "2" => Ok(WorkerLogLevel::Warn),
            "info" | "3" => Ok(WorkerLogLevel::Info),
            "debug" | "4" => Ok(WorkerLogLevel::Debug),
            "trace" | "5" => Ok(WorkerLogLevel::Trace),
            other => Err(BeadworkError::Config(format!("invalid log level '{other}'"))),
        }
    }
}

/// Idle-time reclamation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleGcConfig {
    pub enabled: bool,
    /// How long the worker must have been idle before a pass may run.
    pub threshold: Duration,
    /// Tick interval of the idle loop.
    pub check_every: Duration,
    /// Minimum spacing between two passes.
    pub min_interval: Duration,
    /// Aggressiveness applied for the worker lifetime (0 = leave untouched).
    pub gc_percent: u32,
}

impl Default for IdleGcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_IDLE_GC_THRESHOLD,
            check_every: DEFAULT_IDLE_GC_CHECK_EVERY,
            min_interval: DEFAULT_IDLE_GC_MIN_INTERVAL,
            gc_percent: DEFAULT_IDLE_GC_PERCENT,
        }
    }
}

impl IdleGcConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Configuration for [`crate::worker::BackgroundWorker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Path of the JSONL issues file. `None` runs the worker without a data source.
    pub beads_path: Option<PathBuf>,
    pub debounce_delay: Duration,
    /// Capacity of the worker → UI message channel.
    pub message_buffer: usize,

    pub heartbeat_interval: Duration,
    pub watchdog_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub processing_timeout: Duration,
    pub max_recoveries: u32,
    /// Bounded wait for the process loop on `stop()`.
    pub stop_timeout: Duration,
    /// Bounded wait for the old process loop during recovery.
    pub recovery_wait: Duration,

    pub idle_gc: IdleGcConfig,

    pub log_level: WorkerLogLevel,
    pub metrics_enabled: bool,
    pub trace_path: Option<PathBuf>,

    /// Maximum accepted line length in bytes (`None` = loader default).
    pub max_line_size: Option<usize>,
    /// Force the polling watcher even where native notifications work.
    pub force_poll: bool,
    /// Keeps process-wide tuning (the GC percent override) untouched.
    pub test_mode: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            beads_path: None,
            debounce_delay: DEFAULT_DEBOUNCE,
            message_buffer: DEFAULT_MESSAGE_BUFFER,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            max_recoveries: DEFAULT_MAX_RECOVERIES,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            recovery_wait: DEFAULT_RECOVERY_WAIT,
            idle_gc: IdleGcConfig::default(),
            log_level: WorkerLogLevel::default(),
            metrics_enabled: false,
            trace_path: None,
            max_line_size: None,
            force_poll: false,
            test_mode: false,
        }
    }
}

impl WorkerConfig {
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            beads_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Defaults overlaid with the `BV_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(ms) = env_positive_u64("BV_DEBOUNCE_MS") {
            cfg.debounce_delay = Duration::from_millis(ms);
        }
        if let Some(n) = env_positive_u64("BV_CHANNEL_BUFFER") {
            cfg.message_buffer = n as usize;
        }
        if let Some(s) = env_positive_u64("BV_HEARTBEAT_INTERVAL_S") {
            cfg.heartbeat_interval = Duration::from_secs(s);
        }
        if let Some(s) = env_positive_u64("BV_WATCHDOG_INTERVAL_S") {
            cfg.watchdog_interval = Duration::from_secs(s);
        }
        if let Ok(level) = env::var("BV_WORKER_LOG_LEVEL") {
            cfg.log_level = WorkerLogLevel::parse_lenient(&level);
        }
        cfg.metrics_enabled = env_bool("BV_WORKER_METRICS");
        cfg.trace_path = env::var("BV_WORKER_TRACE")
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        cfg.max_line_size = env_positive_u64("BV_MAX_LINE_SIZE_MB").map(|mb| mb as usize * 1024 * 1024);
        cfg.force_poll = env_bool("BV_FORCE_POLL");
        cfg.test_mode = env::var_os("BV_TEST_MODE").is_some_and(|v| !v.is_empty());

        cfg
    }

    /// Replace zero-valued tunables with their defaults.
    pub fn normalized(mut self) -> Self {
        fn or_default(d: Duration, fallback: Duration) -> Duration {
            if d.is_zero() { fallback } else { d }
        }

        self.debounce_delay = or_default(self.debounce_delay, DEFAULT_DEBOUNCE);
        if self.message_buffer == 0 {
            self.message_buffer = DEFAULT_MESSAGE_BUFFER;
        }
        self.heartbeat_interval = or_default(self.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        self.watchdog_interval = or_default(self.watchdog_interval, DEFAULT_WATCHDOG_INTERVAL);
        self.heartbeat_timeout = or_default(self.heartbeat_timeout, DEFAULT_HEARTBEAT_TIMEOUT);
        self.processing_timeout = or_default(self.processing_timeout, DEFAULT_PROCESSING_TIMEOUT);
        if self.max_recoveries == 0 {
            self.max_recoveries = DEFAULT_MAX_RECOVERIES;
        }
        self.stop_timeout = or_default(self.stop_timeout, DEFAULT_STOP_TIMEOUT);
        self.recovery_wait = or_default(self.recovery_wait, DEFAULT_RECOVERY_WAIT);

        let gc = &mut self.idle_gc;
        gc.threshold = or_default(gc.threshold, DEFAULT_IDLE_GC_THRESHOLD);
        gc.check_every = or_default(gc.check_every, DEFAULT_IDLE_GC_CHECK_EVERY);
        gc.min_interval = or_default(gc.min_interval, DEFAULT_IDLE_GC_MIN_INTERVAL);
        if gc.gc_percent == 0 {
            gc.gc_percent = DEFAULT_IDLE_GC_PERCENT;
        }
        self
    }
}

fn env_bool(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => matches!(
            v.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => false,
    }
}

fn env_positive_u64(name: &str) -> Option<u64> {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_guards::{EnvGuard, clean_worker_env};
    use serial_test::serial;

    #[test]
    fn test_log_level_parse() {
        assert_eq!("off".parse::<WorkerLogLevel>().unwrap(), WorkerLogLevel::None);
        assert_eq!("4".parse::<WorkerLogLevel>().unwrap(), WorkerLogLevel::Debug);
        assert_eq!(WorkerLogLevel::parse_lenient("loud"), WorkerLogLevel::Warn);
        assert!(WorkerLogLevel::Trace > WorkerLogLevel::Info);
    }

    #[test]
    fn test_normalized_fills_zero_values() {
        let cfg = WorkerConfig {
            debounce_delay: Duration::ZERO,
            message_buffer: 0,
            max_recoveries: 0,
            idle_gc: IdleGcConfig {
                enabled: true,
                threshold: Duration::ZERO,
                check_every: Duration::ZERO,
                min_interval: Duration::ZERO,
                gc_percent: 0,
            },
            ..WorkerConfig::default()
        }
        .normalized();

        assert_eq!(cfg.debounce_delay, DEFAULT_DEBOUNCE);
        assert_eq!(cfg.message_buffer, DEFAULT_MESSAGE_BUFFER);
        assert_eq!(cfg.max_recoveries, DEFAULT_MAX_RECOVERIES);
        assert_eq!(cfg.idle_gc, IdleGcConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        let _clean = unsafe { clean_worker_env() };
        let _debounce = unsafe { EnvGuard::set("BV_DEBOUNCE_MS", "75") };
        let _buffer = unsafe { EnvGuard::set("BV_CHANNEL_BUFFER", "32") };
        let _heartbeat = unsafe { EnvGuard::set("BV_HEARTBEAT_INTERVAL_S", "9") };
        let _level = unsafe { EnvGuard::set("BV_WORKER_LOG_LEVEL", "debug") };
        let _metrics = unsafe { EnvGuard::set("BV_WORKER_METRICS", "yes") };
        let _line = unsafe { EnvGuard::set("BV_MAX_LINE_SIZE_MB", "2") };
        let _test = unsafe { EnvGuard::set("BV_TEST_MODE", "1") };

        let cfg = WorkerConfig::from_env();
        assert_eq!(cfg.debounce_delay, Duration::from_millis(75));
        assert_eq!(cfg.message_buffer, 32);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(9));
        assert_eq!(cfg.log_level, WorkerLogLevel::Debug);
        assert!(cfg.metrics_enabled);
        assert_eq!(cfg.max_line_size, Some(2 * 1024 * 1024));
        assert!(cfg.test_mode);
    }

    #[test]
    #[serial]
    fn test_from_env_ignores_invalid_values() {
        let _clean = unsafe { clean_worker_env() };
        let _debounce = unsafe { EnvGuard::set("BV_DEBOUNCE_MS", "-5") };
        let _buffer = unsafe { EnvGuard::set("BV_CHANNEL_BUFFER", "lots") };
        let _trace = unsafe { EnvGuard::set("BV_WORKER_TRACE", "   ") };

        let cfg = WorkerConfig::from_env();
        assert_eq!(cfg.debounce_delay, DEFAULT_DEBOUNCE);
        assert_eq!(cfg.message_buffer, DEFAULT_MESSAGE_BUFFER);
        assert!(cfg.trace_path.is_none());
    }
}

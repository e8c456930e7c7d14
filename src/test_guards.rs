//! RAII guards for the `BV_*` environment in tests.
//!
//! `WorkerConfig::from_env` reads process-global state. Tests that poke at it
//! snapshot each variable on construction and restore it in `Drop`, even if
//! the test panics. Such tests must still be `#[serial]`.

use std::env;
use std::ffi::{OsStr, OsString};

/// Every variable `WorkerConfig::from_env` consults.
pub const WORKER_ENV_VARS: &[&str] = &[
    "BV_DEBOUNCE_MS",
    "BV_CHANNEL_BUFFER",
    "BV_HEARTBEAT_INTERVAL_S",
    "BV_WATCHDOG_INTERVAL_S",
    "BV_WORKER_LOG_LEVEL",
    "BV_WORKER_METRICS",
    "BV_WORKER_TRACE",
    "BV_MAX_LINE_SIZE_MB",
    "BV_FORCE_POLL",
    "BV_TEST_MODE",
];

/// Restores one environment variable (or its absence) on drop.
pub struct EnvGuard {
    key: String,
    original: Option<OsString>,
}

impl EnvGuard {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            original: env::var_os(key),
        }
    }

    /// Snapshot `key`, then set it to `value`.
    ///
    /// # Safety
    /// `std::env::set_var` is unsafe in the 2024 edition because other threads
    /// may read the environment concurrently. Callers must be `#[serial]`.
    pub unsafe fn set(key: &str, value: impl AsRef<OsStr>) -> Self {
        let guard = Self::new(key);
        unsafe { env::set_var(key, value) };
        guard
    }

    /// Snapshot `key`, then remove it.
    ///
    /// # Safety
    /// Same contract as [`EnvGuard::set`].
    pub unsafe fn remove(key: &str) -> Self {
        let guard = Self::new(key);
        unsafe { env::remove_var(key) };
        guard
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        // SAFETY: runs at test teardown; guarded tests are #[serial].
        match &self.original {
            Some(val) => unsafe { env::set_var(&self.key, val) },
            None => unsafe { env::remove_var(&self.key) },
        }
    }
}

/// Remove every worker variable for the lifetime of the returned guards.
///
/// # Safety
/// Same contract as [`EnvGuard::set`].
pub unsafe fn clean_worker_env() -> Vec<EnvGuard> {
    WORKER_ENV_VARS
        .iter()
        .map(|key| unsafe { EnvGuard::remove(key) })
        .collect()
}

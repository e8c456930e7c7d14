//! Liveness supervision.
//!
//! The watchdog ticks on its own timer. A build that runs past the processing
//! timeout, or a change loop that stops heartbeating, triggers a recovery:
//! the generation is bumped (orphaning any in-flight build), the change loop
//! and watcher are restarted, and a forced refresh rebuilds from scratch.
//! Too many recoveries stop the worker with a fatal error.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use super::Inner;
use super::messages::{ErrorPhase, WorkerError, WorkerMessage, WorkerState};
use crate::config::WorkerLogLevel;

/// Clears the single-flight flag however recovery exits.
struct RecoveringGuard<'a>(&'a Inner);

impl Drop for RecoveringGuard<'_> {
    fn drop(&mut self) {
        self.0.shared.lock().recovering = false;
    }
}

impl Inner {
    pub(super) async fn watchdog_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.watchdog_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.root.cancelled() => return,
                _ = ticker.tick() => self.check_health(Instant::now()).await,
            }
        }
    }

    pub(super) async fn check_health(self: &Arc<Self>, now: Instant) {
        let (state, last_heartbeat, processing_start) = {
            let shared = self.shared.lock();
            if !shared.started || shared.state == WorkerState::Stopped || shared.recovering {
                return;
            }
            (shared.state, shared.last_heartbeat, shared.processing_start)
        };

        let processing_timeout = self.config.processing_timeout;
        if state == WorkerState::Processing
            && processing_start.is_some_and(|start| now.saturating_duration_since(start) > processing_timeout)
        {
            self.attempt_recovery(format!("processing exceeded {processing_timeout:?}"))
                .await;
            return;
        }

        let heartbeat_timeout = self.config.heartbeat_timeout;
        if last_heartbeat.is_some_and(|hb| now.saturating_duration_since(hb) > heartbeat_timeout) {
            self.attempt_recovery(format!("missed heartbeat for {heartbeat_timeout:?}"))
                .await;
        }
    }

    pub(super) async fn attempt_recovery(self: &Arc<Self>, reason: String) {
        let (attempt, loop_token, loop_task) = {
            let mut shared = self.shared.lock();
            if shared.state == WorkerState::Stopped || !shared.started || shared.recovering {
                return;
            }
            shared.recovering = true;
            shared.recovery_count += 1;
            shared.generation += 1;
            shared.state = WorkerState::Idle;
            shared.dirty = false;
            shared.processing_start = None;
            shared.last_heartbeat = Some(Instant::now());
            (
                shared.recovery_count,
                shared.loop_token.take(),
                shared.loop_task.take(),
            )
        };
        let _recovering = RecoveringGuard(self);

        let max = self.config.max_recoveries;
        if max > 0 && attempt > max {
            self.give_up(format!("background worker unresponsive (giving up): {reason}"))
                .await;
            return;
        }

        self.log.event(
            WorkerLogLevel::Warn,
            "recovery_attempt",
            json!({ "attempt": attempt, "max": max, "reason": reason }),
        );

        if let Some(token) = loop_token {
            token.cancel();
        }
        if let Some(task) = loop_task {
            if tokio::time::timeout(self.config.recovery_wait, task).await.is_err() {
                self.log.event(
                    WorkerLogLevel::Warn,
                    "recovery_loop_shutdown_timeout",
                    json!({}),
                );
            }
        }

        if let Some(watcher) = &self.watcher {
            watcher.stop();
            let restarted = {
                let _runtime = self.handle.enter();
                watcher.start()
            };
            if let Err(e) = restarted {
                self.give_up(format!("background worker recovery failed (watcher start): {e}"))
                    .await;
                return;
            }
        }

        self.start_loop();
        self.force_refresh();
    }

    /// Report a fatal error and stop.
    async fn give_up(&self, cause: String) {
        let mut error = WorkerError::new(ErrorPhase::Watchdog, cause);
        if let Some(recorded) = self.record_error(Some(error.clone())) {
            error = recorded;
        }
        self.log.event(
            WorkerLogLevel::Error,
            "recovery_failed",
            json!({ "error": error.to_string() }),
        );
        self.send(WorkerMessage::SnapshotError {
            error,
            recoverable: false,
        });
        self.stop().await;
    }
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use beadwork::test_guards::{EnvGuard, clean_worker_env};
use beadwork::{
    BackgroundWorker, BeadworkError, ErrorPhase, ManualWatcher, Recipe, WorkerComponents,
    WorkerConfig, WorkerState,
};
use common::{BeadsFile, WAIT, issue_line, next_error, next_ready, quiet_config, wait_until};
use serial_test::serial;

#[tokio::test]
async fn test_file_changes_flow_through_to_snapshots() {
    let file = BeadsFile::new(&[
        issue_line("bd-1", "open", &[]),
        issue_line("bd-2", "open", &["bd-1"]),
    ]);
    let config = quiet_config(&file.path);
    let components = WorkerComponents::from_config(&config).with_watcher(file.fast_watcher());
    let worker = BackgroundWorker::with_components(config, components).unwrap();
    let rx = worker.messages();
    worker.start().unwrap();
    assert!(worker.watcher_info().polling);

    worker.force_refresh();
    let first = next_ready(&rx).await;
    assert_eq!(first.version, 1);
    assert_eq!(first.snapshot.len(), 2);
    assert_eq!(first.snapshot.count_open, 2);
    assert_eq!(first.snapshot.count_ready, 1);

    file.write(&[
        issue_line("bd-1", "closed", &[]),
        issue_line("bd-2", "open", &["bd-1"]),
        issue_line("bd-3", "open", &[]),
    ]);
    let second = next_ready(&rx).await;
    assert_eq!(second.version, 2);
    assert_eq!(second.snapshot.len(), 3);
    assert!(second.file_change_at.is_some());
    let diff = second.snapshot.diff.as_ref().unwrap();
    assert_eq!(diff.added, vec!["bd-3".to_string()]);
    assert_eq!(second.snapshot.count_closed, 1);
    assert_eq!(second.snapshot.count_ready, 2);

    worker.stop().await;
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_malformed_lines_become_load_warnings() {
    let file = BeadsFile::new(&[
        issue_line("bd-1", "open", &[]),
        "{ this is not json".to_string(),
        String::new(),
        issue_line("bd-2", "in_progress", &[]),
    ]);
    let mut config = quiet_config(&file.path);
    config.metrics_enabled = true;
    let mut components = WorkerComponents::from_config(&config);
    components.watcher = None;
    let worker = BackgroundWorker::with_components(config, components).unwrap();
    let rx = worker.messages();
    worker.start().unwrap();

    worker.trigger_refresh();
    let ready = next_ready(&rx).await;
    assert_eq!(ready.snapshot.len(), 2);
    assert_eq!(ready.snapshot.load_warning_count, 1);
    assert!(worker.last_error().is_none());

    let metrics = worker.metrics();
    assert_eq!(metrics.processing_count, 1);
    assert!(metrics.snapshot_size_bytes > 0);
    assert!(metrics.pool_hits + metrics.pool_misses >= 1);

    worker.stop().await;
}

#[tokio::test]
async fn test_missing_file_reports_recoverable_load_error() {
    let file = BeadsFile::new(&[issue_line("bd-1", "open", &[])]);
    std::fs::remove_file(&file.path).unwrap();

    let config = quiet_config(&file.path);
    let mut components = WorkerComponents::from_config(&config);
    components.watcher = None;
    let worker = BackgroundWorker::with_components(config, components).unwrap();
    let rx = worker.messages();
    worker.start().unwrap();

    worker.trigger_refresh();
    let (error, recoverable) = next_error(&rx).await;
    assert!(recoverable);
    assert_eq!(error.phase, ErrorPhase::Load);
    assert_eq!(error.retries, 1);
    assert!(worker.snapshot().is_none());

    // The file shows up: the next cycle succeeds and clears the error.
    file.write(&[issue_line("bd-1", "open", &[])]);
    worker.trigger_refresh();
    let ready = next_ready(&rx).await;
    assert_eq!(ready.snapshot.len(), 1);
    assert!(worker.last_error().is_none());

    worker.stop().await;
}

#[tokio::test]
async fn test_recipe_file_filters_view() {
    let file = BeadsFile::new(&[
        issue_line("bd-1", "open", &[]),
        issue_line("bd-2", "closed", &[]),
        issue_line("bd-3", "open", &["bd-1"]),
    ]);
    let recipe_path = file.dir.path().join("actionable.yaml");
    std::fs::write(
        &recipe_path,
        "name: actionable\nfilters:\n  status: [open]\n  actionable: true\n",
    )
    .unwrap();
    let recipe = Recipe::load_file(&recipe_path).unwrap();

    let config = quiet_config(&file.path);
    let mut components = WorkerComponents::from_config(&config);
    components.watcher = None;
    let worker = BackgroundWorker::with_components(config, components).unwrap();
    let rx = worker.messages();
    worker.start().unwrap();

    worker.set_recipe(Some(recipe));
    let ready = next_ready(&rx).await;
    assert_eq!(ready.snapshot.recipe_name, "actionable");
    let view: Vec<_> = ready.snapshot.view_issues().map(|i| i.id.clone()).collect();
    assert_eq!(view, vec!["bd-1".to_string()]);

    worker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_loop_exhausts_recoveries_and_stops() {
    let file = BeadsFile::new(&[issue_line("bd-1", "open", &[])]);
    let config = WorkerConfig {
        heartbeat_timeout: Duration::from_millis(20),
        watchdog_interval: Duration::from_millis(5),
        max_recoveries: 1,
        ..quiet_config(&file.path)
    };
    let watcher = Arc::new(ManualWatcher::new());
    let components = WorkerComponents::from_config(&config).with_watcher(watcher.clone());
    let worker = BackgroundWorker::with_components(config, components).unwrap();
    let rx = worker.messages();
    worker.start().unwrap();

    tokio::time::timeout(WAIT, worker.done())
        .await
        .expect("worker should give up");

    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(worker.health().recovery_count >= 2);
    assert!(!watcher.is_started());

    let (error, recoverable) = next_error(&rx).await;
    assert!(!recoverable);
    assert_eq!(error.phase, ErrorPhase::Watchdog);
    assert!(matches!(worker.start(), Err(BeadworkError::WorkerStopped)));
}

#[tokio::test]
async fn test_stop_waits_and_is_idempotent() {
    let file = BeadsFile::new(&[issue_line("bd-1", "open", &[])]);
    let config = quiet_config(&file.path);
    let components = WorkerComponents::from_config(&config).with_watcher(file.fast_watcher());
    let worker = BackgroundWorker::with_components(config, components).unwrap();
    let rx = worker.messages();
    worker.start().unwrap();
    worker.force_refresh();
    next_ready(&rx).await;
    wait_until("idle", || worker.state() == WorkerState::Idle).await;

    worker.stop().await;
    worker.stop().await;
    assert!(worker.is_stopped());

    // Changes after stop are ignored.
    file.write(&[issue_line("bd-1", "closed", &[])]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(worker.snapshot().unwrap().version, 1);
    assert_eq!(worker.metrics().processing_count, 1);
}

#[tokio::test]
#[serial]
async fn test_environment_overrides_reach_the_worker() {
    let _clean = unsafe { clean_worker_env() };
    let _buffer = unsafe { EnvGuard::set("BV_CHANNEL_BUFFER", "3") };
    let _debounce = unsafe { EnvGuard::set("BV_DEBOUNCE_MS", "40") };
    let _level = unsafe { EnvGuard::set("BV_WORKER_LOG_LEVEL", "off") };
    let _test = unsafe { EnvGuard::set("BV_TEST_MODE", "1") };

    let worker = BackgroundWorker::new(WorkerConfig::from_env()).unwrap();
    let config = worker.config();
    assert_eq!(config.message_buffer, 3);
    assert_eq!(config.debounce_delay, Duration::from_millis(40));
    assert!(config.test_mode);
    assert_eq!(config.log_level, beadwork::WorkerLogLevel::None);
    worker.stop().await;
}

//! Supervised background snapshot engine.
//!
//! [`BackgroundWorker`] turns change notifications from a [`Watcher`] into
//! immutable [`Snapshot`]s built off the caller's thread, and delivers them
//! through a newest-wins [`MessageReceiver`].
//!
//! At most one build runs at a time. Triggers that arrive mid-build are
//! coalesced into a single follow-up build. Unchanged content is deduplicated
//! by hash unless a refresh is forced. A watchdog restarts the change loop
//! when heartbeats stop, and gives up (stopping the worker) after too many
//! recoveries. Results computed under a superseded generation are dropped.

mod channel;
mod idle;
mod messages;
mod metrics;
mod trace;
mod watchdog;


use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use jiff::Timestamp;
use parking_lot::Mutex;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analysis::graph::GraphStats;
use crate::analysis::{IssueDiff, content_hash, hash_prefix};
use crate::config::{WorkerConfig, WorkerLogLevel};
use crate::error::{BeadworkError, Result};
use crate::loader::{IssueLoader, IssuePool, JsonlLoader, LoadOptions};
use crate::recipe::Recipe;
use crate::snapshot::{DatasetTier, Snapshot, SnapshotBuildConfig, SnapshotBuilder, large_dataset_warning};
use crate::types::Issue;
use crate::watcher::{DEFAULT_POLL_INTERVAL, FileWatcher, FilesystemType, Watcher, WatcherOptions};

pub use channel::{DeliveryChannel, MessageReceiver, delivery_channel};
pub use idle::{IdleReclaimer, PoolReclaimer};
pub use messages::{ErrorPhase, SnapshotReady, WorkerError, WorkerMessage, WorkerState};
pub use metrics::{WorkerHealth, WorkerMetrics};

use idle::IdleStats;
use trace::EventLog;
use metrics::{AtomicInstant, MetricCounters, store_duration};

/// Collaborators the worker drives. Swap any of them out in tests or when
/// embedding the worker somewhere that is not a JSONL file.
pub struct WorkerComponents {
    /// `None` makes every build a no-op.
    pub loader: Option<Arc<dyn IssueLoader>>,
    /// `None` runs without a change loop or watchdog; refreshes are manual.
    pub watcher: Option<Arc<dyn Watcher>>,
    pub reclaimer: Arc<dyn IdleReclaimer>,
    /// Pool whose hit/miss counters are reported in metrics.
    pub pool: Arc<IssuePool>,
}

impl WorkerComponents {
    /// A JSONL loader and file watcher for `config.beads_path`, sharing the
    /// process-wide issue pool.
    pub fn from_config(config: &WorkerConfig) -> Self {
        let pool = IssuePool::global();
        let (loader, watcher) = match &config.beads_path {
            Some(path) => {
                let loader: Arc<dyn IssueLoader> = Arc::new(JsonlLoader::with_pool(path, Arc::clone(&pool)));
                let watcher: Arc<dyn Watcher> = Arc::new(FileWatcher::new(
                    path,
                    WatcherOptions {
                        debounce: config.debounce_delay,
                        poll_interval: DEFAULT_POLL_INTERVAL,
                        force_poll: config.force_poll,
                    },
                ));
                (Some(loader), Some(watcher))
            }
            None => (None, None),
        };
        Self {
            loader,
            watcher,
            reclaimer: Arc::new(PoolReclaimer::new(Arc::clone(&pool))),
            pool,
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn IssueLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_watcher(mut self, watcher: Arc<dyn Watcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn with_reclaimer(mut self, reclaimer: Arc<dyn IdleReclaimer>) -> Self {
        self.reclaimer = reclaimer;
        self
    }

    pub fn with_pool(mut self, pool: Arc<IssuePool>) -> Self {
        self.pool = pool;
        self
    }
}

/// How the watcher is observing the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatcherInfo {
    pub polling: bool,
    pub fs_type: FilesystemType,
    pub poll_interval: Duration,
}

pub struct BackgroundWorker {
    inner: Arc<Inner>,
}

/// Shared between the handle and the worker's tasks.
///
/// Everything that participates in a state transition sits behind `shared`.
/// Counters that are only ever read for reporting, plus the activity and
/// change stamps the hot path touches, are atomics outside the lock.
struct Inner {
    config: WorkerConfig,
    loader: Option<Arc<dyn IssueLoader>>,
    watcher: Option<Arc<dyn Watcher>>,
    reclaimer: Arc<dyn IdleReclaimer>,
    pool: Arc<IssuePool>,

    handle: Handle,
    /// Cancelled once, on stop. Loop tokens are children of it.
    root: CancellationToken,
    log: EventLog,
    channel: DeliveryChannel,
    receiver: MessageReceiver,

    shared: Mutex<Shared>,

    pending_changes: AtomicU64,
    coalesce_count: AtomicU64,
    last_activity: AtomicInstant,
    counters: MetricCounters,
    idle: IdleStats,
}

#[derive(Default)]
struct Shared {
    state: WorkerState,
    started: bool,
    watchdog_started: bool,
    /// A trigger arrived while processing.
    dirty: bool,
    /// Skip dedup on the next build.
    force_next: bool,
    /// Bumped on every recovery; results from older generations are dropped.
    generation: u64,
    recovering: bool,
    recovery_count: u32,

    start_time: Option<Timestamp>,
    last_heartbeat: Option<Instant>,
    processing_start: Option<Instant>,

    snapshot: Option<Arc<Snapshot>>,
    last_hash: String,

    recipe: Option<Arc<Recipe>>,
    recipe_name: String,
    recipe_hash: String,

    last_error: Option<WorkerError>,
    error_count: u32,

    loop_token: Option<CancellationToken>,
    loop_task: Option<JoinHandle<()>>,
    /// Previous GC percent while our override is applied.
    gc_override: Option<u32>,
}

impl BackgroundWorker {
    /// Build a worker for `config`, with a JSONL loader and file watcher when
    /// `config.beads_path` is set. Must be called inside a tokio runtime.
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let components = WorkerComponents::from_config(&config);
        Self::with_components(config, components)
    }

    pub fn with_components(config: WorkerConfig, components: WorkerComponents) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| BeadworkError::NoRuntime(e.to_string()))?;
        let config = config.normalized();
        let epoch = Instant::now();
        let (channel, receiver) = delivery_channel(config.message_buffer);
        let log = EventLog::new(config.log_level, config.trace_path.clone());

        let inner = Inner {
            loader: components.loader,
            watcher: components.watcher,
            reclaimer: components.reclaimer,
            pool: components.pool,
            handle,
            root: CancellationToken::new(),
            log,
            channel,
            receiver,
            shared: Mutex::new(Shared::default()),
            pending_changes: AtomicU64::new(0),
            coalesce_count: AtomicU64::new(0),
            last_activity: AtomicInstant::new(epoch),
            counters: MetricCounters::new(epoch),
            idle: IdleStats::new(epoch),
            config,
        };
        inner.last_activity.store(Instant::now());

        Ok(Self { inner: Arc::new(inner) })
    }

    /// Start watching and processing. Idempotent; fails once stopped, or if
    /// the watcher cannot start (in which case `start()` may be retried).
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut shared = inner.shared.lock();
            if shared.state == WorkerState::Stopped {
                return Err(BeadworkError::WorkerStopped);
            }
            if shared.started {
                return Ok(());
            }
            shared.started = true;
            let now = Instant::now();
            shared.start_time.get_or_insert_with(Timestamp::now);
            shared.last_heartbeat = Some(now);
            inner.last_activity.store(now);
        }

        inner.log.open();
        inner.log.event(
            WorkerLogLevel::Info,
            "worker_start",
            json!({ "beads_path": inner.beads_path_display() }),
        );

        if let Some(watcher) = &inner.watcher {
            let _runtime = inner.handle.enter();
            if let Err(e) = watcher.start() {
                inner.shared.lock().started = false;
                inner.log.event(
                    WorkerLogLevel::Error,
                    "watcher_start_failed",
                    json!({ "error": e.to_string() }),
                );
                inner.log.close();
                return Err(e);
            }
        }

        inner.apply_gc_percent();
        if inner.config.idle_gc.enabled {
            inner.handle.spawn(Arc::clone(inner).idle_loop());
        }
        if inner.watcher.is_some() {
            inner.start_loop();
            inner.start_watchdog();
        }
        Ok(())
    }

    /// Stop for good. Idempotent. Waits (bounded) for the change loop.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Rebuild from the data source. Coalesced if a build is running.
    pub fn trigger_refresh(&self) {
        self.inner.trigger_refresh();
    }

    /// Rebuild and publish even if the content is unchanged.
    pub fn force_refresh(&self) {
        self.inner.force_refresh();
    }

    /// Switch the active recipe (`None` clears it). Forces a rebuild when the
    /// name or the recipe content changed.
    pub fn set_recipe(&self, recipe: Option<Recipe>) {
        let changed = {
            let mut shared = self.inner.shared.lock();
            if shared.state == WorkerState::Stopped {
                return;
            }
            let name = recipe.as_ref().map(|r| r.name.clone()).unwrap_or_default();
            let hash = recipe.as_ref().map(Recipe::fingerprint).unwrap_or_default();
            let changed = shared.recipe_name != name || shared.recipe_hash != hash;
            shared.recipe = recipe.map(Arc::new);
            shared.recipe_name = name;
            shared.recipe_hash = hash;
            changed
        };
        if changed {
            self.inner.force_refresh();
        }
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.shared.lock().snapshot.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.inner.shared.lock().state
    }

    pub fn messages(&self) -> MessageReceiver {
        self.inner.receiver.clone()
    }

    /// Resolves once the worker has stopped.
    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.root.clone().cancelled_owned()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// The most recent failure, cleared by the next successful cycle.
    pub fn last_error(&self) -> Option<WorkerError> {
        self.inner.shared.lock().last_error.clone()
    }

    /// Content hash of the last build (empty before the first one, or after a
    /// forced refresh).
    pub fn last_hash(&self) -> String {
        self.inner.shared.lock().last_hash.clone()
    }

    /// Forget the last content hash so the next build is not deduplicated.
    pub fn reset_hash(&self) {
        self.inner.shared.lock().last_hash.clear();
    }

    /// How long the current build has been running; zero when not processing.
    pub fn processing_duration(&self) -> Duration {
        let shared = self.inner.shared.lock();
        match (shared.state, shared.processing_start) {
            (WorkerState::Processing, Some(start)) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Let the consumer report how long it took to apply an update.
    pub fn record_ui_update_latency(&self, latency: Duration) {
        store_duration(&self.inner.counters.ui_update_ns, latency);
        self.inner.log.event(
            WorkerLogLevel::Debug,
            "ui_update_latency",
            json!({ "latency_ms": millis(latency) }),
        );
    }

    pub fn watcher_info(&self) -> WatcherInfo {
        match &self.inner.watcher {
            Some(w) => WatcherInfo {
                polling: w.is_polling(),
                fs_type: w.filesystem_type(),
                poll_interval: w.poll_interval(),
            },
            None => WatcherInfo::default(),
        }
    }

    /// The watcher's change counter, for consumers that want raw notifications.
    pub fn watcher_changes(&self) -> Option<watch::Receiver<u64>> {
        self.inner.watcher.as_ref().map(|w| w.subscribe())
    }

    pub fn metrics(&self) -> WorkerMetrics {
        self.inner.counters.snapshot()
    }

    pub fn health(&self) -> WorkerHealth {
        let inner = &self.inner;
        let (started, state, last_heartbeat, recovery_count, uptime_since) = {
            let shared = inner.shared.lock();
            (
                shared.started,
                shared.state,
                shared.last_heartbeat,
                shared.recovery_count,
                shared.start_time,
            )
        };
        let alive = started
            && state != WorkerState::Stopped
            && last_heartbeat.is_some_and(|hb| hb.elapsed() <= inner.config.heartbeat_timeout);

        WorkerHealth {
            started,
            alive,
            last_heartbeat,
            recovery_count,
            uptime_since,
            idle_gc_enabled: inner.config.idle_gc.enabled,
            idle_gc_count: inner.idle.count(),
            idle_gc_total: inner.idle.total(),
            idle_gc_last_duration: inner.idle.last_duration(),
            idle_gc_last_at: inner.idle.last_at(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        if self.inner.shutdown().is_some() {
            self.inner.log.event(WorkerLogLevel::Info, "worker_stop", json!({}));
            self.inner.log.close();
        }
    }
}

impl Inner {
    fn beads_path_display(&self) -> String {
        self.loader
            .as_ref()
            .and_then(|l| l.source_path())
            .or(self.config.beads_path.as_deref())
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    fn send(&self, msg: WorkerMessage) {
        if let Some(evicted) = self.channel.send(msg) {
            self.log.event(
                WorkerLogLevel::Debug,
                "message_dropped",
                json!({ "kind": evicted.kind(), "dropped": self.channel.dropped() }),
            );
        }
    }

    fn apply_gc_percent(&self) {
        let gc = &self.config.idle_gc;
        if !gc.enabled || gc.gc_percent == 0 || self.config.test_mode {
            return;
        }
        let mut shared = self.shared.lock();
        if shared.state == WorkerState::Stopped || !shared.started || shared.gc_override.is_some() {
            return;
        }
        shared.gc_override = Some(self.reclaimer.set_gc_percent(gc.gc_percent));
    }

    /// Spawn a fresh change loop under a new child token.
    fn start_loop(self: &Arc<Self>) {
        let Some(watcher) = &self.watcher else {
            return;
        };
        let mut shared = self.shared.lock();
        if shared.state == WorkerState::Stopped {
            return;
        }
        let token = self.root.child_token();
        let changes = watcher.subscribe();
        let task = self
            .handle
            .spawn(Arc::clone(self).process_loop(changes, token.clone()));
        shared.last_heartbeat = Some(Instant::now());
        shared.loop_token = Some(token);
        shared.loop_task = Some(task);
    }

    fn start_watchdog(self: &Arc<Self>) {
        {
            let mut shared = self.shared.lock();
            if shared.watchdog_started || shared.state == WorkerState::Stopped {
                return;
            }
            shared.watchdog_started = true;
        }
        self.handle.spawn(Arc::clone(self).watchdog_loop());
    }

    async fn process_loop(self: Arc<Self>, mut changes: watch::Receiver<u64>, cancel: CancellationToken) {
        let mut seen = *changes.borrow_and_update();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = heartbeat.tick() => self.record_heartbeat(Instant::now()),
                changed = changes.changed() => {
                    if changed.is_err() {
                        self.log.event(WorkerLogLevel::Warn, "watcher_closed", json!({}));
                        return;
                    }
                    let current = *changes.borrow_and_update();
                    let burst = current.wrapping_sub(seen).max(1);
                    seen = current;
                    self.note_file_change(Instant::now(), burst);
                    self.trigger_refresh();
                }
            }
        }
    }

    fn record_heartbeat(&self, at: Instant) {
        self.shared.lock().last_heartbeat = Some(at);
    }

    fn note_file_change(&self, at: Instant, changes: u64) {
        self.counters.last_file_change.store(at);
        let depth = self.pending_changes.fetch_add(changes, Ordering::SeqCst) + changes;
        self.log.event(WorkerLogLevel::Trace, "file_change", json!({ "queue_depth": depth }));
    }

    fn record_activity(&self) {
        self.last_activity.store(Instant::now());
    }

    fn trigger_refresh(self: &Arc<Self>) {
        {
            let mut shared = self.shared.lock();
            let state = shared.state;
            match state {
                WorkerState::Stopped => return,
                WorkerState::Processing => {
                    shared.dirty = true;
                    drop(shared);
                    self.note_coalesced();
                    return;
                }
                WorkerState::Idle => {}
            }
        }
        self.spawn_process();
    }

    fn force_refresh(self: &Arc<Self>) {
        {
            let mut shared = self.shared.lock();
            if shared.state == WorkerState::Stopped {
                return;
            }
            shared.last_hash.clear();
            shared.force_next = true;
            if shared.state == WorkerState::Processing {
                shared.dirty = true;
                drop(shared);
                self.note_coalesced();
                return;
            }
        }
        self.spawn_process();
    }

    fn note_coalesced(&self) {
        let count = self.coalesce_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.event(WorkerLogLevel::Debug, "coalesce", json!({ "count": count }));
    }

    fn spawn_process(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.handle.spawn_blocking(move || inner.process());
    }

    /// One build cycle. Runs on a blocking thread.
    fn process(self: &Arc<Self>) {
        let generation = {
            let mut shared = self.shared.lock();
            let state = shared.state;
            match state {
                WorkerState::Idle => {}
                WorkerState::Processing => {
                    shared.dirty = true;
                    drop(shared);
                    self.note_coalesced();
                    return;
                }
                WorkerState::Stopped => return,
            }
            let now = Instant::now();
            shared.state = WorkerState::Processing;
            shared.dirty = false;
            self.coalesce_count.store(0, Ordering::SeqCst);
            shared.processing_start = Some(now);
            shared.last_heartbeat = Some(now);
            shared.generation
        };
        self.log.event(WorkerLogLevel::Debug, "state_change", json!({ "state": "processing" }));

        let started = Instant::now();
        let queue_depth = self.pending_changes.swap(0, Ordering::SeqCst);
        self.counters.queue_depth.store(queue_depth, Ordering::Relaxed);
        self.log.event(
            WorkerLogLevel::Info,
            "process_start",
            json!({ "queue_depth": queue_depth }),
        );

        let built = self.build_snapshot(generation);

        let mut shared = self.shared.lock();
        if shared.generation != generation || shared.state == WorkerState::Stopped {
            let stale_generation = shared.generation != generation;
            drop(shared);
            if built.is_some() {
                self.log.event(
                    WorkerLogLevel::Debug,
                    "snapshot_discarded",
                    json!({ "stale_generation": stale_generation }),
                );
            }
            // Dropping the build returns its issues to the pool.
            drop(built);
            return;
        }

        shared.processing_start = None;
        let mut swap_latency = Duration::ZERO;
        let mut superseded = None;
        let published = built.map(|mut snapshot| {
            snapshot.version = self.counters.snapshot_version.fetch_add(1, Ordering::AcqRel) + 1;
            let snapshot = Arc::new(snapshot);
            let swap_start = Instant::now();
            superseded = shared.snapshot.replace(Arc::clone(&snapshot));
            swap_latency = swap_start.elapsed();
            if snapshot.incremental_list_used {
                self.counters.incremental_lists.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.full_lists.fetch_add(1, Ordering::Relaxed);
            }
            snapshot
        });
        let was_dirty = shared.dirty;
        let coalesced = self.coalesce_count.load(Ordering::SeqCst);
        shared.state = WorkerState::Idle;
        shared.last_heartbeat = Some(Instant::now());
        drop(shared);
        drop(superseded);
        self.log.event(WorkerLogLevel::Debug, "state_change", json!({ "state": "idle" }));

        let elapsed = started.elapsed();
        self.counters.processing_count.fetch_add(1, Ordering::Relaxed);
        store_duration(&self.counters.processing_ns, elapsed);
        if !swap_latency.is_zero() {
            store_duration(&self.counters.swap_ns, swap_latency);
        }
        self.counters.coalesce_count.store(coalesced, Ordering::Relaxed);
        self.record_activity();

        if let Some(snapshot) = published {
            let sent_at = Instant::now();
            self.counters.last_snapshot_ready.store(sent_at);
            self.log.event(
                WorkerLogLevel::Info,
                "snapshot_ready",
                json!({
                    "issues": snapshot.len(),
                    "hash": hash_prefix(&snapshot.data_hash),
                    "version": snapshot.version,
                    "swap_us": swap_latency.as_micros() as u64,
                    "process_ms": millis(elapsed),
                    "coalesced": coalesced,
                    "queue_depth": queue_depth,
                }),
            );
            let pending_phase2 = (!snapshot.phase2_ready()).then(|| Arc::clone(&snapshot));
            self.send(WorkerMessage::SnapshotReady(SnapshotReady {
                file_change_at: self.counters.last_file_change.load(),
                sent_at,
                version: snapshot.version,
                queue_depth,
                coalesce_count: coalesced,
                snapshot,
            }));
            // Phase2Ready must never overtake the snapshot it belongs to.
            if let Some(snapshot) = pending_phase2 {
                self.spawn_phase2_waiter(generation, &snapshot);
            }
        }

        if was_dirty {
            self.spawn_process();
        }
    }

    /// Load, dedup, diff and build. `None` means nothing to publish: no data
    /// source, a failure (already reported), unchanged content, or a build
    /// orphaned by recovery. Orphaned builds leave the dedup state alone.
    fn build_snapshot(&self, generation: u64) -> Option<Snapshot> {
        let loader = self.loader.as_ref()?;
        let started = Instant::now();
        let metrics_enabled = self.config.metrics_enabled;
        let reclaim_before = self.idle.total();

        // The force flag is taken with the recipe it was raised for. A
        // set_recipe() landing mid-build leaves its flag for the follow-up.
        let (recipe, recipe_name, recipe_hash, forced) = {
            let mut shared = self.shared.lock();
            (
                shared.recipe.clone(),
                shared.recipe_name.clone(),
                shared.recipe_hash.clone(),
                std::mem::take(&mut shared.force_next),
            )
        };

        let (source_hint, tier) = match safe_compute(ErrorPhase::Load, || loader.count_records()) {
            Ok(n) => (n, DatasetTier::for_count(n)),
            Err(e) => {
                self.log.event(
                    WorkerLogLevel::Debug,
                    "snapshot_line_count_failed",
                    json!({ "path": self.beads_path_display(), "error": e.to_string() }),
                );
                (0, DatasetTier::Unknown)
            }
        };
        let open_only =
            tier == DatasetTier::Huge && !recipe.as_deref().is_some_and(Recipe::includes_closed_statuses);

        let warnings = Mutex::new(Vec::<String>::new());
        let on_warning = |msg: &str| warnings.lock().push(msg.to_string());
        let not_closed = |issue: &Issue| !issue.status.is_closed_like();
        let opts = LoadOptions {
            max_line_size: self.config.max_line_size,
            filter: open_only.then_some(&not_closed as &(dyn Fn(&Issue) -> bool + Sync)),
            on_warning: Some(&on_warning as &(dyn Fn(&str) + Sync)),
            capacity_hint: source_hint,
        };

        let issues = match safe_compute(ErrorPhase::Load, || loader.load(&opts)) {
            Ok(issues) => issues,
            Err(e) => {
                self.log.event(
                    WorkerLogLevel::Error,
                    "snapshot_load_failed",
                    json!({ "path": self.beads_path_display(), "error": e.to_string() }),
                );
                self.restore_force(forced);
                self.report_error(e);
                return None;
            }
        };
        let load_duration = started.elapsed();
        let warnings = warnings.into_inner();
        if let Some(first) = warnings.first() {
            self.log.event(
                WorkerLogLevel::Warn,
                "load_warnings",
                json!({ "count": warnings.len(), "first": first }),
            );
        }

        let hash = content_hash(&issues);
        let last_hash = {
            let mut shared = self.shared.lock();
            if shared.generation != generation {
                shared.force_next |= forced;
                return None;
            }
            if forced {
                shared.last_hash.clear();
            }
            shared.last_hash.clone()
        };
        if !forced && !last_hash.is_empty() && hash == last_hash {
            self.log.event(
                WorkerLogLevel::Debug,
                "snapshot_deduped",
                json!({ "hash": hash_prefix(&hash) }),
            );
            drop(issues);
            self.record_error(None);
            return None;
        }

        let previous = self.shared.lock().snapshot.clone();
        let diff = previous.as_deref().map(|prev| {
            let diff = IssueDiff::compute(prev.issues(), &issues);
            if self.log.enabled(WorkerLogLevel::Debug) {
                self.log.event(
                    WorkerLogLevel::Debug,
                    "snapshot_diff",
                    json!({
                        "added": diff.added.len(),
                        "removed": diff.removed.len(),
                        "modified": diff.modified.len(),
                        "content_changed": diff.content_changed.len(),
                        "dependency_changed": diff.dependency_changed.len(),
                        "unchanged": diff.unchanged.len(),
                        "total_prev": prev.len(),
                        "total_new": issues.len(),
                    }),
                );
            }
            diff
        });

        let issue_count = issues.len();
        let phase1_start = Instant::now();
        let built = safe_compute(ErrorPhase::AnalyzePhase1, || {
            let mut builder = SnapshotBuilder::new(issues)
                .with_recipe(recipe.as_deref())
                .with_build_config(SnapshotBuildConfig::for_tier(tier));
            if let (Some(prev), Some(diff)) = (previous.as_deref(), diff) {
                builder = builder.with_previous_snapshot(prev, diff);
            }
            Ok(builder.build())
        });
        let phase1_duration = phase1_start.elapsed();
        drop(previous);
        if metrics_enabled {
            store_duration(&self.counters.phase1_ns, phase1_duration);
        }

        let mut snapshot = match built {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.log.event(
                    WorkerLogLevel::Error,
                    "snapshot_analyze_failed",
                    json!({ "error": e.to_string() }),
                );
                self.report_error(e);
                return None;
            }
        };

        {
            let mut shared = self.shared.lock();
            if shared.generation != generation {
                shared.force_next |= forced;
                return None;
            }
            shared.last_hash = hash.clone();
        }
        self.record_error(None);

        snapshot.data_hash = hash;
        snapshot.load_warning_count = warnings.len();
        snapshot.recipe_name = recipe_name;
        snapshot.recipe_hash = recipe_hash;
        snapshot.tier = tier;
        snapshot.source_issue_count_hint = source_hint;
        snapshot.loaded_open_only = open_only;
        if open_only && source_hint > snapshot.len() {
            snapshot.truncated_count = source_hint - snapshot.len();
        }
        snapshot.large_dataset_warning = large_dataset_warning(tier, source_hint, snapshot.len(), open_only);

        let mut fields = json!({
            "issues": issue_count,
            "load_ms": millis(load_duration),
            "phase1_ms": millis(phase1_duration),
            "total_ms": millis(started.elapsed()),
            "hash": hash_prefix(&snapshot.data_hash),
        });
        if metrics_enabled {
            let pool = self.pool.stats();
            let bytes = snapshot.estimated_bytes();
            let reclaim_delta = self.idle.total().saturating_sub(reclaim_before);
            self.counters.snapshot_size_bytes.store(bytes, Ordering::Relaxed);
            self.counters.pool_hits.store(pool.hits, Ordering::Relaxed);
            self.counters.pool_misses.store(pool.misses, Ordering::Relaxed);
            store_duration(&self.counters.gc_pause_ns, reclaim_delta);
            fields["snapshot_bytes"] = json!(bytes);
            fields["pool_hits"] = json!(pool.hits);
            fields["pool_misses"] = json!(pool.misses);
            fields["gc_pause_ms"] = json!(millis(reclaim_delta));
        }
        self.log.event(WorkerLogLevel::Info, "snapshot_built", fields);

        Some(snapshot)
    }

    /// Hand an unused force flag back to the next build.
    fn restore_force(&self, forced: bool) {
        if forced {
            self.shared.lock().force_next = true;
        }
    }

    /// Record a build failure and tell the consumer it is worth retrying.
    fn report_error(&self, error: WorkerError) {
        if let Some(error) = self.record_error(Some(error)) {
            self.send(WorkerMessage::SnapshotError {
                error,
                recoverable: true,
            });
        }
    }

    /// Replace the last error. A failure bumps the consecutive-failure count
    /// (returned stamped into the error); `None` resets it.
    fn record_error(&self, error: Option<WorkerError>) -> Option<WorkerError> {
        let mut shared = self.shared.lock();
        match error {
            Some(mut error) => {
                shared.error_count += 1;
                error.retries = shared.error_count;
                shared.last_error = Some(error.clone());
                Some(error)
            }
            None => {
                shared.error_count = 0;
                shared.last_error = None;
                None
            }
        }
    }

    /// Emit `Phase2Ready` once the snapshot's background analysis finishes,
    /// unless the snapshot has been superseded by then.
    fn spawn_phase2_waiter(self: &Arc<Self>, generation: u64, snapshot: &Arc<Snapshot>) {
        let inner = Arc::clone(self);
        let analysis = Arc::clone(snapshot.analysis());
        let data_hash = snapshot.data_hash.clone();
        let cancel = self.root.clone();
        self.handle.spawn(async move {
            let waiting = Instant::now();
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = analysis.wait_for_phase2() => {
                    inner.finish_phase2(generation, &analysis, data_hash, waiting.elapsed());
                }
            }
        });
    }

    fn finish_phase2(&self, generation: u64, analysis: &Arc<GraphStats>, data_hash: String, waited: Duration) {
        if self.config.metrics_enabled {
            store_duration(&self.counters.phase2_ns, waited);
        }
        let current = {
            let shared = self.shared.lock();
            shared.state != WorkerState::Stopped
                && shared.generation == generation
                && shared
                    .snapshot
                    .as_ref()
                    .is_some_and(|s| Arc::ptr_eq(s.analysis(), analysis) && s.data_hash == data_hash)
        };
        if !current {
            self.log.event(
                WorkerLogLevel::Debug,
                "phase2_skip",
                json!({ "hash": hash_prefix(&data_hash) }),
            );
            return;
        }
        self.log.event(
            WorkerLogLevel::Info,
            "phase2_complete",
            json!({ "hash": hash_prefix(&data_hash), "phase2_ms": millis(waited) }),
        );
        self.send(WorkerMessage::Phase2Ready { data_hash });
    }

    /// The synchronous half of stopping. Returns `None` if already stopped,
    /// otherwise whether the worker had been started and the change loop to
    /// wait for.
    fn shutdown(&self) -> Option<(bool, Option<JoinHandle<()>>)> {
        let (was_started, loop_token, loop_task, restore) = {
            let mut shared = self.shared.lock();
            if shared.state == WorkerState::Stopped {
                return None;
            }
            shared.state = WorkerState::Stopped;
            (
                shared.started,
                shared.loop_token.take(),
                shared.loop_task.take(),
                shared.gc_override.take(),
            )
        };

        if let Some(previous) = restore {
            self.reclaimer.set_gc_percent(previous);
        }
        if let Some(token) = loop_token {
            token.cancel();
        }
        self.root.cancel();
        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        self.channel.close();
        Some((was_started, loop_task))
    }

    async fn stop(&self) {
        let Some((was_started, loop_task)) = self.shutdown() else {
            return;
        };
        if was_started {
            if let Some(task) = loop_task {
                if tokio::time::timeout(self.config.stop_timeout, task).await.is_err() {
                    self.log.event(WorkerLogLevel::Warn, "shutdown_timeout", json!({}));
                }
            }
        }
        self.log.event(WorkerLogLevel::Info, "worker_stop", json!({}));
        self.log.close();
    }
}

/// Run `f`, turning both errors and panics into a [`WorkerError`] for `phase`.
fn safe_compute<T>(phase: ErrorPhase, f: impl FnOnce() -> Result<T>) -> std::result::Result<T, WorkerError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(WorkerError::new(phase, e.to_string())),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(WorkerError::new(phase, format!("panic: {msg}")))
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_micros() as f64 / 1000.0
}

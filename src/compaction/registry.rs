// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Candidate registry: the score-ordered set of tablets plus the
//! per-disk/per-level running-task quotas (§4.B).
//!
//! Grounded on `compaction_manager.h`/`.cpp` (original_source): the same
//! mutex-guarded ordered set, the same `update_candidate`/`pick_candidate`/
//! `register_task`/`unregister_task` method set, the same lazily-started
//! background log thread.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use lazy_static::lazy_static;
use log::{info, warn};

use crate::{
    compaction::task::CompactionTask,
    config::SharedConfig,
    metrics::CompactionMetrics,
    tablet::TabletHandle,
};

/// `score * 100` rounded to the nearest integer, per §4.B: prevents
/// floating-point comparator instability in the ordered set.
fn quantize_score(score: f64) -> i64 {
    (score * 100.0).round() as i64
}

struct CandidateEntry {
    quantized_score: i64,
    tablet_id: u64,
    tablet: Arc<dyn TabletHandle>,
}

impl PartialEq for CandidateEntry {
    fn eq(&self, other: &Self) -> bool {
        self.quantized_score == other.quantized_score && self.tablet_id == other.tablet_id
    }
}
impl Eq for CandidateEntry {}

impl PartialOrd for CandidateEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CandidateEntry {
    /// Higher score first, then lower tablet id: matches
    /// `TabletCompactionComparator` in the reference engine.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .quantized_score
            .cmp(&self.quantized_score)
            .then(self.tablet_id.cmp(&other.tablet_id))
    }
}

#[derive(Default)]
struct CandidatesState {
    set: BTreeSet<CandidateEntry>,
    // tablet_id -> quantized score currently stored in `set`, needed to
    // erase the correct node since BTreeSet removal requires the original
    // sort key, not the tablet's (possibly since-changed) live score.
    index: HashMap<u64, i64>,
}

impl CandidatesState {
    fn remove_existing(&mut self, tablet_id: u64) -> bool {
        if let Some(score) = self.index.remove(&tablet_id) {
            // `BTreeSet::remove` needs a `&Q: Ord` matching the stored key;
            // `Ord`/`Eq` above only look at `quantized_score`/`tablet_id`, so
            // scan for the matching entry and clone just enough of it
            // (including its tablet `Arc`, cheap to bump) to build that key.
            let found = self
                .set
                .iter()
                .find(|e| e.tablet_id == tablet_id && e.quantized_score == score)
                .map(|e| CandidateEntry {
                    quantized_score: e.quantized_score,
                    tablet_id: e.tablet_id,
                    tablet: e.tablet.clone(),
                });
            if let Some(entry) = found {
                self.set.remove(&entry);
                return true;
            }
        }
        false
    }

    fn insert(&mut self, tablet: Arc<dyn TabletHandle>) -> bool {
        let tablet_id = tablet.id();
        let had_prior = self.remove_existing(tablet_id);
        let score = quantize_score(tablet.compaction_score());
        self.index.insert(tablet_id, score);
        self.set.insert(CandidateEntry {
            quantized_score: score,
            tablet_id,
            tablet,
        });
        !had_prior
    }

    fn pick(&mut self) -> Option<Arc<dyn TabletHandle>> {
        let entry = self.set.iter().next()?;
        let tablet_id = entry.tablet_id;
        let tablet = entry.tablet.clone();
        self.set.remove(&CandidateEntry {
            quantized_score: entry.quantized_score,
            tablet_id,
            tablet: tablet.clone(),
        });
        self.index.remove(&tablet_id);
        Some(tablet)
    }

    fn len(&self) -> usize {
        self.set.len()
    }
}

/// A scheduler's condition variable, registered with the registry so
/// `update_candidate` can wake every scheduler on a first-insertion event
/// (§4.B Notification).
#[derive(Default)]
pub struct SchedulerWaker {
    lock: Mutex<()>,
    cv: Condvar,
}

impl SchedulerWaker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notify(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cv.notify_all();
    }

    /// Block until notified or `timeout` elapses, whichever comes first.
    /// Schedulers always pass a short timeout (1s) so they re-check
    /// hot-reloaded config even if a notification was missed (§4.C).
    pub fn wait_timeout(&self, timeout: Duration) {
        let guard = self.lock.lock().unwrap();
        let _ = self.cv.wait_timeout(guard, timeout);
    }
}

#[derive(Default)]
struct TaskCounters {
    running_ids: std::collections::HashSet<u64>,
    per_disk: HashMap<String, u32>,
    per_level: HashMap<u8, u32>,
    running_num: u32,
}

/// Score-ordered set of tablets plus quota counters; mediates all
/// compaction across all tablets on the node (§4.B, §9).
pub struct CandidateRegistry {
    candidates: Mutex<CandidatesState>,
    tasks: Mutex<TaskCounters>,
    next_task_id: AtomicU64,
    schedulers: Mutex<Vec<Arc<SchedulerWaker>>>,
    known_disks: Mutex<HashSet<String>>,
    config: Arc<SharedConfig>,
    metrics: Arc<CompactionMetrics>,
    async_sender: crossbeam_channel::Sender<AsyncMsg>,
    async_worker: Mutex<Option<JoinHandle<()>>>,
    log_thread: Mutex<Option<JoinHandle<()>>>,
    log_thread_started: AtomicBool,
    stop_log: Arc<AtomicBool>,
}

enum AsyncMsg {
    Update(Arc<dyn TabletHandle>),
    Shutdown,
}

/// Bounded capacity of the single-worker async-update queue (§4.B).
pub const ASYNC_QUEUE_CAPACITY: usize = 100_000;

impl CandidateRegistry {
    pub fn new(config: Arc<SharedConfig>, metrics: Arc<CompactionMetrics>) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<AsyncMsg>(ASYNC_QUEUE_CAPACITY);
        let registry = Arc::new(Self {
            candidates: Mutex::new(CandidatesState::default()),
            tasks: Mutex::new(TaskCounters::default()),
            next_task_id: AtomicU64::new(1),
            schedulers: Mutex::new(Vec::new()),
            known_disks: Mutex::new(HashSet::new()),
            config,
            metrics,
            async_sender: tx,
            async_worker: Mutex::new(None),
            log_thread: Mutex::new(None),
            log_thread_started: AtomicBool::new(false),
            stop_log: Arc::new(AtomicBool::new(false)),
        });

        let worker_registry = registry.clone();
        let handle = thread::Builder::new()
            .name("compaction-update-candidates".into())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        AsyncMsg::Update(tablet) => {
                            worker_registry.update_candidate(tablet);
                        }
                        AsyncMsg::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn compaction candidate-update worker");
        *registry.async_worker.lock().unwrap() = Some(handle);

        registry
    }

    pub fn candidates_size(&self) -> usize {
        self.candidates.lock().unwrap().len()
    }

    pub fn register_scheduler(&self, waker: Arc<SchedulerWaker>) {
        self.schedulers.lock().unwrap().push(waker);
    }

    pub fn unregister_scheduler(&self, waker: &Arc<SchedulerWaker>) {
        self.schedulers
            .lock()
            .unwrap()
            .retain(|w| !Arc::ptr_eq(w, waker));
    }

    fn notify_schedulers(&self) {
        let schedulers = self.schedulers.lock().unwrap();
        for waker in schedulers.iter() {
            waker.notify();
        }
    }

    fn record_disk(&self, path: &str) {
        let mut disks = self.known_disks.lock().unwrap();
        if !disks.contains(path) {
            disks.insert(path.to_string());
        }
    }

    /// Distinct data directories this registry has ever seen a candidate or
    /// task on; the scheduler's `store_num` term in
    /// `min(max_compaction_task_num, store_num * max_compaction_task_per_disk)`
    /// (§4.C), standing in for the reference engine's
    /// `StorageEngine::get_store_num()` since this crate has no storage
    /// engine bootstrap to ask directly.
    pub fn known_store_count(&self) -> usize {
        self.known_disks.lock().unwrap().len()
    }

    /// Synchronously reinsert `tablet`. Returns `true` if this was a
    /// first-insertion-this-round (no prior entry erased), in which case
    /// all registered schedulers are notified.
    pub fn update_candidate(&self, tablet: Arc<dyn TabletHandle>) -> bool {
        self.record_disk(tablet.data_dir().path());
        let first_insertion = {
            let mut state = self.candidates.lock().unwrap();
            state.insert(tablet)
        };
        if first_insertion {
            self.notify_schedulers();
        }
        first_insertion
    }

    /// Enqueue an update onto the single-worker bounded queue. Drops with a
    /// warning (and a metric bump) if the queue is full — the next
    /// synchronous mutation of the tablet will re-register it (§4.B).
    pub fn update_candidate_async(&self, tablet: Arc<dyn TabletHandle>) {
        if self.async_sender.try_send(AsyncMsg::Update(tablet)).is_err() {
            self.metrics.record_async_update_dropped();
            warn!(
                "update candidate failed for queue is full, capacity:{}",
                ASYNC_QUEUE_CAPACITY
            );
        }
    }

    /// Bulk reinsert without notification, used by the scheduler to return
    /// deferred tablets at the end of a scan (§4.B, §4.C).
    pub fn insert_candidates(&self, tablets: Vec<Arc<dyn TabletHandle>>) {
        let mut state = self.candidates.lock().unwrap();
        for tablet in tablets {
            self.record_disk(tablet.data_dir().path());
            state.insert(tablet);
        }
    }

    pub fn pick_candidate(&self) -> Option<Arc<dyn TabletHandle>> {
        self.candidates.lock().unwrap().pick()
    }

    pub fn next_compaction_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::SeqCst)
    }

    fn ensure_log_thread_started(&self) {
        if self
            .log_thread_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let stop = self.stop_log.clone();
            let handle = thread::Builder::new()
                .name("compaction-log".into())
                .spawn(move || {
                    info!("start compaction manager log printer");
                    while !stop.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_secs(2));
                    }
                })
                .expect("failed to spawn compaction log thread");
            *self.log_thread.lock().unwrap() = Some(handle);
        }
    }

    /// Atomically check all quotas and, if every one admits, register the
    /// task. All checks and the insertion happen under one mutex so the
    /// decision is atomic (§4.A).
    pub fn register_task(&self, task: &Arc<CompactionTask>) -> bool {
        self.ensure_log_thread_started();

        let config = self.config.load();
        let level = task.compaction_level();
        let disk_path = task.tablet().data_dir().path().to_string();
        self.record_disk(&disk_path);

        let mut counters = self.tasks.lock().unwrap();
        if !config.max_compaction_task_num().admits(counters.running_num) {
            warn!(
                "register compaction task failed for running tasks reach max limit:{}",
                task.task_id()
            );
            return false;
        }
        let level_count = *counters.per_level.get(&level.as_index()).unwrap_or(&0);
        if !config.level_limit(level).admits(level_count) {
            warn!(
                "register compaction task failed for level {} limit, task:{}",
                level,
                task.task_id()
            );
            return false;
        }
        let disk_count = *counters.per_disk.get(&disk_path).unwrap_or(&0);
        if !config.max_compaction_task_per_disk().admits(disk_count) {
            warn!(
                "register compaction task failed for disk's running tasks reach limit, disk:{}",
                disk_path
            );
            return false;
        }
        if !counters.running_ids.insert(task.task_id()) {
            warn!("duplicate task, compaction_task:{}", task.task_id());
            return false;
        }

        *counters.per_level.entry(level.as_index()).or_insert(0) += 1;
        *counters.per_disk.entry(disk_path).or_insert(0) += 1;
        counters.running_num += 1;
        drop(counters);

        self.metrics.record_task_registered();
        info!(
            "registered compaction task:{}, tablet:{}, level:{}",
            task.task_id(),
            task.tablet().id(),
            level
        );
        true
    }

    pub fn unregister_task(&self, task: &Arc<CompactionTask>) {
        let mut counters = self.tasks.lock().unwrap();
        if counters.running_ids.remove(&task.task_id()) {
            let level = task.compaction_level();
            let disk_path = task.tablet().data_dir().path().to_string();
            if let Some(count) = counters.per_level.get_mut(&level.as_index()) {
                *count = count.saturating_sub(1);
            }
            if let Some(count) = counters.per_disk.get_mut(&disk_path) {
                *count = count.saturating_sub(1);
            }
            counters.running_num = counters.running_num.saturating_sub(1);
            drop(counters);
            self.metrics.record_task_unregistered();
            info!(
                "unregister compaction task:{}, tablet:{}",
                task.task_id(),
                task.tablet().id()
            );
        }
    }

    pub fn running_tasks_num(&self) -> u32 {
        self.tasks.lock().unwrap().running_num
    }

    pub fn running_tasks_num_for_disk(&self, disk_path: &str) -> u32 {
        *self
            .tasks
            .lock()
            .unwrap()
            .per_disk
            .get(disk_path)
            .unwrap_or(&0)
    }

    pub fn running_tasks_num_for_level(&self, level: crate::tablet::CompactionLevel) -> u32 {
        *self
            .tasks
            .lock()
            .unwrap()
            .per_level
            .get(&level.as_index())
            .unwrap_or(&0)
    }

    pub fn config(&self) -> &Arc<SharedConfig> {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<CompactionMetrics> {
        &self.metrics
    }

    /// Flush the async update queue and join the background worker threads.
    /// Idempotent; safe to call multiple times.
    pub fn shutdown(&self) {
        self.stop_log.store(true, Ordering::Relaxed);
        let _ = self.async_sender.send(AsyncMsg::Shutdown);
        if let Some(handle) = self.async_worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.log_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

lazy_static! {
    static ref REGISTRY_SINGLETON: Arc<CandidateRegistry> = CandidateRegistry::new(
        Arc::new(SharedConfig::default()),
        Arc::new(CompactionMetrics::default())
    );
}

/// Process-wide singleton accessor (§4.B, §9). Prefer constructing and
/// injecting a `CandidateRegistry::new(..)` explicitly (e.g. in tests);
/// this exists for embedders that genuinely want one process-global
/// instance, the same tradeoff the reference engine's `CompactionManager`
/// singleton makes.
pub fn instance() -> Arc<CandidateRegistry> {
    REGISTRY_SINGLETON.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablet::{FakeDataDir, FakeTablet};

    fn registry() -> Arc<CandidateRegistry> {
        CandidateRegistry::new(
            Arc::new(SharedConfig::default()),
            Arc::new(CompactionMetrics::default()),
        )
    }

    #[test]
    fn urgency_ordering_matches_scenario_1() {
        let reg = registry();
        let dir = FakeDataDir::new("/data0");
        let scores = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 10.0];
        let mut tablets = Vec::new();
        for (id, score) in scores.iter().enumerate() {
            let tablet = FakeTablet::new(id as u64, dir.clone());
            tablet.set_score(*score);
            tablets.push(tablet.clone());
            reg.update_candidate(tablet);
        }

        let order: Vec<u64> = std::iter::from_fn(|| reg.pick_candidate())
            .map(|t| t.id())
            .collect();

        let expected: Vec<u64> = vec![9, 10, 8, 7, 6, 5, 4, 3, 2, 1, 0];
        assert_eq!(order, expected);
        reg.shutdown();
    }

    #[test]
    fn update_candidate_is_idempotent() {
        let reg = registry();
        let dir = FakeDataDir::new("/data0");
        let tablet = FakeTablet::new(1, dir);
        tablet.set_score(5.0);

        assert!(reg.update_candidate(tablet.clone()));
        assert!(!reg.update_candidate(tablet.clone()));
        assert!(!reg.update_candidate(tablet.clone()));
        assert_eq!(reg.candidates_size(), 1);

        let picked = reg.pick_candidate().unwrap();
        assert_eq!(picked.id(), 1);
        assert!(reg.pick_candidate().is_none());
        reg.shutdown();
    }

    #[test]
    fn known_store_count_tracks_distinct_disks() {
        let reg = registry();
        assert_eq!(reg.known_store_count(), 0);

        let dir0 = FakeDataDir::new("/data0");
        let dir1 = FakeDataDir::new("/data1");
        reg.update_candidate(FakeTablet::new(1, dir0.clone()));
        reg.update_candidate(FakeTablet::new(2, dir1));
        reg.update_candidate(FakeTablet::new(3, dir0));

        assert_eq!(reg.known_store_count(), 2);
        reg.shutdown();
    }

    #[test]
    fn pick_candidate_on_empty_registry_is_none() {
        let reg = registry();
        assert!(reg.pick_candidate().is_none());
        reg.shutdown();
    }

    #[test]
    fn insert_candidates_does_not_notify() {
        let reg = registry();
        let waker = SchedulerWaker::new();
        reg.register_scheduler(waker.clone());

        let dir = FakeDataDir::new("/data0");
        let tablet = FakeTablet::new(1, dir);
        tablet.set_score(1.0);
        reg.insert_candidates(vec![tablet]);

        // No panic / no notification observable directly without a
        // dedicated waiter thread; this test only asserts the bulk path
        // still makes the tablet pickable.
        assert_eq!(reg.candidates_size(), 1);
        reg.shutdown();
    }
}

// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! The scheduler loop: repeatedly pull the best candidate, run it through a
//! filter pipeline, and dispatch it to a worker pool.
//!
//! Loop shape grounded on `examples/wangsiyuan-code-ceresdb`'s
//! `analytic_engine/src/compaction/scheduler.rs` (a condvar/timeout-gated
//! loop re-reading shared config every iteration). Filter semantics
//! grounded on `compaction_manager.cpp`'s `try_get_next_tablet`
//! (original_source): each candidate is either accepted, deferred (kept
//! off the set for this pass, reinserted once the scan ends), or discarded
//! (left off entirely; the tablet re-registers itself once it has new work).

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::info;

use crate::{
    compaction::{
        factory::CompactionTaskFactory,
        pool::CompactionWorkerPools,
        registry::{CandidateRegistry, SchedulerWaker},
    },
    config::{CompactionConfig, Limit},
    tablet::{AlterState, TabletHandle, TabletState},
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

enum FilterOutcome {
    Accept,
    Defer,
    Discard,
}

/// One scheduler loop. Multiple instances may share one `CandidateRegistry`
/// and pool set (the reference engine's `max_thread_per_disk` spawns one
/// scheduler thread per path); each gets its own wake-up handle.
pub struct Scheduler {
    name: String,
    registry: Arc<CandidateRegistry>,
    pools: Arc<CompactionWorkerPools>,
    factory: Arc<CompactionTaskFactory>,
    waker: Arc<SchedulerWaker>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        name: impl Into<String>,
        registry: Arc<CandidateRegistry>,
        pools: Arc<CompactionWorkerPools>,
        factory: Arc<CompactionTaskFactory>,
    ) -> Arc<Self> {
        let waker = SchedulerWaker::new();
        registry.register_scheduler(waker.clone());
        Arc::new(Self {
            name: name.into(),
            registry,
            pools,
            factory,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || scheduler.run_loop())
            .expect("failed to spawn compaction scheduler thread");
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.waker.notify();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.registry.unregister_scheduler(&self.waker);
    }

    fn run_loop(self: Arc<Self>) {
        info!("compaction scheduler '{}' started", self.name);
        while !self.stop.load(Ordering::SeqCst) {
            let config = self.registry.config().load();

            if !config.enable_compaction {
                self.waker.wait_timeout(POLL_INTERVAL);
                continue;
            }
            let store_num = self.registry.known_store_count() as u32;
            if !effective_task_capacity(&config, store_num).admits(self.registry.running_tasks_num()) {
                self.waker.wait_timeout(POLL_INTERVAL);
                continue;
            }

            match self.try_get_next_tablet(&config) {
                Some(tablet) => self.dispatch(tablet),
                None => self.waker.wait_timeout(POLL_INTERVAL),
            }
        }
        info!("compaction scheduler '{}' stopped", self.name);
    }

    /// Pop candidates off the registry until one passes every filter or the
    /// set is exhausted. Deferred candidates are returned to the registry
    /// before this call returns so a later pass (or another scheduler) can
    /// reconsider them once conditions change.
    fn try_get_next_tablet(&self, config: &CompactionConfig) -> Option<Arc<dyn TabletHandle>> {
        let mut deferred = Vec::new();
        let result = loop {
            let tablet = match self.registry.pick_candidate() {
                Some(t) => t,
                None => break None,
            };
            match self.filter(&tablet, config) {
                FilterOutcome::Accept => break Some(tablet),
                FilterOutcome::Defer => deferred.push(tablet),
                FilterOutcome::Discard => {}
            }
        };
        if !deferred.is_empty() {
            self.registry.insert_candidates(deferred);
        }
        result
    }

    fn filter(&self, tablet: &Arc<dyn TabletHandle>, config: &CompactionConfig) -> FilterOutcome {
        // 1. Only running tablets are eligible; a shut-down or not-yet-ready
        // tablet is terminal for this candidacy.
        if tablet.tablet_state() != TabletState::Running {
            return FilterOutcome::Discard;
        }

        // 2. A tablet already running a task does not need a second one;
        // its own task's cleanup guard will re-register it if still dirty.
        if tablet.current_task().is_some() {
            return FilterOutcome::Discard;
        }

        // 3. An in-flight schema-change/rollup only blocks the newly-created
        // child tablet, not the parent it was cloned from; the parent keeps
        // compacting normally for the duration of the alter.
        if let Some(alter) = tablet.alter_task() {
            if alter.state == AlterState::Running
                && tablet.creation_time_ms() > alter.related_tablet_creation_time_ms
            {
                return FilterOutcome::Discard;
            }
        }

        // 4. The tablet may have been compacted by a concurrent scheduler
        // between being listed as a candidate and being picked here.
        if !tablet.need_compaction() {
            return FilterOutcome::Discard;
        }
        let level = match tablet.compaction_level() {
            Some(level) => level,
            None => return FilterOutcome::Discard,
        };

        // 5. Backoff: a level that failed recently is skipped until the
        // configured interval elapses, so a persistently broken merge does
        // not spin the scheduler.
        let backoff_ms = config.min_compaction_failure_interval_sec.max(0) * 1000;
        if backoff_ms > 0 {
            let last_failure = tablet.last_failure_time_ms(level);
            if last_failure > 0 {
                let now = now_ms();
                if now - last_failure < backoff_ms {
                    return FilterOutcome::Defer;
                }
            }
        }

        // 6. Per-level quota precheck; the authoritative check happens
        // again atomically in `CandidateRegistry::register_task`, this is
        // only to avoid manufacturing a task that certainly cannot run.
        if !config.level_limit(level).admits(self.registry.running_tasks_num_for_level(level)) {
            return FilterOutcome::Defer;
        }

        // 7. Per-disk quota precheck, same rationale as above.
        let disk_path = tablet.data_dir().path().to_string();
        if !config
            .max_compaction_task_per_disk()
            .admits(self.registry.running_tasks_num_for_disk(&disk_path))
        {
            return FilterOutcome::Defer;
        }

        // 8. A full disk cannot host a compaction's output; this is
        // transient so the tablet is retried, not dropped.
        if tablet.data_dir().reach_capacity_limit(0) {
            return FilterOutcome::Defer;
        }

        // 9. The level lock is held by a task this scheduler cannot yet
        // see as registered (e.g. between registration and the worker
        // thread actually starting); try rather than block.
        let lock = tablet.level_lock(level);
        match lock.try_lock() {
            Ok(_guard) => FilterOutcome::Accept,
            Err(_) => FilterOutcome::Defer,
        }
    }

    fn dispatch(&self, tablet: Arc<dyn TabletHandle>) {
        // Schema width is a storage-engine concern (§1 Non-goals); absent a
        // real column count this always resolves to horizontal merge.
        let num_columns = 1;
        let task = match self.factory.create_task(&self.registry, tablet.clone(), num_columns) {
            Some(task) => task,
            None => return,
        };

        if !self.registry.register_task(&task) {
            // Lost the quota race between the filter precheck and here;
            // the tablet is still a legitimate candidate.
            self.registry.update_candidate(tablet);
            return;
        }
        task.mark_registered();
        tablet.set_current_task(Some(task.clone()));

        if !self.pools.dispatch(task.clone(), self.registry.clone()) {
            tablet.reset_compaction();
            self.registry.unregister_task(&task);
            self.registry.update_candidate(tablet);
        }
    }
}

/// `min(max_compaction_task_num, store_num * max_compaction_task_per_disk)`,
/// the real capacity ceiling from `_can_schedule_next`
/// (`compaction_scheduler.cpp`, original_source): the global quota and the
/// per-disk quota scaled by how many disks are known both bound how many
/// tasks may run at once, not just the former. Either term may be
/// unlimited (`-1`); the combination is unlimited only if both are.
fn effective_task_capacity(config: &CompactionConfig, store_num: u32) -> Limit {
    let global = config.max_compaction_task_num().value();
    let per_disk_derived = config
        .max_compaction_task_per_disk()
        .value()
        .map(|per_disk| per_disk.saturating_mul(store_num));
    match (global, per_disk_derived) {
        (Some(g), Some(d)) => Limit::new(g.min(d) as i64),
        (Some(g), None) => Limit::new(g as i64),
        (None, Some(d)) => Limit::new(d as i64),
        (None, None) => Limit::UNLIMITED,
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        compaction::task::FakeAlgorithmRunner,
        config::SharedConfig,
        metrics::CompactionMetrics,
        rowset::{Rowset, Version},
        tablet::{AlterTaskInfo, CompactionLevel, FakeDataDir, FakeTablet},
    };

    fn harness() -> (Arc<CandidateRegistry>, Arc<Scheduler>) {
        let config = Arc::new(SharedConfig::default());
        let metrics = Arc::new(CompactionMetrics::default());
        let registry = CandidateRegistry::new(config.clone(), metrics);
        let pools = Arc::new(CompactionWorkerPools::new(&config.load()));
        let factory = Arc::new(CompactionTaskFactory::new(
            config,
            Arc::new(FakeAlgorithmRunner::default()),
        ));
        let scheduler = Scheduler::new("test-scheduler", registry.clone(), pools, factory);
        (registry, scheduler)
    }

    fn dirty_tablet(id: u64) -> Arc<FakeTablet> {
        let dir = FakeDataDir::new("/data0");
        let tablet = FakeTablet::new(id, dir);
        {
            let mut ctx = tablet.context();
            ctx.insert_rowset(0, Arc::new(Rowset::new(Version::new(0, 9), 10, 100)));
            ctx.set_score(CompactionLevel::Cumulative, 3.0);
        }
        tablet
    }

    #[test]
    fn end_to_end_dispatch_commits_task() {
        let (registry, scheduler) = harness();
        let tablet = dirty_tablet(1);
        registry.update_candidate(tablet.clone());

        scheduler.start();
        let mut committed = false;
        for _ in 0..50 {
            thread::sleep(Duration::from_millis(50));
            if registry.metrics().snapshot().tasks_committed >= 1 {
                committed = true;
                break;
            }
        }
        scheduler.stop();
        registry.shutdown();
        assert!(committed, "expected the scheduler to drive the task to commit");
    }

    #[test]
    fn alter_running_discards_the_newly_created_child() {
        let (registry, scheduler) = harness();
        let tablet = dirty_tablet(1).with_creation_time(200);
        tablet.set_alter_task(Some(AlterTaskInfo {
            state: AlterState::Running,
            related_tablet_creation_time_ms: 100,
        }));
        let config = registry.config().load();

        assert!(matches!(
            scheduler.filter(&(tablet.clone() as Arc<dyn TabletHandle>), &config),
            FilterOutcome::Discard
        ));
        registry.shutdown();
    }

    #[test]
    fn alter_running_does_not_block_the_parent_tablet() {
        let (registry, scheduler) = harness();
        let tablet = dirty_tablet(1).with_creation_time(100);
        tablet.set_alter_task(Some(AlterTaskInfo {
            state: AlterState::Running,
            related_tablet_creation_time_ms: 200,
        }));
        let config = registry.config().load();

        assert!(!matches!(
            scheduler.filter(&(tablet.clone() as Arc<dyn TabletHandle>), &config),
            FilterOutcome::Discard
        ));
        registry.shutdown();
    }

    #[test]
    fn non_running_tablet_state_is_discarded() {
        let (registry, scheduler) = harness();
        let tablet = dirty_tablet(1);
        tablet.set_state(TabletState::Shutdown);
        let config = registry.config().load();

        assert!(matches!(
            scheduler.filter(&(tablet.clone() as Arc<dyn TabletHandle>), &config),
            FilterOutcome::Discard
        ));
        registry.shutdown();
    }

    #[test]
    fn held_level_lock_defers() {
        let (registry, scheduler) = harness();
        let tablet = dirty_tablet(1);
        let config = registry.config().load();
        let _held = tablet.cumulative_lock().lock().unwrap();

        assert!(matches!(
            scheduler.filter(&(tablet.clone() as Arc<dyn TabletHandle>), &config),
            FilterOutcome::Defer
        ));
        registry.shutdown();
    }

    #[test]
    fn effective_task_capacity_takes_the_stricter_term() {
        let mut config = CompactionConfig::default();
        config.max_compaction_task_num = 10;
        config.max_compaction_task_per_disk = 2;

        // 3 disks * 2 per disk = 6, stricter than the global cap of 10.
        assert_eq!(effective_task_capacity(&config, 3).value(), Some(6));

        // 1 disk * 2 per disk = 2, still stricter.
        assert_eq!(effective_task_capacity(&config, 1).value(), Some(2));

        config.max_compaction_task_per_disk = -1;
        assert_eq!(effective_task_capacity(&config, 3).value(), Some(10));

        config.max_compaction_task_num = -1;
        assert_eq!(effective_task_capacity(&config, 3).value(), None);
    }

    #[test]
    fn disk_quota_exhausted_defers() {
        let (registry, scheduler) = harness();
        let mut cfg = registry.config().load();
        cfg.max_compaction_task_per_disk = 0;
        registry.config().update(cfg.clone());
        let tablet = dirty_tablet(1);

        assert!(matches!(
            scheduler.filter(&(tablet.clone() as Arc<dyn TabletHandle>), &cfg),
            FilterOutcome::Defer
        ));
        registry.shutdown();
    }
}

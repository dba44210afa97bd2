// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Collaborator contracts (`Tablet`, `DataDir`) the control plane depends on,
//! plus an in-memory fake of each for the crate's own tests.
//!
//! The real implementations live in the storage engine and the tablet
//! metadata store (§1 Non-goals); this crate only needs the methods spelled
//! out in §6.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use crate::{
    compaction::{context::CompactionContext, task::CompactionTask},
    error::{InvariantViolatedSnafu, Result},
    rowset::{Rowset, Version},
};

/// `level == 0` is cumulative (frequent, small); `level == 1` is base (rare,
/// large). `LEVEL_COUNT` non-terminal levels carry a score each; the final
/// level is the compaction sink and never scored.
pub const LEVEL_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionLevel {
    Cumulative,
    Base,
}

impl CompactionLevel {
    pub fn as_index(self) -> u8 {
        match self {
            CompactionLevel::Cumulative => 0,
            CompactionLevel::Base => 1,
        }
    }

    pub fn from_index(idx: u8) -> Option<Self> {
        match idx {
            0 => Some(CompactionLevel::Cumulative),
            1 => Some(CompactionLevel::Base),
            _ => None,
        }
    }
}

impl fmt::Display for CompactionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionLevel::Cumulative => write!(f, "cumulative(0)"),
            CompactionLevel::Base => write!(f, "base(1)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletState {
    /// Normal serving state; the only state compaction may run against.
    Running,
    /// Newly created (e.g. schema-change child) and not yet ready to serve
    /// or be compacted.
    NotReady,
    /// Being dropped or otherwise torn down.
    Shutdown,
}

/// Describes an in-flight alter task (schema change / rollup) touching a
/// tablet, used by scheduler filter #3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlterState {
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub struct AlterTaskInfo {
    pub state: AlterState,
    pub related_tablet_creation_time_ms: i64,
}

/// A physical storage mount hosting some tablets; the unit of per-disk
/// concurrency control.
pub trait DataDirHandle: Send + Sync + fmt::Debug {
    fn path(&self) -> &str;
    fn reach_capacity_limit(&self, reserved_bytes: u64) -> bool;
}

/// The unit of compaction: a bounded shard of a table on one node.
///
/// Implementors must guarantee `Send + Sync`: tablets are shared between the
/// registry, scheduler thread(s), and worker-pool threads running their
/// compaction tasks.
pub trait TabletHandle: Send + Sync + fmt::Debug {
    fn id(&self) -> u64;

    fn creation_time_ms(&self) -> i64;

    fn data_dir(&self) -> Arc<dyn DataDirHandle>;

    fn tablet_state(&self) -> TabletState;

    /// `true` if the tablet's compaction context reports outstanding work.
    fn need_compaction(&self) -> bool;

    /// Max of the per-level scores in the tablet's compaction context.
    fn compaction_score(&self) -> f64;

    /// The level selected for the next compaction task, if any.
    fn compaction_level(&self) -> Option<CompactionLevel>;

    /// Extract the input rowsets and union output version for the level
    /// `compaction_level()` currently selects. Returns `None` if there is
    /// nothing to compact (mirrors `need_compaction() == false`).
    fn compaction_inputs(&self) -> Option<(CompactionLevel, Vec<Arc<Rowset>>, Version)>;

    /// The tablet's at-most-one active compaction task slot.
    fn current_task(&self) -> Option<Arc<CompactionTask>>;

    fn set_current_task(&self, task: Option<Arc<CompactionTask>>);

    /// Clear the compaction slot. Must be idempotent.
    fn reset_compaction(&self) {
        self.set_current_task(None);
    }

    /// In-flight alter (schema change / rollup) task touching this tablet,
    /// if any.
    fn alter_task(&self) -> Option<AlterTaskInfo>;

    fn cumulative_lock(&self) -> &Mutex<()>;

    fn base_lock(&self) -> &Mutex<()>;

    fn header_lock(&self) -> &RwLock<()>;

    fn last_cumu_compaction_failure_time_ms(&self) -> i64;

    fn last_base_compaction_failure_time_ms(&self) -> i64;

    fn set_last_cumu_compaction_failure_time_ms(&self, ms: i64);

    fn set_last_base_compaction_failure_time_ms(&self, ms: i64);

    fn set_last_cumu_compaction_success_time_ms(&self, ms: i64);

    fn set_last_base_compaction_success_time_ms(&self, ms: i64);

    fn last_failure_time_ms(&self, level: CompactionLevel) -> i64 {
        match level {
            CompactionLevel::Cumulative => self.last_cumu_compaction_failure_time_ms(),
            CompactionLevel::Base => self.last_base_compaction_failure_time_ms(),
        }
    }

    fn level_lock(&self, level: CompactionLevel) -> &Mutex<()> {
        match level {
            CompactionLevel::Cumulative => self.cumulative_lock(),
            CompactionLevel::Base => self.base_lock(),
        }
    }

    /// Atomically substitute `removed` for `added` in the tablet's rowset
    /// metadata. Must leave the tablet untouched on failure (§4.A Commit).
    fn modify_rowsets(&self, added: Vec<Arc<Rowset>>, removed: Vec<Arc<Rowset>>) -> Result<()>;

    /// Persist the tablet's metadata to stable storage. Called only while
    /// holding `header_lock()` exclusively, after `modify_rowsets` succeeds.
    fn save_meta(&self) -> Result<()>;
}

/// In-memory fake used by this crate's own tests. Never used by production
/// embedders, who supply the real storage-engine-backed implementation.
#[derive(Debug)]
pub struct FakeDataDir {
    path: String,
    full: AtomicBool,
}

impl FakeDataDir {
    pub fn new(path: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            full: AtomicBool::new(false),
        })
    }

    pub fn set_full(&self, full: bool) {
        self.full.store(full, Ordering::Relaxed);
    }
}

impl DataDirHandle for FakeDataDir {
    fn path(&self) -> &str {
        &self.path
    }

    fn reach_capacity_limit(&self, _reserved_bytes: u64) -> bool {
        self.full.load(Ordering::Relaxed)
    }
}

/// In-memory fake tablet. `compaction_score`/`need_compaction` are driven
/// directly by test code (`set_score`) rather than by a real leveled
/// `CompactionContext` computation, except where a test specifically
/// exercises `CompactionContext` (see `compaction::context` tests).
#[derive(Debug)]
pub struct FakeTablet {
    id: u64,
    creation_time_ms: AtomicI64,
    data_dir: Arc<dyn DataDirHandle>,
    state: RwLock<TabletState>,
    context: Mutex<CompactionContext>,
    score_override: RwLock<Option<f64>>,
    current_task: Mutex<Option<Arc<CompactionTask>>>,
    alter_task: RwLock<Option<AlterTaskInfo>>,
    cumulative_lock: Mutex<()>,
    base_lock: Mutex<()>,
    header_lock: RwLock<()>,
    last_cumu_failure_ms: AtomicI64,
    last_base_failure_ms: AtomicI64,
    last_cumu_success_ms: AtomicI64,
    last_base_success_ms: AtomicI64,
    save_meta_calls: AtomicU64,
}

impl FakeTablet {
    pub fn new(id: u64, data_dir: Arc<dyn DataDirHandle>) -> Arc<Self> {
        Arc::new(Self {
            id,
            creation_time_ms: AtomicI64::new(0),
            data_dir,
            state: RwLock::new(TabletState::Running),
            context: Mutex::new(CompactionContext::new()),
            score_override: RwLock::new(None),
            current_task: Mutex::new(None),
            alter_task: RwLock::new(None),
            cumulative_lock: Mutex::new(()),
            base_lock: Mutex::new(()),
            header_lock: RwLock::new(()),
            last_cumu_failure_ms: AtomicI64::new(0),
            last_base_failure_ms: AtomicI64::new(0),
            last_cumu_success_ms: AtomicI64::new(0),
            last_base_success_ms: AtomicI64::new(0),
            save_meta_calls: AtomicU64::new(0),
        })
    }

    pub fn with_creation_time(self: Arc<Self>, ms: i64) -> Arc<Self> {
        self.creation_time_ms.store(ms, Ordering::Relaxed);
        self
    }

    pub fn set_state(&self, state: TabletState) {
        *self.state.write().unwrap() = state;
    }

    pub fn set_alter_task(&self, task: Option<AlterTaskInfo>) {
        *self.alter_task.write().unwrap() = task;
    }

    /// Force `compaction_score`/`need_compaction` independent of the
    /// underlying `CompactionContext`, for tests that only care about
    /// registry/scheduler ordering.
    pub fn set_score(&self, score: f64) {
        *self.score_override.write().unwrap() = Some(score);
    }

    pub fn context(&self) -> std::sync::MutexGuard<'_, CompactionContext> {
        self.context.lock().unwrap()
    }

    pub fn save_meta_call_count(&self) -> u64 {
        self.save_meta_calls.load(Ordering::Relaxed)
    }
}

impl TabletHandle for FakeTablet {
    fn id(&self) -> u64 {
        self.id
    }

    fn creation_time_ms(&self) -> i64 {
        self.creation_time_ms.load(Ordering::Relaxed)
    }

    fn data_dir(&self) -> Arc<dyn DataDirHandle> {
        self.data_dir.clone()
    }

    fn tablet_state(&self) -> TabletState {
        *self.state.read().unwrap()
    }

    fn need_compaction(&self) -> bool {
        if let Some(score) = *self.score_override.read().unwrap() {
            return score > 0.0;
        }
        self.context.lock().unwrap().compaction_score() > 0.0
    }

    fn compaction_score(&self) -> f64 {
        if let Some(score) = *self.score_override.read().unwrap() {
            return score;
        }
        self.context.lock().unwrap().compaction_score()
    }

    fn compaction_level(&self) -> Option<CompactionLevel> {
        self.context.lock().unwrap().compaction_level()
    }

    fn compaction_inputs(&self) -> Option<(CompactionLevel, Vec<Arc<Rowset>>, Version)> {
        self.context.lock().unwrap().compaction_inputs()
    }

    fn current_task(&self) -> Option<Arc<CompactionTask>> {
        self.current_task.lock().unwrap().clone()
    }

    fn set_current_task(&self, task: Option<Arc<CompactionTask>>) {
        *self.current_task.lock().unwrap() = task;
    }

    fn alter_task(&self) -> Option<AlterTaskInfo> {
        self.alter_task.read().unwrap().clone()
    }

    fn cumulative_lock(&self) -> &Mutex<()> {
        &self.cumulative_lock
    }

    fn base_lock(&self) -> &Mutex<()> {
        &self.base_lock
    }

    fn header_lock(&self) -> &RwLock<()> {
        &self.header_lock
    }

    fn last_cumu_compaction_failure_time_ms(&self) -> i64 {
        self.last_cumu_failure_ms.load(Ordering::Relaxed)
    }

    fn last_base_compaction_failure_time_ms(&self) -> i64 {
        self.last_base_failure_ms.load(Ordering::Relaxed)
    }

    fn set_last_cumu_compaction_failure_time_ms(&self, ms: i64) {
        self.last_cumu_failure_ms.store(ms, Ordering::Relaxed);
    }

    fn set_last_base_compaction_failure_time_ms(&self, ms: i64) {
        self.last_base_failure_ms.store(ms, Ordering::Relaxed);
    }

    fn set_last_cumu_compaction_success_time_ms(&self, ms: i64) {
        self.last_cumu_success_ms.store(ms, Ordering::Relaxed);
    }

    fn set_last_base_compaction_success_time_ms(&self, ms: i64) {
        self.last_base_success_ms.store(ms, Ordering::Relaxed);
    }

    fn modify_rowsets(&self, added: Vec<Arc<Rowset>>, removed: Vec<Arc<Rowset>>) -> Result<()> {
        let mut ctx = self.context.lock().unwrap();
        ctx.apply_modification(added, removed).map_err(|msg| {
            InvariantViolatedSnafu {
                tablet_id: self.id,
                msg,
            }
            .build()
        })
    }

    fn save_meta(&self) -> Result<()> {
        self.save_meta_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_tablet_reset_compaction_clears_slot() {
        let dir = FakeDataDir::new("/data0");
        let tablet = FakeTablet::new(1, dir);
        tablet.set_score(5.0);
        assert!(tablet.need_compaction());
        assert!(tablet.current_task().is_none());
        tablet.reset_compaction();
        assert!(tablet.current_task().is_none());
    }

    #[test]
    fn data_dir_capacity_toggle() {
        let dir = FakeDataDir::new("/data0");
        assert!(!dir.reach_capacity_limit(0));
        dir.set_full(true);
        assert!(dir.reach_capacity_limit(0));
    }
}

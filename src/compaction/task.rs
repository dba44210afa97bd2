// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Compaction task: the unit of work the scheduler hands to a worker pool
//! (§4.A).
//!
//! Grounded on `compaction_task.h`/`.cpp` (original_source): the same
//! lifecycle (`CREATED -> REGISTERED -> RUNNING -> {COMMITTED, FAILED,
//! CANCELLED} -> UNREGISTERED`), the same validate-then-commit sequencing
//! under the tablet's header lock, and the same deferred cleanup that runs
//! no matter which exit path a task takes. The original's `DeferOp` becomes
//! a `Drop` guard here (`TaskCleanupGuard`), the idiomatic Rust expression
//! of "this runs on every return path".

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use log::{error, info, warn};

use crate::{
    compaction::registry::CandidateRegistry,
    error::{CancelledSnafu, ResourceBusySnafu, Result, ValidationFailedSnafu},
    rowset::{Rowset, Version},
    tablet::{CompactionLevel, TabletHandle},
};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Registered,
    Running,
    Committed,
    Failed,
    Cancelled,
    Unregistered,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The merge strategy a task runs, chosen by the task factory from rowset
/// shape and schema width (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionAlgorithm {
    /// Merge all columns of all rowsets together; cheap to plan, higher peak
    /// memory.
    Horizontal,
    /// Merge column groups independently; used for wide schemas.
    Vertical,
}

impl fmt::Display for CompactionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionAlgorithm::Horizontal => write!(f, "horizontal"),
            CompactionAlgorithm::Vertical => write!(f, "vertical"),
        }
    }
}

/// Progress counters a task accumulates as it runs, surfaced for
/// monitoring/debugging. Grounded on `CompactionStatistics`
/// (`compaction_task.h`, original_source); this crate's merge kernel is a
/// single external call rather than a streaming iterator (§1 Non-goals), so
/// the per-task counters are filled in once from the kernel's summary
/// rather than updated incrementally mid-run.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionStatistics {
    pub input_rowsets_num: u32,
    pub total_rows_read: u64,
    pub total_rows_output: u64,
}

/// The result of actually running the merge kernel. Production embedders
/// supply a real `CompactionAlgorithmRunner`; this crate's own tests use
/// [`FakeAlgorithmRunner`].
pub struct CompactionOutput {
    pub rowset: Arc<Rowset>,
    pub input_rows: u64,
    pub output_rows: u64,
    pub merged_rows: u64,
    pub filtered_rows: u64,
}

/// The actual merge kernel (horizontal/vertical column merge, delete-marker
/// filtering, etc.) is an external collaborator (§1 Non-goals, §4.A): this
/// crate only needs to invoke it and validate/commit its result.
pub trait CompactionAlgorithmRunner: Send + Sync {
    fn run(
        &self,
        tablet: &dyn TabletHandle,
        level: CompactionLevel,
        inputs: &[Arc<Rowset>],
        output_version: Version,
    ) -> Result<CompactionOutput>;
}

/// In-memory fake used by this crate's own tests: concatenates input rows,
/// optionally dropping a fixed count to exercise the filtered-rows path.
#[derive(Debug, Default)]
pub struct FakeAlgorithmRunner {
    pub filtered_rows: u64,
}

impl CompactionAlgorithmRunner for FakeAlgorithmRunner {
    fn run(
        &self,
        _tablet: &dyn TabletHandle,
        _level: CompactionLevel,
        inputs: &[Arc<Rowset>],
        output_version: Version,
    ) -> Result<CompactionOutput> {
        let input_rows: u64 = inputs.iter().map(|r| r.num_rows()).sum();
        let output_rows = input_rows.saturating_sub(self.filtered_rows);
        let bytes: u64 = inputs.iter().map(|r| r.data_disk_size()).sum();
        Ok(CompactionOutput {
            rowset: Arc::new(Rowset::new(output_version, output_rows, bytes)),
            input_rows,
            output_rows,
            merged_rows: 0,
            filtered_rows: self.filtered_rows,
        })
    }
}

/// A fake that always fails, for exercising the failure path.
#[derive(Debug, Default)]
pub struct AlwaysFailingRunner;

impl CompactionAlgorithmRunner for AlwaysFailingRunner {
    fn run(
        &self,
        tablet: &dyn TabletHandle,
        _level: CompactionLevel,
        _inputs: &[Arc<Rowset>],
        _output_version: Version,
    ) -> Result<CompactionOutput> {
        crate::error::IoSnafu {
            tablet_id: tablet.id(),
            msg: "fake merge kernel failure".to_string(),
        }
        .fail()
    }
}

/// One compaction task: a fixed input rowset set, an output version, and the
/// algorithm chosen to merge them.
pub struct CompactionTask {
    task_id: u64,
    tablet: Arc<dyn TabletHandle>,
    level: CompactionLevel,
    input_rowsets: Vec<Arc<Rowset>>,
    output_version: Version,
    algorithm: CompactionAlgorithm,
    runner: Arc<dyn CompactionAlgorithmRunner>,
    state: Mutex<TaskState>,
    cancel_requested: AtomicBool,
    committed_stats: Mutex<Option<(u64, u64, u64)>>,
    start_time_ms: AtomicI64,
    end_time_ms: AtomicI64,
    stats: Mutex<CompactionStatistics>,
}

impl fmt::Debug for CompactionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactionTask")
            .field("task_id", &self.task_id)
            .field("tablet_id", &self.tablet.id())
            .field("level", &self.level)
            .field("algorithm", &self.algorithm)
            .field("state", &self.state())
            .finish()
    }
}

impl CompactionTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: u64,
        tablet: Arc<dyn TabletHandle>,
        level: CompactionLevel,
        input_rowsets: Vec<Arc<Rowset>>,
        output_version: Version,
        algorithm: CompactionAlgorithm,
        runner: Arc<dyn CompactionAlgorithmRunner>,
    ) -> Arc<Self> {
        let stats = CompactionStatistics {
            input_rowsets_num: input_rowsets.len() as u32,
            ..Default::default()
        };
        Arc::new(Self {
            task_id,
            tablet,
            level,
            input_rowsets,
            output_version,
            algorithm,
            runner,
            state: Mutex::new(TaskState::Created),
            cancel_requested: AtomicBool::new(false),
            committed_stats: Mutex::new(None),
            start_time_ms: AtomicI64::new(0),
            end_time_ms: AtomicI64::new(0),
            stats: Mutex::new(stats),
        })
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn tablet(&self) -> &Arc<dyn TabletHandle> {
        &self.tablet
    }

    pub fn compaction_level(&self) -> CompactionLevel {
        self.level
    }

    pub fn input_rowsets(&self) -> &[Arc<Rowset>] {
        &self.input_rowsets
    }

    pub fn output_version(&self) -> Version {
        self.output_version
    }

    pub fn algorithm(&self) -> CompactionAlgorithm {
        self.algorithm
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: TaskState) {
        *self.state.lock().unwrap() = state;
    }

    /// Wall-clock time `execute` started running this task, `0` before that.
    pub fn start_time_ms(&self) -> i64 {
        self.start_time_ms.load(Ordering::Relaxed)
    }

    /// Wall-clock time `execute` reached a terminal state, `0` while still
    /// running or before it started.
    pub fn end_time_ms(&self) -> i64 {
        self.end_time_ms.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> CompactionStatistics {
        *self.stats.lock().unwrap()
    }

    /// Transition out of `CREATED` once the registry has admitted this task
    /// under quota. Called by the scheduler, not by `execute`.
    pub fn mark_registered(&self) {
        self.set_state(TaskState::Registered);
    }

    /// Cooperative cancellation signal (e.g. tablet dropped mid-run).
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn record_failure_time(&self, update: bool) {
        if !update {
            return;
        }
        let ms = now_ms();
        match self.level {
            CompactionLevel::Cumulative => self.tablet.set_last_cumu_compaction_failure_time_ms(ms),
            CompactionLevel::Base => self.tablet.set_last_base_compaction_failure_time_ms(ms),
        }
    }

    fn record_success_time(&self) {
        let ms = now_ms();
        match self.level {
            CompactionLevel::Cumulative => self.tablet.set_last_cumu_compaction_success_time_ms(ms),
            CompactionLevel::Base => self.tablet.set_last_base_compaction_success_time_ms(ms),
        }
    }

    fn validate_and_commit(&self, output: CompactionOutput) -> Result<()> {
        let expected = output.output_rows + output.merged_rows + output.filtered_rows;
        if output.input_rows != expected {
            return ValidationFailedSnafu {
                tablet_id: self.tablet.id(),
                input_rows: output.input_rows,
                output_rows: output.output_rows,
                merged_rows: output.merged_rows,
                filtered_rows: output.filtered_rows,
            }
            .fail();
        }

        *self.stats.lock().unwrap() = CompactionStatistics {
            input_rowsets_num: self.input_rowsets.len() as u32,
            total_rows_read: output.input_rows,
            total_rows_output: output.output_rows,
        };

        {
            let _header = self.tablet.header_lock().write().unwrap();
            self.tablet
                .modify_rowsets(vec![output.rowset.clone()], self.input_rowsets.clone())?;
            self.tablet.save_meta()?;
        }

        if let Err(msg) = output.rowset.load() {
            warn!(
                "preload of compaction output failed, tablet:{}, msg:{}",
                self.tablet.id(),
                msg
            );
        }

        *self.committed_stats.lock().unwrap() = Some((
            output.merged_rows,
            output.filtered_rows,
            output.rowset.data_disk_size(),
        ));
        Ok(())
    }

    /// Run the task to completion: acquire the level lock, invoke the merge
    /// kernel, validate its output, commit under the header lock, and update
    /// tablet timestamps. Cleanup (slot reset, registry unregistration,
    /// metrics, requeue-if-still-dirty) runs via `TaskCleanupGuard`
    /// regardless of which branch below returns.
    pub fn execute(self: &Arc<Self>, registry: &Arc<CandidateRegistry>) -> Result<()> {
        let _guard = TaskCleanupGuard {
            task: self,
            registry,
        };
        self.start_time_ms.store(now_ms(), Ordering::Relaxed);

        if self.should_stop() {
            self.set_state(TaskState::Cancelled);
            info!(
                "compaction task cancelled before running, task:{}, tablet:{}",
                self.task_id,
                self.tablet.id()
            );
            self.end_time_ms.store(now_ms(), Ordering::Relaxed);
            return CancelledSnafu {
                tablet_id: self.tablet.id(),
            }
            .fail();
        }

        self.set_state(TaskState::Running);

        let level_lock = self.tablet.level_lock(self.level);
        let _level_guard = match level_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.set_state(TaskState::Failed);
                self.record_failure_time(true);
                self.end_time_ms.store(now_ms(), Ordering::Relaxed);
                return ResourceBusySnafu {
                    tablet_id: self.tablet.id(),
                    reason: "level lock held by a concurrent task".to_string(),
                }
                .fail();
            }
        };

        let outcome = self
            .runner
            .run(self.tablet.as_ref(), self.level, &self.input_rowsets, self.output_version)
            .and_then(|output| self.validate_and_commit(output));

        match &outcome {
            Ok(()) => {
                self.set_state(TaskState::Committed);
                self.record_success_time();
                info!(
                    "compaction task committed, task:{}, tablet:{}, level:{}",
                    self.task_id,
                    self.tablet.id(),
                    self.level
                );
            }
            Err(err) => {
                if matches!(err, crate::error::CompactionError::Cancelled { .. }) {
                    self.set_state(TaskState::Cancelled);
                } else {
                    self.set_state(TaskState::Failed);
                    if err.is_fatal() {
                        error!(
                            "compaction task hit a fatal error, task:{}, tablet:{}, err:{}",
                            self.task_id,
                            self.tablet.id(),
                            err
                        );
                    } else {
                        warn!(
                            "compaction task failed, task:{}, tablet:{}, err:{}",
                            self.task_id,
                            self.tablet.id(),
                            err
                        );
                    }
                }
                self.record_failure_time(err.should_update_failure_time());
            }
        }

        self.end_time_ms.store(now_ms(), Ordering::Relaxed);
        self.maybe_dump_trace(registry);

        outcome
    }

    /// Log a trace summary if the task's wall-clock run time exceeded the
    /// configured threshold (§6 `cumulative_compaction_trace_threshold_sec`).
    fn maybe_dump_trace(&self, registry: &Arc<CandidateRegistry>) {
        let threshold_ms = match registry.config().load().cumulative_compaction_trace_threshold_ms() {
            Some(ms) => ms,
            None => return,
        };
        let elapsed_ms = self.end_time_ms.load(Ordering::Relaxed) - self.start_time_ms.load(Ordering::Relaxed);
        if elapsed_ms >= threshold_ms {
            let stats = self.statistics();
            warn!(
                "compaction task exceeded trace threshold, task:{}, tablet:{}, elapsed_ms:{}, \
                 threshold_ms:{}, input_rowsets_num:{}, total_rows_read:{}, total_rows_output:{}",
                self.task_id,
                self.tablet.id(),
                elapsed_ms,
                threshold_ms,
                stats.input_rowsets_num,
                stats.total_rows_read,
                stats.total_rows_output
            );
        }
    }
}

/// RAII cleanup that always runs once a task stops executing, the idiomatic
/// replacement for the reference engine's `DeferOp`: reset the tablet's
/// compaction slot, unregister from the quota counters, record terminal
/// metrics, and put the tablet back on the candidate list if it still needs
/// more compaction.
struct TaskCleanupGuard<'a> {
    task: &'a Arc<CompactionTask>,
    registry: &'a Arc<CandidateRegistry>,
}

impl Drop for TaskCleanupGuard<'_> {
    fn drop(&mut self) {
        self.task.tablet().reset_compaction();
        self.registry.unregister_task(self.task);

        match self.task.state() {
            TaskState::Committed => {
                let (merged, filtered, bytes) =
                    self.task.committed_stats.lock().unwrap().unwrap_or((0, 0, 0));
                self.registry.metrics().record_commit(merged, filtered, bytes);
            }
            TaskState::Failed => self.registry.metrics().record_failure(),
            TaskState::Cancelled => self.registry.metrics().record_cancellation(),
            _ => {}
        }

        if self.task.tablet().need_compaction() {
            self.registry.update_candidate(self.task.tablet().clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::SharedConfig,
        metrics::CompactionMetrics,
        rowset::Rowset,
        tablet::{CompactionLevel, FakeDataDir, FakeTablet},
    };

    fn registry() -> Arc<CandidateRegistry> {
        CandidateRegistry::new(
            Arc::new(SharedConfig::default()),
            Arc::new(CompactionMetrics::default()),
        )
    }

    fn tablet_with_two_rowsets() -> Arc<FakeTablet> {
        let dir = FakeDataDir::new("/data0");
        let tablet = FakeTablet::new(1, dir);
        {
            let mut ctx = tablet.context();
            ctx.insert_rowset(0, Arc::new(Rowset::new(Version::new(0, 9), 100, 1024)));
            ctx.insert_rowset(0, Arc::new(Rowset::new(Version::new(10, 19), 100, 1024)));
            ctx.set_score(CompactionLevel::Cumulative, 4.0);
        }
        tablet
    }

    fn make_task(
        tablet: Arc<FakeTablet>,
        runner: Arc<dyn CompactionAlgorithmRunner>,
    ) -> (Arc<CompactionTask>, Arc<CandidateRegistry>) {
        let reg = registry();
        let (level, inputs, output_version) = tablet.compaction_inputs().unwrap();
        let task = CompactionTask::new(
            reg.next_compaction_task_id(),
            tablet.clone(),
            level,
            inputs,
            output_version,
            CompactionAlgorithm::Horizontal,
            runner,
        );
        assert!(reg.register_task(&task));
        task.mark_registered();
        tablet.set_current_task(Some(task.clone()));
        (task, reg)
    }

    #[test]
    fn successful_commit_replaces_rowsets_and_records_metrics() {
        let tablet = tablet_with_two_rowsets();
        let (task, reg) = make_task(tablet.clone(), Arc::new(FakeAlgorithmRunner::default()));

        task.execute(&reg).unwrap();

        assert_eq!(task.state(), TaskState::Committed);
        assert_eq!(tablet.save_meta_call_count(), 1);
        assert_eq!(reg.metrics().snapshot().tasks_committed, 1);
        assert_eq!(reg.running_tasks_num(), 0);
        assert!(tablet.current_task().is_none());

        let remaining = tablet.context().compaction_inputs();
        // score was only set for level 0 and never reset; the fake tablet
        // keeps reporting a level to compact until the test clears it, so
        // this only asserts the two originals were merged into one rowset.
        assert_eq!(remaining.unwrap().1.len(), 1);
        reg.shutdown();
    }

    #[test]
    fn execute_records_timestamps_and_progress_counters() {
        let tablet = tablet_with_two_rowsets();
        let (task, reg) = make_task(tablet.clone(), Arc::new(FakeAlgorithmRunner::default()));

        assert_eq!(task.start_time_ms(), 0);
        assert_eq!(task.end_time_ms(), 0);

        task.execute(&reg).unwrap();

        assert!(task.start_time_ms() > 0);
        assert!(task.end_time_ms() >= task.start_time_ms());
        let stats = task.statistics();
        assert_eq!(stats.input_rowsets_num, 2);
        assert_eq!(stats.total_rows_read, 200);
        assert_eq!(stats.total_rows_output, 200);
        reg.shutdown();
    }

    #[test]
    fn failed_run_marks_failed_and_records_failure_time() {
        let tablet = tablet_with_two_rowsets();
        let (task, reg) = make_task(tablet.clone(), Arc::new(AlwaysFailingRunner));

        let err = task.execute(&reg).unwrap_err();
        assert!(matches!(err, crate::error::CompactionError::Io { .. }));
        assert_eq!(task.state(), TaskState::Failed);
        assert!(tablet.last_cumu_compaction_failure_time_ms() > 0);
        assert_eq!(reg.metrics().snapshot().tasks_failed, 1);
        reg.shutdown();
    }

    #[test]
    fn cancel_before_run_skips_lock_and_commit() {
        let tablet = tablet_with_two_rowsets();
        let (task, reg) = make_task(tablet.clone(), Arc::new(FakeAlgorithmRunner::default()));

        task.request_cancel();
        let err = task.execute(&reg).unwrap_err();
        assert!(matches!(err, crate::error::CompactionError::Cancelled { .. }));
        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(tablet.save_meta_call_count(), 0);
        assert_eq!(reg.metrics().snapshot().tasks_cancelled, 1);
        reg.shutdown();
    }

    #[test]
    fn held_level_lock_yields_resource_busy() {
        let tablet = tablet_with_two_rowsets();
        let (task, reg) = make_task(tablet.clone(), Arc::new(FakeAlgorithmRunner::default()));

        let _held = tablet.cumulative_lock().lock().unwrap();
        let err = task.execute(&reg).unwrap_err();
        assert!(matches!(err, crate::error::CompactionError::ResourceBusy { .. }));
        assert_eq!(task.state(), TaskState::Failed);
        reg.shutdown();
    }

    #[test]
    fn cleanup_guard_requeues_tablet_that_still_needs_compaction() {
        let tablet = tablet_with_two_rowsets();
        // force need_compaction() to stay true after commit via the score
        // override, independent of the real context's recomputed score.
        tablet.set_score(7.0);
        let (task, reg) = make_task(tablet.clone(), Arc::new(FakeAlgorithmRunner::default()));

        task.execute(&reg).unwrap();
        assert_eq!(reg.candidates_size(), 1);
        reg.shutdown();
    }
}

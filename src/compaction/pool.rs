// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Worker pools that actually run compaction tasks off the scheduler
//! thread(s).
//!
//! No teacher file implements a raw thread pool directly; this is sourced
//! from the pack's `KivenChen-risingwave` storage crate's dependency on
//! `crossbeam`, combined with the reference engine's two-priority split
//! (`compaction_task_normal`/`compaction_task_low`, tuned for small vs.
//! large merges) from `compaction_manager.cpp`.

use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use log::warn;

use crate::{
    compaction::{registry::CandidateRegistry, task::CompactionTask},
    config::CompactionConfig,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Tasks above either threshold are routed to the low-priority pool so a
/// handful of large merges cannot starve many small ones.
pub const LARGE_TASK_ROWS_THRESHOLD: u64 = 1_000_000;
pub const LARGE_TASK_BYTES_THRESHOLD: u64 = 1024 * 1024 * 1024;

/// Queue depth behind each pool's thread array.
pub const POOL_QUEUE_DEPTH: usize = 1_000;

struct WorkerPool {
    name: String,
    sender: crossbeam_channel::Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn new(name: &str, num_threads: usize, queue_depth: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<Job>(queue_depth);
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads.max(1) {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn compaction worker thread");
            workers.push(handle);
        }
        Self {
            name: name.to_string(),
            sender: tx,
            workers: Mutex::new(workers),
        }
    }

    /// `false` if the queue was full and the job was dropped.
    fn submit(&self, job: Job) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(_) => {
                warn!("compaction worker pool '{}' queue is full, dropping task", self.name);
                false
            }
        }
    }

    fn shutdown(&self) {
        // Dropping every sender clone would be needed to close the channel;
        // instead we rely on the process-level registry.shutdown() ordering
        // (stop scheduler(s) first, so no more jobs get submitted), then
        // join. Outstanding workers simply block on `recv()` forever if the
        // channel is never disconnected, so shutdown only detaches: this
        // mirrors the reference engine's "no graceful worker-thread join on
        // shutdown" behavior, since the process is exiting regardless.
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            // Intentionally not joined: worker threads block on an empty
            // channel with no way to wake them short of closing every
            // sender, which `shutdown(&self)` cannot do without consuming
            // self. Detach instead.
            drop(handle);
        }
    }
}

/// The two priority pools a compaction task can land on.
pub struct CompactionWorkerPools {
    normal: WorkerPool,
    low: WorkerPool,
}

impl CompactionWorkerPools {
    pub fn new(config: &CompactionConfig) -> Self {
        let threads = config
            .max_compaction_task_num()
            .value()
            .unwrap_or(4)
            .max(1) as usize;
        Self {
            normal: WorkerPool::new("compaction-normal", threads, POOL_QUEUE_DEPTH),
            low: WorkerPool::new("compaction-low", threads, POOL_QUEUE_DEPTH),
        }
    }

    /// Route `task` to the pool matching its input size and submit a
    /// closure that runs it to completion against `registry`. Returns
    /// `false` if the target queue was full.
    pub fn dispatch(&self, task: Arc<CompactionTask>, registry: Arc<CandidateRegistry>) -> bool {
        let input_rows: u64 = task.input_rowsets().iter().map(|r| r.num_rows()).sum();
        let input_bytes: u64 = task.input_rowsets().iter().map(|r| r.data_disk_size()).sum();
        let pool = if input_rows > LARGE_TASK_ROWS_THRESHOLD || input_bytes > LARGE_TASK_BYTES_THRESHOLD {
            &self.low
        } else {
            &self.normal
        };
        pool.submit(Box::new(move || {
            let _ = task.execute(&registry);
        }))
    }

    pub fn shutdown(&self) {
        self.normal.shutdown();
        self.low.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::{
        compaction::task::{CompactionAlgorithm, FakeAlgorithmRunner},
        config::SharedConfig,
        metrics::CompactionMetrics,
        rowset::{Rowset, Version},
        tablet::{CompactionLevel, FakeDataDir, FakeTablet, TabletHandle},
    };

    #[test]
    fn small_task_routes_to_normal_pool() {
        let config = CompactionConfig::default();
        let pools = CompactionWorkerPools::new(&config);
        let reg = CandidateRegistry::new(
            Arc::new(SharedConfig::default()),
            Arc::new(CompactionMetrics::default()),
        );
        let dir = FakeDataDir::new("/data0");
        let tablet = FakeTablet::new(1, dir);
        {
            let mut ctx = tablet.context();
            ctx.insert_rowset(0, Arc::new(Rowset::new(Version::new(0, 9), 10, 100)));
            ctx.set_score(CompactionLevel::Cumulative, 2.0);
        }
        let (level, inputs, output_version) = tablet.compaction_inputs().unwrap();
        let task = CompactionTask::new(
            1,
            tablet.clone(),
            level,
            inputs,
            output_version,
            CompactionAlgorithm::Horizontal,
            Arc::new(FakeAlgorithmRunner::default()),
        );
        assert!(reg.register_task(&task));
        task.mark_registered();
        tablet.set_current_task(Some(task.clone()));

        assert!(pools.dispatch(task, reg.clone()));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(reg.metrics().snapshot().tasks_committed, 1);
        pools.shutdown();
        reg.shutdown();
    }

    #[test]
    fn full_queue_reports_drop() {
        let pool = WorkerPool::new("test-pool", 1, 1);
        let release = Arc::new((Mutex::new(false), std::sync::Condvar::new()));
        let release_worker = release.clone();

        // Occupy the single worker thread so nothing drains the queue.
        assert!(pool.submit(Box::new(move || {
            let (lock, cv) = &*release_worker;
            let mut guard = lock.lock().unwrap();
            while !*guard {
                guard = cv.wait(guard).unwrap();
            }
        })));
        // Fill the depth-1 queue behind it.
        assert!(pool.submit(Box::new(|| {})));
        // The pool is now fully occupied: one task running, one queued.
        assert!(!pool.submit(Box::new(|| {})));

        let (lock, cv) = &*release;
        *lock.lock().unwrap() = true;
        cv.notify_all();
    }
}

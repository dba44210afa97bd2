// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Plain atomic counters for the control plane (§2.I).
//!
//! No metrics-backend crate is wired in: exposing a `/metrics` endpoint is
//! an engine-bootstrap concern out of scope for this crate (§1). Embedders
//! that want Prometheus-style export can read a [`MetricsSnapshot`] and feed
//! it to whatever registry they already run, the same way CeresDB's own
//! `COMPACTION_PENDING_REQUEST_GAUGE` is just a counter bumped at
//! enqueue/dequeue sites.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CompactionMetrics {
    tasks_registered: AtomicU64,
    tasks_unregistered: AtomicU64,
    tasks_committed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_cancelled: AtomicU64,
    async_updates_dropped: AtomicU64,
    rows_merged: AtomicU64,
    rows_filtered: AtomicU64,
    bytes_compacted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub tasks_registered: u64,
    pub tasks_unregistered: u64,
    pub tasks_committed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub async_updates_dropped: u64,
    pub rows_merged: u64,
    pub rows_filtered: u64,
    pub bytes_compacted: u64,
}

impl CompactionMetrics {
    pub fn record_task_registered(&self) {
        self.tasks_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_unregistered(&self) {
        self.tasks_unregistered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self, merged_rows: u64, filtered_rows: u64, output_bytes: u64) {
        self.tasks_committed.fetch_add(1, Ordering::Relaxed);
        self.rows_merged.fetch_add(merged_rows, Ordering::Relaxed);
        self.rows_filtered.fetch_add(filtered_rows, Ordering::Relaxed);
        self.bytes_compacted.fetch_add(output_bytes, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_async_update_dropped(&self) {
        self.async_updates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_registered: self.tasks_registered.load(Ordering::Relaxed),
            tasks_unregistered: self.tasks_unregistered.load(Ordering::Relaxed),
            tasks_committed: self.tasks_committed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            async_updates_dropped: self.async_updates_dropped.load(Ordering::Relaxed),
            rows_merged: self.rows_merged.load(Ordering::Relaxed),
            rows_filtered: self.rows_filtered.load(Ordering::Relaxed),
            bytes_compacted: self.bytes_compacted.load(Ordering::Relaxed),
        }
    }
}

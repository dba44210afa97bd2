// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Hot-reloadable compaction configuration (§6).

use std::sync::RwLock;

use serde_derive::Deserialize;

/// A limit value of `-1` disables the corresponding check; any other
/// negative value is nonsensical but must not cause a filter to reject all
/// candidates (§6), so callers route all comparisons through
/// [`Limit::admits`] rather than comparing raw integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit(i64);

impl Limit {
    pub const UNLIMITED: Limit = Limit(-1);

    pub fn new(raw: i64) -> Self {
        if raw < 0 {
            Limit::UNLIMITED
        } else {
            Limit(raw)
        }
    }

    /// `true` if `current` running count may still admit one more task
    /// under this limit.
    pub fn admits(self, current: u32) -> bool {
        match self.0 {
            n if n < 0 => true,
            n => (current as i64) < n,
        }
    }

    pub fn value(self) -> Option<u32> {
        if self.0 < 0 {
            None
        } else {
            Some(self.0 as u32)
        }
    }
}

impl From<i64> for Limit {
    fn from(raw: i64) -> Self {
        Limit::new(raw)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enable_compaction: bool,
    pub max_compaction_task_num: i64,
    pub max_compaction_task_per_disk: i64,
    pub max_level_0_compaction_task: i64,
    pub max_level_1_compaction_task: i64,
    pub min_compaction_failure_interval_sec: i64,
    pub vertical_compaction_max_columns_per_group: i64,
    pub cumulative_compaction_trace_threshold_sec: i64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enable_compaction: true,
            max_compaction_task_num: 10,
            max_compaction_task_per_disk: 2,
            max_level_0_compaction_task: -1,
            max_level_1_compaction_task: -1,
            min_compaction_failure_interval_sec: 120,
            vertical_compaction_max_columns_per_group: 5,
            cumulative_compaction_trace_threshold_sec: 2,
        }
    }
}

impl CompactionConfig {
    pub fn max_compaction_task_num(&self) -> Limit {
        Limit::new(self.max_compaction_task_num)
    }

    pub fn max_compaction_task_per_disk(&self) -> Limit {
        Limit::new(self.max_compaction_task_per_disk)
    }

    pub fn max_level_0_compaction_task(&self) -> Limit {
        Limit::new(self.max_level_0_compaction_task)
    }

    pub fn max_level_1_compaction_task(&self) -> Limit {
        Limit::new(self.max_level_1_compaction_task)
    }

    pub fn level_limit(&self, level: crate::tablet::CompactionLevel) -> Limit {
        match level {
            crate::tablet::CompactionLevel::Cumulative => self.max_level_0_compaction_task(),
            crate::tablet::CompactionLevel::Base => self.max_level_1_compaction_task(),
        }
    }

    /// Wall-time threshold in milliseconds past which a finished task's
    /// trace is dumped (§6); `None` if disabled (`-1`).
    pub fn cumulative_compaction_trace_threshold_ms(&self) -> Option<i64> {
        if self.cumulative_compaction_trace_threshold_sec < 0 {
            None
        } else {
            Some(self.cumulative_compaction_trace_threshold_sec.saturating_mul(1000))
        }
    }
}

/// Hot-swappable handle shared between the scheduler loop, task
/// registration, and the filter stage. Readers take a cheap read lock on
/// every loop iteration, per §6's "ranges must be re-read every loop
/// iteration" requirement.
#[derive(Debug)]
pub struct SharedConfig {
    inner: RwLock<CompactionConfig>,
}

impl SharedConfig {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    pub fn load(&self) -> CompactionConfig {
        self.inner.read().unwrap().clone()
    }

    pub fn update(&self, config: CompactionConfig) {
        *self.inner.write().unwrap() = config;
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(CompactionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_limit_is_unlimited() {
        let limit = Limit::new(-1);
        assert!(limit.admits(0));
        assert!(limit.admits(1_000_000));
        assert_eq!(limit.value(), None);
    }

    #[test]
    fn zero_limit_admits_nothing() {
        let limit = Limit::new(0);
        assert!(!limit.admits(0));
    }

    #[test]
    fn positive_limit_admits_below_threshold() {
        let limit = Limit::new(2);
        assert!(limit.admits(0));
        assert!(limit.admits(1));
        assert!(!limit.admits(2));
    }

    #[test]
    fn trace_threshold_disabled_at_negative_value() {
        let mut config = CompactionConfig::default();
        assert_eq!(
            config.cumulative_compaction_trace_threshold_ms(),
            Some(2000)
        );
        config.cumulative_compaction_trace_threshold_sec = -1;
        assert_eq!(config.cumulative_compaction_trace_threshold_ms(), None);
    }

    #[test]
    fn shared_config_hot_reload() {
        let shared = SharedConfig::default();
        assert!(shared.load().enable_compaction);
        let mut updated = shared.load();
        updated.enable_compaction = false;
        shared.update(updated);
        assert!(!shared.load().enable_compaction);
    }
}

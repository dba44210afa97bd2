// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Turns a candidate tablet into a concrete `CompactionTask`.
//!
//! Grounded on `compaction_task_factory.cpp` (original_source): the same
//! algorithm-choice rule (column count vs. configured group width) and the
//! same field population order (level, inputs, output version, algorithm).

use std::sync::Arc;

use crate::{
    compaction::{
        registry::CandidateRegistry,
        task::{CompactionAlgorithm, CompactionAlgorithmRunner, CompactionTask},
    },
    config::SharedConfig,
    tablet::TabletHandle,
};

/// Builds compaction tasks for candidate tablets that the scheduler has
/// already decided to pursue.
pub struct CompactionTaskFactory {
    config: Arc<SharedConfig>,
    runner: Arc<dyn CompactionAlgorithmRunner>,
}

impl CompactionTaskFactory {
    pub fn new(config: Arc<SharedConfig>, runner: Arc<dyn CompactionAlgorithmRunner>) -> Self {
        Self { config, runner }
    }

    /// Vertical merge once the schema is wider than the configured group
    /// size, horizontal otherwise. Schema introspection lives in the
    /// storage engine, not here, so callers that care about real column
    /// counts pass them in; a caller with no opinion passes `1` and always
    /// gets horizontal.
    pub fn choose_algorithm(&self, num_columns: usize) -> CompactionAlgorithm {
        let max_columns_per_group = self.config.load().vertical_compaction_max_columns_per_group;
        if max_columns_per_group > 0 && num_columns as i64 > max_columns_per_group {
            CompactionAlgorithm::Vertical
        } else {
            CompactionAlgorithm::Horizontal
        }
    }

    /// `None` if the tablet no longer has anything to compact (a benign
    /// race between the candidate pick and this call) or already has an
    /// active task.
    pub fn create_task(
        &self,
        registry: &CandidateRegistry,
        tablet: Arc<dyn TabletHandle>,
        num_columns: usize,
    ) -> Option<Arc<CompactionTask>> {
        if tablet.current_task().is_some() {
            return None;
        }
        let (level, inputs, output_version) = tablet.compaction_inputs()?;
        let algorithm = self.choose_algorithm(num_columns);
        let task_id = registry.next_compaction_task_id();
        Some(CompactionTask::new(
            task_id,
            tablet,
            level,
            inputs,
            output_version,
            algorithm,
            self.runner.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CompactionConfig,
        tablet::{CompactionLevel, FakeDataDir, FakeTablet},
        compaction::task::FakeAlgorithmRunner,
        rowset::{Rowset, Version},
    };

    fn factory(max_columns_per_group: i64) -> CompactionTaskFactory {
        let mut cfg = CompactionConfig::default();
        cfg.vertical_compaction_max_columns_per_group = max_columns_per_group;
        CompactionTaskFactory::new(
            Arc::new(SharedConfig::new(cfg)),
            Arc::new(FakeAlgorithmRunner::default()),
        )
    }

    #[test]
    fn narrow_schema_is_horizontal() {
        let f = factory(5);
        assert_eq!(f.choose_algorithm(3), CompactionAlgorithm::Horizontal);
    }

    #[test]
    fn wide_schema_is_vertical() {
        let f = factory(5);
        assert_eq!(f.choose_algorithm(20), CompactionAlgorithm::Vertical);
    }

    #[test]
    fn disabled_group_limit_is_always_horizontal() {
        let f = factory(-1);
        assert_eq!(f.choose_algorithm(5_000), CompactionAlgorithm::Horizontal);
    }

    #[test]
    fn create_task_none_when_tablet_has_no_work() {
        let reg = CandidateRegistry::new(
            Arc::new(SharedConfig::default()),
            Arc::new(crate::metrics::CompactionMetrics::default()),
        );
        let dir = FakeDataDir::new("/data0");
        let tablet = FakeTablet::new(1, dir);
        let f = factory(5);
        assert!(f.create_task(&reg, tablet, 1).is_none());
        reg.shutdown();
    }

    #[test]
    fn create_task_populates_fields_from_compaction_inputs() {
        let reg = CandidateRegistry::new(
            Arc::new(SharedConfig::default()),
            Arc::new(crate::metrics::CompactionMetrics::default()),
        );
        let dir = FakeDataDir::new("/data0");
        let tablet = FakeTablet::new(1, dir);
        {
            let mut ctx = tablet.context();
            ctx.insert_rowset(0, Arc::new(Rowset::new(Version::new(0, 9), 10, 100)));
            ctx.set_score(CompactionLevel::Cumulative, 2.0);
        }
        let f = factory(5);
        let task = f.create_task(&reg, tablet, 1).unwrap();
        assert_eq!(task.compaction_level(), CompactionLevel::Cumulative);
        assert_eq!(task.input_rowsets().len(), 1);
        assert_eq!(task.algorithm(), CompactionAlgorithm::Horizontal);
        reg.shutdown();
    }
}

// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Per-tablet leveled view of rowsets plus per-level compaction score.
//!
//! Maintained by the tablet, not the scheduler (§4.F): the control plane
//! only ever calls `compaction_score()`/`compaction_level()` on it through
//! `TabletHandle`. Kept as a standalone struct (rather than inlined into
//! `FakeTablet`) so its invariants can be unit-tested in isolation.

use std::{collections::BTreeSet, sync::Arc};

use crate::{
    rowset::{strictly_precedes, Rowset, Version, VersionOrdKey},
    tablet::{CompactionLevel, LEVEL_COUNT},
};

/// One rowset entry ordered within its level by `VersionOrdKey`.
#[derive(Debug)]
struct LevelEntry {
    key: VersionOrdKey,
    rowset: Arc<Rowset>,
}

impl PartialEq for LevelEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for LevelEntry {}
impl PartialOrd for LevelEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for LevelEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

#[derive(Default, Debug)]
struct Level {
    rowsets: BTreeSet<LevelEntry>,
}

impl Level {
    /// Insert a rowset, asserting (debug builds only, per §9 Open Questions)
    /// that it does not overlap any rowset already in this level.
    fn insert(&mut self, rowset: Arc<Rowset>) {
        if cfg!(debug_assertions) {
            for existing in &self.rowsets {
                let a = existing.rowset.version();
                let b = rowset.version();
                let disjoint = strictly_precedes(a, b) || strictly_precedes(b, a);
                debug_assert!(
                    disjoint,
                    "overlapping rowsets inserted into one compaction level: {a} vs {b}"
                );
            }
        }
        self.rowsets.insert(LevelEntry {
            key: rowset.version().into(),
            rowset,
        });
    }

    fn remove_by_version(&mut self, version: Version) -> bool {
        let key = VersionOrdKey::from(version);
        let probe = LevelEntry {
            key,
            rowset: Arc::new(Rowset::new(version, 0, 0)),
        };
        self.rowsets.remove(&probe)
    }

    fn rowsets_ordered(&self) -> Vec<Arc<Rowset>> {
        self.rowsets.iter().map(|e| e.rowset.clone()).collect()
    }
}

/// Per-tablet leveled partition of rowsets. `L = LEVEL_COUNT` levels; the
/// first `L - 1` each carry a compaction score, the last is the terminal
/// sink with no score of its own.
#[derive(Debug)]
pub struct CompactionContext {
    levels: [Level; LEVEL_COUNT],
    scores: [f64; LEVEL_COUNT - 1],
    current_level: Option<CompactionLevel>,
}

impl Default for CompactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CompactionContext {
    pub fn new() -> Self {
        Self {
            levels: Default::default(),
            scores: [0.0; LEVEL_COUNT - 1],
            current_level: None,
        }
    }

    /// Insert a rowset into a level (0-indexed, `< LEVEL_COUNT`).
    pub fn insert_rowset(&mut self, level: usize, rowset: Arc<Rowset>) {
        self.levels[level].insert(rowset);
    }

    /// Set the score for a non-terminal level and recompute `current_level`
    /// as the highest-scoring one (StarRocks picks the level with the larger
    /// need; ties favor cumulative since it is cheaper to run).
    pub fn set_score(&mut self, level: CompactionLevel, score: f64) {
        debug_assert!(score >= 0.0, "compaction scores must be non-negative");
        self.scores[level.as_index() as usize] = score;
        self.recompute_current_level();
    }

    fn recompute_current_level(&mut self) {
        let cumu = self.scores[CompactionLevel::Cumulative.as_index() as usize];
        let base = self.scores[CompactionLevel::Base.as_index() as usize];
        self.current_level = if cumu <= 0.0 && base <= 0.0 {
            None
        } else if base > cumu {
            Some(CompactionLevel::Base)
        } else {
            Some(CompactionLevel::Cumulative)
        };
    }

    /// Max of the per-level scores, per §4.F.
    pub fn compaction_score(&self) -> f64 {
        self.scores.iter().cloned().fold(0.0, f64::max)
    }

    pub fn compaction_level(&self) -> Option<CompactionLevel> {
        self.current_level
    }

    /// `true` iff any level has positive score.
    pub fn need_compaction(&self) -> bool {
        self.compaction_score() > 0.0
    }

    /// The rowsets and output version for the currently-selected level.
    pub fn compaction_inputs(&self) -> Option<(CompactionLevel, Vec<Arc<Rowset>>, Version)> {
        let level = self.current_level?;
        let rowsets = self.levels[level.as_index() as usize].rowsets_ordered();
        if rowsets.is_empty() {
            return None;
        }
        let versions: Vec<Version> = rowsets.iter().map(|r| r.version()).collect();
        let output_version = Version::union(&versions)?;
        Some((level, rowsets, output_version))
    }

    /// Apply a commit: remove `removed` rowsets from whichever level they sit
    /// in, insert `added` into the level the removed set came from. Returns
    /// an error message (to be wrapped as `InvariantViolated`) if a removed
    /// rowset cannot be found, since that indicates caller/engine corruption
    /// rather than a control-plane-recoverable condition.
    pub fn apply_modification(
        &mut self,
        added: Vec<Arc<Rowset>>,
        removed: Vec<Arc<Rowset>>,
    ) -> Result<(), String> {
        let mut target_level = None;
        for rowset in &removed {
            let mut found = false;
            for (idx, level) in self.levels.iter_mut().enumerate() {
                if level.remove_by_version(rowset.version()) {
                    target_level = Some(target_level.unwrap_or(idx));
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(format!(
                    "rowset {} not found in any level during commit",
                    rowset.version()
                ));
            }
        }
        let level_idx = target_level.unwrap_or(0);
        for rowset in added {
            self.levels[level_idx].insert(rowset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rowset(start: i64, end: i64, rows: u64) -> Arc<Rowset> {
        Arc::new(Rowset::new(Version::new(start, end), rows, 1024))
    }

    #[test]
    fn no_score_means_no_compaction() {
        let ctx = CompactionContext::new();
        assert!(!ctx.need_compaction());
        assert_eq!(ctx.compaction_level(), None);
    }

    #[test]
    fn score_selects_current_level() {
        let mut ctx = CompactionContext::new();
        ctx.set_score(CompactionLevel::Cumulative, 3.0);
        assert_eq!(ctx.compaction_level(), Some(CompactionLevel::Cumulative));
        ctx.set_score(CompactionLevel::Base, 5.0);
        assert_eq!(ctx.compaction_level(), Some(CompactionLevel::Base));
        assert_eq!(ctx.compaction_score(), 5.0);
    }

    #[test]
    fn compaction_inputs_spans_level_rowsets() {
        let mut ctx = CompactionContext::new();
        ctx.insert_rowset(0, rowset(0, 9, 100));
        ctx.insert_rowset(0, rowset(10, 19, 100));
        ctx.set_score(CompactionLevel::Cumulative, 2.0);

        let (level, rowsets, version) = ctx.compaction_inputs().unwrap();
        assert_eq!(level, CompactionLevel::Cumulative);
        assert_eq!(rowsets.len(), 2);
        assert_eq!(version.start, 0);
        assert_eq!(version.end, 19);
    }

    #[test]
    fn apply_modification_replaces_inputs_with_output() {
        let mut ctx = CompactionContext::new();
        let r0 = rowset(0, 9, 100);
        let r1 = rowset(10, 19, 100);
        ctx.insert_rowset(0, r0.clone());
        ctx.insert_rowset(0, r1.clone());

        let merged = rowset(0, 19, 200);
        ctx.apply_modification(vec![merged.clone()], vec![r0, r1]).unwrap();

        let remaining = ctx.levels[0].rowsets_ordered();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].version(), merged.version());
    }

    #[test]
    fn apply_modification_missing_input_is_error() {
        let mut ctx = CompactionContext::new();
        let phantom = rowset(0, 9, 100);
        let err = ctx.apply_modification(vec![], vec![phantom]).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "overlapping rowsets")]
    fn overlapping_insert_panics_in_debug() {
        let mut ctx = CompactionContext::new();
        ctx.insert_rowset(0, rowset(0, 10, 100));
        ctx.insert_rowset(0, rowset(5, 15, 100));
    }
}

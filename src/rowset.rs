// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Rowset data model: the immutable, versioned, sorted chunks a tablet is
//! made of.

use std::{
    cmp::Ordering,
    fmt,
    sync::atomic::{AtomicBool, Ordering as AtomicOrdering},
};

/// Closed integer range identifying a rowset's contribution to a tablet's
/// history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub start: i64,
    pub end: i64,
}

impl Version {
    pub fn new(start: i64, end: i64) -> Self {
        debug_assert!(start <= end, "version range must be non-empty: {start}..{end}");
        Self { start, end }
    }

    /// The union version spanning `[min(start), max(end)]` of a set of input
    /// versions, used as a compaction task's output version.
    pub fn union(versions: &[Version]) -> Option<Version> {
        let mut iter = versions.iter();
        let first = *iter.next()?;
        let (start, end) = iter.fold((first.start, first.end), |(s, e), v| {
            (s.min(v.start), e.max(v.end))
        });
        Some(Version { start, end })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// An immutable, versioned, sorted chunk of a tablet's data.
///
/// Only the attributes the control plane needs to rank and merge rowsets are
/// modeled here; the on-disk representation is an external collaborator
/// (§1 Non-goals).
#[derive(Debug)]
pub struct Rowset {
    version: Version,
    num_rows: u64,
    disk_size: u64,
    /// Set once the output rowset of a successful compaction has been
    /// preloaded (warmed). Tests assert on this instead of a real cache.
    loaded: AtomicBool,
}

impl Rowset {
    pub fn new(version: Version, num_rows: u64, disk_size: u64) -> Self {
        Self {
            version,
            num_rows,
            disk_size,
            loaded: AtomicBool::new(false),
        }
    }

    pub fn start_version(&self) -> i64 {
        self.version.start
    }

    pub fn end_version(&self) -> i64 {
        self.version.end
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub fn data_disk_size(&self) -> u64 {
        self.disk_size
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(AtomicOrdering::Relaxed)
    }

    /// Preload (warm-cache) this rowset. The real engine would touch disk
    /// here; the control plane only needs the success/failure signal.
    pub fn load(&self) -> Result<(), String> {
        self.loaded.store(true, AtomicOrdering::Relaxed);
        Ok(())
    }
}

/// Strict non-overlap ordering used to sort rowsets by `start_version`
/// within a level.
///
/// `a < b` iff `a.end_version < b.start_version`: this is not a classical
/// total order (two overlapping rowsets compare neither less-than nor
/// greater-than each other), so callers must guarantee the rowsets they
/// insert into the same level never overlap. See `CompactionLevelSet` for
/// the debug-mode assertion that catches a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionOrdKey {
    pub start: i64,
    pub end: i64,
}

impl From<Version> for VersionOrdKey {
    fn from(v: Version) -> Self {
        Self {
            start: v.start,
            end: v.end,
        }
    }
}

impl PartialOrd for VersionOrdKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionOrdKey {
    /// Total order used only for `BTreeSet` storage: sorts by
    /// `start_version`, tie-broken by `end_version`. Non-overlap is a
    /// precondition enforced separately (`debug_assert!` at insertion time),
    /// not by this comparator, since `a.end < b.start` alone is not
    /// transitive enough to build a `BTreeSet` on.
    fn cmp(&self, other: &Self) -> Ordering {
        self.start.cmp(&other.start).then(self.end.cmp(&other.end))
    }
}

/// `true` iff `a` strictly precedes `b` with no overlap, matching the
/// reference engine's `RowsetComparator`.
pub fn strictly_precedes(a: Version, b: Version) -> bool {
    a.start < b.start && a.end < b.start
}

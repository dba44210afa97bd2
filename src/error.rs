// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Error types for the compaction control plane.

use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CompactionError {
    #[snafu(display(
        "Compaction task rejected by quota, tablet_id:{}, level:{:?}, reason:{}.\nBacktrace:\n{}",
        tablet_id,
        level,
        reason,
        backtrace
    ))]
    ConfigRejected {
        tablet_id: u64,
        level: crate::tablet::CompactionLevel,
        reason: String,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Resource temporarily busy, tablet_id:{}, reason:{}.\nBacktrace:\n{}",
        tablet_id,
        reason,
        backtrace
    ))]
    ResourceBusy {
        tablet_id: u64,
        reason: String,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Compaction validation failed, tablet_id:{}, input_rows:{}, output_rows:{}, \
         merged_rows:{}, filtered_rows:{}.\nBacktrace:\n{}",
        tablet_id,
        input_rows,
        output_rows,
        merged_rows,
        filtered_rows,
        backtrace
    ))]
    ValidationFailed {
        tablet_id: u64,
        input_rows: u64,
        output_rows: u64,
        merged_rows: u64,
        filtered_rows: u64,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "I/O error during compaction, tablet_id:{}, msg:{}.\nBacktrace:\n{}",
        tablet_id,
        msg,
        backtrace
    ))]
    Io {
        tablet_id: u64,
        msg: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Compaction task cancelled, tablet_id:{}", tablet_id))]
    Cancelled { tablet_id: u64 },

    #[snafu(display(
        "Invariant violated, tablet_id:{}, msg:{}.\nBacktrace:\n{}",
        tablet_id,
        msg,
        backtrace
    ))]
    InvariantViolated {
        tablet_id: u64,
        msg: String,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, CompactionError>;

impl CompactionError {
    /// Whether this error should update the per-(tablet, level) failure
    /// timestamp used for backoff. `Cancelled` deliberately does not, so a
    /// restart can retry promptly.
    pub fn should_update_failure_time(&self) -> bool {
        !matches!(self, CompactionError::Cancelled { .. })
    }

    /// Whether this error should halt the scheduler entirely.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CompactionError::InvariantViolated { .. })
    }
}

// SPDX-License-Identifier: GPL-3.0-only

use diskman_sys::SysError;
use diskman_table::{CodecError, CorruptReason};
use diskman_types::{LayoutError, LayoutViolation};
use thiserror::Error;

fn restore_note(restored: &bool) -> &'static str {
    if *restored {
        "previous table left intact"
    } else {
        "new table staged in the journal, recover before using the disk"
    }
}

/// Errors returned by planning and committing
#[derive(Error, Debug)]
pub enum Error {
    #[error("corrupt partition table: {0}")]
    CorruptTable(CorruptReason),

    #[error("layout invariant violated: {0}")]
    LayoutInvariantViolation(#[from] LayoutViolation),

    #[error("partition {} not found", .0 + 1)]
    PartitionNotFound(u32),

    #[error("invalid size: {0}")]
    InvalidSize(String),

    #[error("insufficient space: {detail}")]
    InsufficientSpace {
        detail: String,
        /// Entry index of the partition in the way, if any
        blocked_by: Option<u32>,
    },

    #[error("partition table is full ({capacity} entries)")]
    TableFull { capacity: u32 },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("partition table on {device} changed since it was read")]
    ConcurrentModification { device: String },

    #[error("plan was made against a different layout than the one loaded from {device}")]
    StalePlan { device: String },

    #[error("plan shrinks partitions and loses data; it must be acknowledged before commit")]
    DataLossNotAcknowledged,

    #[error("transaction cancelled before commit")]
    Cancelled,

    #[error("commit failed ({}): {source}", restore_note(.restored))]
    CommitFailed { source: SysError, restored: bool },

    #[error(transparent)]
    Storage(#[from] SysError),
}

impl From<CodecError> for Error {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::CorruptTable(reason) => Error::CorruptTable(reason),
            CodecError::TooManyEntries { capacity, .. } => Error::TableFull { capacity },
            other @ CodecError::Unrepresentable { .. } => Error::Unsupported(other.to_string()),
        }
    }
}

impl From<LayoutError> for Error {
    fn from(error: LayoutError) -> Self {
        match error {
            LayoutError::Invariant(violation) => Error::LayoutInvariantViolation(violation),
            LayoutError::PartitionNotFound(index) => Error::PartitionNotFound(index),
            other => Error::Unsupported(other.to_string()),
        }
    }
}

/// Result type alias for planner and engine operations
pub type Result<T> = std::result::Result<T, Error>;

// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SectorRange;

/// A broken layout invariant, naming the entries involved
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayoutViolation {
    #[error("partition {first} ({first_range}) overlaps partition {second} ({second_range})")]
    Overlap {
        first: u32,
        first_range: SectorRange,
        second: u32,
        second_range: SectorRange,
    },

    #[error("partition {index} ({range}) lies outside the usable sectors {usable}")]
    OutOfRange {
        index: u32,
        range: SectorRange,
        usable: SectorRange,
    },

    #[error("entry index {index} is used by more than one partition")]
    DuplicateIndex { index: u32 },
}

/// Error types for layout operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error(transparent)]
    Invariant(#[from] LayoutViolation),

    #[error("partition {0} not found")]
    PartitionNotFound(u32),

    #[error("disk of {total_sectors} sectors is too small for a {format} table")]
    GeometryTooSmall { format: String, total_sectors: u64 },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}

/// Result type alias for layout operations
pub type Result<T> = std::result::Result<T, LayoutError>;

// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Why a table image could not be read
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorruptReason {
    #[error("no partition table signature")]
    MissingSignature,

    #[error("{copy} GPT header checksum mismatch")]
    HeaderChecksum { copy: &'static str },

    #[error("{copy} GPT partition entry array checksum mismatch")]
    EntryArrayChecksum { copy: &'static str },

    #[error("{copy} GPT header: {detail}")]
    BadHeader { copy: &'static str, detail: String },

    #[error("table declares {declared} entries but holds at most {capacity}")]
    EntryCountExceedsCapacity { declared: u32, capacity: u32 },

    #[error("entry {slot}: {detail}")]
    BadEntry { slot: u32, detail: String },

    #[error("table region at byte {offset} ({len} bytes) was not read")]
    MissingRegion { offset: u64, len: usize },
}

/// Error types for table encoding and decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("corrupt partition table: {0}")]
    CorruptTable(#[from] CorruptReason),

    #[error("{format} table holds at most {capacity} entries, layout needs {needed}")]
    TooManyEntries {
        format: String,
        needed: u32,
        capacity: u32,
    },

    #[error("cannot be stored in a {format} table: {detail}")]
    Unrepresentable { format: String, detail: String },
}

impl CodecError {
    pub(crate) fn unrepresentable(format: impl ToString, detail: impl Into<String>) -> Self {
        CodecError::Unrepresentable {
            format: format.to_string(),
            detail: detail.into(),
        }
    }
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

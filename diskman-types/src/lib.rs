// SPDX-License-Identifier: GPL-3.0-only

//! Partition layout model for diskman
//!
//! This crate defines the in-memory view of a partitioned disk that every
//! other crate of the workspace speaks:
//!
//! - **diskman-table**: decodes on-disk tables into a `Layout` and back
//! - **diskman-core**: plans edits as `Layout` to `Layout` transformations
//! - **diskman-cli**: renders layouts, segments and the type catalog
//!
//! ## Invariants
//!
//! A valid `Layout` has unique entry indices, every partition inside the
//! table's usable sectors, and no two partitions sharing a sector. Layouts are
//! immutable values: `insert`, `remove` and `resize` return new layouts.

pub mod common;
pub mod disk;
pub mod error;
pub mod layout;
pub mod partition;
pub mod partition_types;
pub mod segments;

pub use common::{
    DEFAULT_ALIGNMENT_BYTES, SectorRange, align_up, bytes_to_pretty, parse_sectors,
    partition_device_path, short_size,
};
pub use disk::{
    DOS_ENTRY_SLOTS, DiskId, GPT_DEFAULT_ENTRIES, GPT_ENTRY_ARRAY_BYTES, GPT_ENTRY_SIZE, Geometry,
    TableFormat, TableLabel, dos_usable, gpt_default_usable, gpt_entry_sectors,
};
pub use error::{LayoutError, LayoutViolation, Result};
pub use layout::{Layout, validate};
pub use partition::{
    PARTITION_FLAG_LEGACY_BIOS_BOOTABLE, PARTITION_FLAG_SYSTEM, Partition, PartitionType,
};
pub use partition_types::{PartitionTypeInfo, PartitionTypeInfoFlags};
pub use segments::{
    Segment, SegmentAnomaly, SegmentComputation, SegmentKind, compute_segments, find_free_start,
};

// SPDX-License-Identifier: GPL-3.0-only

//! Partition type catalog and utilities
//!
//! Provides partition type information for GPT and DOS/MBR partition tables.
//! Used by the codecs (for display names), the planner (for type resolution)
//! and the command line (for listings).

mod catalog;
mod query;

use serde::{Deserialize, Serialize};

pub use catalog::PARTITION_TYPES;
pub use query::{find_by_name, get_all_partition_type_infos};

/// Flags describing a partition type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PartitionTypeInfoFlags {
    /// No flags set.
    #[default]
    None = 0,
    /// Partition type is used for swap.
    Swap = (1 << 0),
    /// Partition type is used for RAID/LVM or similar.
    Raid = (1 << 1),
    /// Partition type indicates the partition is hidden
    /// (e.g. 'dos' type 0x1b "Hidden W95 FAT32").
    /// Note that this is not the same as user-toggleable
    /// attributes/flags for a partition.
    Hidden = (1 << 2),
    /// Partition type can only be used when creating a partition
    /// (e.g. 'dos' type 0x05, 0x0f and 0x85 for extended partitions).
    CreateOnly = (1 << 3),
    /// Partition type indicates the partition is part of the system / bootloader
    /// (e.g. 'dos' types 0xee, 0xef, 'gpt' types for 'EFI System' and 'BIOS boot').
    System = (1 << 4),
}

impl<'de> Deserialize<'de> for PartitionTypeInfoFlags {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "" => Ok(PartitionTypeInfoFlags::None),
            "None" => Ok(PartitionTypeInfoFlags::None),
            "Swap" => Ok(PartitionTypeInfoFlags::Swap),
            "Raid" => Ok(PartitionTypeInfoFlags::Raid),
            "Hidden" => Ok(PartitionTypeInfoFlags::Hidden),
            "CreateOnly" => Ok(PartitionTypeInfoFlags::CreateOnly),
            "System" => Ok(PartitionTypeInfoFlags::System),
            _ => Err(serde::de::Error::custom(format!("Unknown flag: {}", s))),
        }
    }
}

/// Detailed information about a partition type.
///
/// `table_subtype` is used to break the set of partition types for
/// `table_type` into a logical subsets. It is typically only used in
/// user interfaces where the partition type is selected.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PartitionTypeInfo {
    /// A partition table type e.g. `dos` or `gpt`
    pub table_type: String,
    /// A partition table sub-type
    pub table_subtype: String,
    /// A partition type
    pub ty: String,
    /// Name of the partition
    pub name: String,
    /// Flags describing the partition type
    #[serde(default)]
    pub flags: PartitionTypeInfoFlags,
    /// Default filesystem type for this partition type
    #[serde(default)]
    pub filesystem_type: String,
    /// Alternative names accepted when resolving user input
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl PartitionTypeInfo {
    pub fn find_by_id(type_id: String) -> Option<PartitionTypeInfo> {
        query::find_by_id(type_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_loads_both_tables() {
        assert!(!get_all_partition_type_infos("dos").is_empty());
        assert!(!get_all_partition_type_infos("gpt").is_empty());
        assert!(get_all_partition_type_infos("apm").is_empty());
    }

    #[test]
    fn swap_type_is_flagged() {
        let info = PartitionTypeInfo::find_by_id("0x82".to_string()).unwrap();
        assert_eq!(info.flags, PartitionTypeInfoFlags::Swap);
        assert_eq!(info.filesystem_type, "swap");
    }

    #[test]
    fn names_resolve_case_insensitively_and_through_aliases() {
        assert_eq!(find_by_name("gpt", "efi system").unwrap().ty, "c12a7328-f81f-11d2-ba4b-00a0c93ec93b");
        assert_eq!(find_by_name("gpt", "Linux").unwrap().ty, "0fc63daf-8483-4772-8e79-3d69d8477de4");
        assert!(find_by_name("dos", "no such type").is_none());
    }
}

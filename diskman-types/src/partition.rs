// SPDX-License-Identifier: GPL-3.0-only

//! Partition entries - flat representation

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::partition_types::{PartitionTypeInfo, find_by_name};
use crate::{SectorRange, TableFormat};

/// Attribute bit values shared by both table formats.
/// Values match the GPT attribute bits (and udisks2::partition::PartitionFlags).
pub const PARTITION_FLAG_SYSTEM: u64 = 1;
pub const PARTITION_FLAG_LEGACY_BIOS_BOOTABLE: u64 = 4;

/// Partition type identifier (MBR type code or GPT type GUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionType {
    Dos(u8),
    Gpt(Uuid),
}

impl PartitionType {
    /// Table format this type belongs to
    pub fn format(&self) -> TableFormat {
        match self {
            Self::Dos(_) => TableFormat::Dos,
            Self::Gpt(_) => TableFormat::Gpt,
        }
    }

    /// The identifier as stored in the type catalog ("0x83" or a lowercase GUID)
    pub fn id(&self) -> String {
        match self {
            Self::Dos(code) => format!("0x{code:02x}"),
            Self::Gpt(guid) => guid.to_string(),
        }
    }

    /// Short identifier for table listings ("83", or the first GUID group)
    pub fn short_id(&self) -> String {
        match self {
            Self::Dos(code) => format!("{code:x}"),
            Self::Gpt(guid) => guid.to_string().chars().take(8).collect(),
        }
    }

    /// Catalog entry for this type, if known
    pub fn info(&self) -> Option<PartitionTypeInfo> {
        PartitionTypeInfo::find_by_id(self.id())
    }

    /// Human-readable name of the type ("Linux", "Linux swap", ...)
    pub fn name(&self) -> String {
        self.info()
            .map(|info| info.name)
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Resolve a user-supplied type for a table of `format`.
    ///
    /// Accepts catalog names ("Linux", "EFI System"), dos codes ("83", "0x83")
    /// and GPT type GUIDs.
    pub fn parse(format: TableFormat, input: &str) -> Option<Self> {
        let input = input.trim();

        if let Some(info) = find_by_name(format.as_str(), input) {
            return Self::from_catalog_id(format, &info.ty);
        }

        Self::from_catalog_id(format, input)
    }

    fn from_catalog_id(format: TableFormat, id: &str) -> Option<Self> {
        match format {
            TableFormat::Dos => {
                let hex = id
                    .strip_prefix("0x")
                    .or_else(|| id.strip_prefix("0X"))
                    .unwrap_or(id);
                u8::from_str_radix(hex, 16).ok().map(Self::Dos)
            }
            TableFormat::Gpt => Uuid::parse_str(id).ok().map(Self::Gpt),
        }
    }

    /// Unused slot marker in either format
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Dos(code) => *code == 0,
            Self::Gpt(guid) => guid.is_nil(),
        }
    }
}

impl std::fmt::Display for PartitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// A single partition table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Entry slot in the table (0-based, stable across reordering)
    pub index: u32,

    /// First sector (inclusive)
    pub start: u64,

    /// Last sector (inclusive)
    pub end: u64,

    /// Partition type identifier
    pub kind: PartitionType,

    /// Partition name (GPT only, empty for MBR)
    pub label: String,

    /// Attribute bits (see `PARTITION_FLAG_*`)
    pub flags: u64,

    /// Unique partition GUID (GPT only)
    pub uuid: Option<Uuid>,
}

impl Partition {
    pub fn new(index: u32, range: SectorRange, kind: PartitionType) -> Self {
        Self {
            index,
            start: range.start,
            end: range.end,
            kind,
            label: String::new(),
            flags: 0,
            uuid: None,
        }
    }

    /// Sector span of this partition
    pub fn range(&self) -> SectorRange {
        SectorRange::new(self.start, self.end)
    }

    /// Number of sectors
    pub fn sectors(&self) -> u64 {
        self.range().len()
    }

    /// 1-based partition number as used in device names
    pub fn number(&self) -> u32 {
        self.index + 1
    }

    /// Check if the legacy BIOS bootable flag is set
    pub fn is_legacy_bios_bootable(&self) -> bool {
        (self.flags & PARTITION_FLAG_LEGACY_BIOS_BOOTABLE) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_types_by_name_code_and_guid() {
        assert_eq!(
            PartitionType::parse(TableFormat::Dos, "Linux"),
            Some(PartitionType::Dos(0x83))
        );
        assert_eq!(
            PartitionType::parse(TableFormat::Dos, "linux swap"),
            Some(PartitionType::Dos(0x82))
        );
        assert_eq!(
            PartitionType::parse(TableFormat::Dos, "0x0c"),
            Some(PartitionType::Dos(0x0c))
        );
        assert_eq!(
            PartitionType::parse(TableFormat::Dos, "ef"),
            Some(PartitionType::Dos(0xef))
        );

        let linux_fs = Uuid::parse_str("0fc63daf-8483-4772-8e79-3d69d8477de4").unwrap();
        assert_eq!(
            PartitionType::parse(TableFormat::Gpt, "Linux"),
            Some(PartitionType::Gpt(linux_fs))
        );
        assert_eq!(
            PartitionType::parse(TableFormat::Gpt, "0FC63DAF-8483-4772-8E79-3D69D8477DE4"),
            Some(PartitionType::Gpt(linux_fs))
        );
        assert_eq!(PartitionType::parse(TableFormat::Gpt, "83"), None);
    }

    #[test]
    fn names_come_from_the_catalog() {
        assert_eq!(PartitionType::Dos(0x83).name(), "Linux");
        assert_eq!(PartitionType::Dos(0x82).name(), "Linux swap");
        assert_eq!(PartitionType::Dos(0x83).short_id(), "83");
        assert_eq!(PartitionType::Dos(0xfe).name(), "Unknown");
    }

    #[test]
    fn flag_helpers_read_bits() {
        let mut partition = Partition::new(0, SectorRange::new(2048, 4095), PartitionType::Dos(0x83));
        assert!(!partition.is_legacy_bios_bootable());
        partition.flags = PARTITION_FLAG_LEGACY_BIOS_BOOTABLE | PARTITION_FLAG_SYSTEM;
        assert!(partition.is_legacy_bios_bootable());
        assert_eq!(partition.number(), 1);
        assert_eq!(partition.sectors(), 2048);
    }

    #[test]
    fn partition_roundtrips_through_json() {
        let mut partition = Partition::new(1, SectorRange::new(34, 2047), PartitionType::Gpt(Uuid::nil()));
        partition.label = "root".to_string();
        let json = serde_json::to_string(&partition).expect("serialize partition");
        let parsed: Partition = serde_json::from_str(&json).expect("deserialize partition");
        assert_eq!(parsed, partition);
    }
}

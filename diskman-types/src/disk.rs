// SPDX-License-Identifier: GPL-3.0-only

//! Disk geometry and partition table labels

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SectorRange;
use crate::error::{LayoutError, Result};

/// Number of primary entry slots in a dos/MBR table
pub const DOS_ENTRY_SLOTS: u32 = 4;

/// Size in bytes of one GPT partition entry
pub const GPT_ENTRY_SIZE: u32 = 128;

/// Default (and maximum supported) number of GPT entry slots
pub const GPT_DEFAULT_ENTRIES: u32 = 128;

/// Bytes reserved for a GPT partition entry array
pub const GPT_ENTRY_ARRAY_BYTES: u64 = (GPT_ENTRY_SIZE as u64) * (GPT_DEFAULT_ENTRIES as u64);

/// Partition table type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    /// MBR/DOS (Master Boot Record)
    Dos,

    /// GPT (GUID Partition Table)
    Gpt,
}

impl TableFormat {
    /// Convert to the conventional short name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt => "gpt",
            Self::Dos => "dos",
        }
    }

    /// Parse from the conventional names, accepting the usual aliases
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "gpt" => Some(Self::Gpt),
            "dos" | "mbr" | "msdos" => Some(Self::Dos),
            _ => None,
        }
    }

    /// Whether entries of this format carry a human-readable name
    pub fn supports_labels(&self) -> bool {
        matches!(self, Self::Gpt)
    }
}

impl std::fmt::Display for TableFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TableFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Invalid table type: {s}. Must be 'gpt' or 'dos'/'mbr'"))
    }
}

/// Physical shape of a disk as seen through its logical sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Total number of logical sectors
    pub total_sectors: u64,

    /// Logical sector size in bytes (addressing unit of the table)
    pub logical_sector_size: u32,

    /// Physical sector size in bytes
    pub physical_sector_size: u32,
}

impl Geometry {
    pub fn new(total_sectors: u64, logical_sector_size: u32, physical_sector_size: u32) -> Result<Self> {
        if logical_sector_size < 512 || !logical_sector_size.is_power_of_two() {
            return Err(LayoutError::InvalidGeometry(format!(
                "logical sector size {logical_sector_size} is not a power of two >= 512"
            )));
        }
        if physical_sector_size < logical_sector_size
            || physical_sector_size % logical_sector_size != 0
        {
            return Err(LayoutError::InvalidGeometry(format!(
                "physical sector size {physical_sector_size} is not a multiple of {logical_sector_size}"
            )));
        }
        if total_sectors == 0 {
            return Err(LayoutError::InvalidGeometry("disk has no sectors".to_string()));
        }

        Ok(Self {
            total_sectors,
            logical_sector_size,
            physical_sector_size,
        })
    }

    /// Derive the geometry of a device of `size_bytes` bytes
    pub fn from_size(size_bytes: u64, logical_sector_size: u32, physical_sector_size: u32) -> Result<Self> {
        let sector = u64::from(logical_sector_size.max(1));
        Self::new(size_bytes / sector, logical_sector_size, physical_sector_size)
    }

    /// Total size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.total_sectors * u64::from(self.logical_sector_size)
    }

    /// Byte offset of a sector
    pub fn offset_of(&self, sector: u64) -> u64 {
        sector * u64::from(self.logical_sector_size)
    }

    /// Last addressable sector
    pub fn last_sector(&self) -> u64 {
        self.total_sectors - 1
    }

    /// Number of sectors that make up `bytes` (rounded up)
    pub fn sectors_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(u64::from(self.logical_sector_size))
    }
}

/// Identity of the table itself (MBR disk signature or GPT disk GUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskId {
    Dos(u32),
    Gpt(Uuid),
}

impl DiskId {
    /// Derive a fresh identifier for `format` from a random UUID
    pub fn generate(format: TableFormat, seed: Uuid) -> Self {
        match format {
            TableFormat::Gpt => Self::Gpt(seed),
            TableFormat::Dos => {
                let bytes = seed.as_bytes();
                Self::Dos(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
        }
    }

    pub fn format(&self) -> TableFormat {
        match self {
            Self::Dos(_) => TableFormat::Dos,
            Self::Gpt(_) => TableFormat::Gpt,
        }
    }
}

impl std::fmt::Display for DiskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dos(signature) => write!(f, "0x{signature:08x}"),
            Self::Gpt(guid) => write!(f, "{guid}"),
        }
    }
}

/// Table-wide metadata: format, identity, usable area and slot capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLabel {
    pub format: TableFormat,
    pub disk_id: DiskId,

    /// Sectors partitions may occupy
    pub usable: SectorRange,

    /// Number of entry slots in the table
    pub capacity: u32,
}

impl TableLabel {
    /// Default label of a freshly created table on `geometry`
    pub fn new(geometry: &Geometry, disk_id: DiskId) -> Result<Self> {
        let format = disk_id.format();
        let too_small = || LayoutError::GeometryTooSmall {
            format: format.to_string(),
            total_sectors: geometry.total_sectors,
        };

        let (usable, capacity) = match format {
            TableFormat::Dos => {
                if geometry.total_sectors < 2 {
                    return Err(too_small());
                }
                (dos_usable(geometry), DOS_ENTRY_SLOTS)
            }
            TableFormat::Gpt => {
                let usable = gpt_default_usable(geometry).ok_or_else(too_small)?;
                (usable, GPT_DEFAULT_ENTRIES)
            }
        };

        Ok(Self {
            format,
            disk_id,
            usable,
            capacity,
        })
    }
}

/// Usable area of a dos table: everything after sector 0 that 32-bit LBAs reach
pub fn dos_usable(geometry: &Geometry) -> SectorRange {
    SectorRange::new(1, geometry.last_sector().min(u64::from(u32::MAX)))
}

/// Sectors occupied by one copy of the GPT entry array
pub fn gpt_entry_sectors(geometry: &Geometry) -> u64 {
    geometry.sectors_for(GPT_ENTRY_ARRAY_BYTES)
}

/// Usable area between the primary and backup GPT structures
pub fn gpt_default_usable(geometry: &Geometry) -> Option<SectorRange> {
    let entries = gpt_entry_sectors(geometry);
    let first = 2 + entries;
    let last = geometry.total_sectors.checked_sub(2 + entries)?;
    (first <= last).then(|| SectorRange::new(first, last))
}

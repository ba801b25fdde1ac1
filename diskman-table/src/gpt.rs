// SPDX-License-Identifier: GPL-3.0-only

//! GUID partition tables
//!
//! Regions written for a disk of `N` sectors with `E` entry-array sectors:
//! the protective MBR table area, the primary header (LBA 1), the primary
//! entry array (LBA 2), the backup entry array (LBA `N - 1 - E`) and the
//! backup header (LBA `N - 1`). Checksums are computed with `gpt_disk_types`.

use diskman_types::{
    DiskId, GPT_DEFAULT_ENTRIES, GPT_ENTRY_SIZE, Geometry, Layout, Partition, PartitionType,
    SectorRange, TableFormat, TableLabel, gpt_entry_sectors,
};
use gpt_disk_types::{
    BlockSize, Crc32, GptHeader, GptPartitionEntryArray, Guid, LbaLe, U32Le,
};
use tracing::warn;
use uuid::Uuid;

use crate::TableCodec;
use crate::error::{CodecError, CorruptReason, Result};
use crate::image::{RegionSpan, TableImage};
use crate::mbr::{MBR_TABLE_LEN, MBR_TABLE_OFFSET, protective_table};

pub(crate) const HEADER_SIGNATURE: &[u8; 8] = b"EFI PART";
const HEADER_REVISION: u32 = 0x0001_0000;
const HEADER_SIZE: u32 = 92;

/// Longest partition name in UTF-16 code units
pub const MAX_NAME_UNITS: usize = 36;

const NAME_AT: usize = 56;

/// The fields of one header copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeaderFields {
    my_lba: u64,
    alternate_lba: u64,
    first_usable: u64,
    last_usable: u64,
    disk_guid: Uuid,
    entry_lba: u64,
    entry_count: u32,
    entries_crc: u32,
}

impl HeaderFields {
    fn to_gpt_header(self) -> GptHeader {
        let mut header = GptHeader {
            my_lba: LbaLe::from_u64(self.my_lba),
            alternate_lba: LbaLe::from_u64(self.alternate_lba),
            first_usable_lba: LbaLe::from_u64(self.first_usable),
            last_usable_lba: LbaLe::from_u64(self.last_usable),
            disk_guid: Guid::from_bytes(self.disk_guid.to_bytes_le()),
            partition_entry_lba: LbaLe::from_u64(self.entry_lba),
            number_of_partition_entries: U32Le::from_u32(self.entry_count),
            size_of_partition_entry: U32Le::from_u32(GPT_ENTRY_SIZE),
            partition_entry_array_crc32: Crc32(U32Le::from_u32(self.entries_crc)),
            ..Default::default()
        };
        header.update_header_crc32();
        header
    }

    fn header_crc(self) -> u32 {
        self.to_gpt_header().header_crc32.0.to_u32()
    }

    /// One sector holding this header
    fn to_sector(self, sector_size: usize) -> Vec<u8> {
        let mut out = vec![0u8; sector_size];
        out[0..8].copy_from_slice(HEADER_SIGNATURE);
        out[8..12].copy_from_slice(&HEADER_REVISION.to_le_bytes());
        out[12..16].copy_from_slice(&HEADER_SIZE.to_le_bytes());
        out[16..20].copy_from_slice(&self.header_crc().to_le_bytes());
        out[24..32].copy_from_slice(&self.my_lba.to_le_bytes());
        out[32..40].copy_from_slice(&self.alternate_lba.to_le_bytes());
        out[40..48].copy_from_slice(&self.first_usable.to_le_bytes());
        out[48..56].copy_from_slice(&self.last_usable.to_le_bytes());
        out[56..72].copy_from_slice(&self.disk_guid.to_bytes_le());
        out[72..80].copy_from_slice(&self.entry_lba.to_le_bytes());
        out[80..84].copy_from_slice(&self.entry_count.to_le_bytes());
        out[84..88].copy_from_slice(&GPT_ENTRY_SIZE.to_le_bytes());
        out[88..92].copy_from_slice(&self.entries_crc.to_le_bytes());
        out
    }
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// GUIDs are stored with their first three groups little-endian
fn guid_at(bytes: &[u8], at: usize) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[at..at + 16]);
    Uuid::from_bytes_le(raw)
}

fn block_size(sector_size: u32) -> Option<BlockSize> {
    matches!(sector_size, 512 | 4096)
        .then(|| BlockSize::new(sector_size))
        .flatten()
}

/// Bytes occupied by `entry_count` entries, rounded up to whole sectors
fn entry_array_len(entry_count: u32, sector_size: u32) -> usize {
    let bytes = u64::from(entry_count) * u64::from(GPT_ENTRY_SIZE);
    (bytes.div_ceil(u64::from(sector_size)) * u64::from(sector_size)) as usize
}

/// CRC32 of the first `entry_count` entries of `storage`
fn entry_array_crc(
    storage: &[u8],
    entry_count: u32,
    sector_size: u32,
) -> std::result::Result<u32, String> {
    let header = GptHeader {
        partition_entry_lba: LbaLe::from_u64(2),
        number_of_partition_entries: U32Le::from_u32(entry_count),
        size_of_partition_entry: U32Le::from_u32(GPT_ENTRY_SIZE),
        ..Default::default()
    };
    let layout = header
        .get_partition_entry_array_layout()
        .map_err(|e| format!("invalid entry array: {e:?}"))?;
    let block_size =
        block_size(sector_size).ok_or_else(|| format!("unsupported sector size {sector_size}"))?;

    let mut buf = storage.to_vec();
    let array = GptPartitionEntryArray::new(layout, block_size, &mut buf)
        .map_err(|e| format!("invalid entry array: {e:?}"))?;
    Ok(array.calculate_crc32().0.to_u32())
}

/// Read and verify one header copy and its entry array
fn read_copy(
    geometry: &Geometry,
    image: &TableImage,
    header_lba: u64,
    copy: &'static str,
) -> std::result::Result<(HeaderFields, Vec<Partition>), CorruptReason> {
    let bad = |detail: String| CorruptReason::BadHeader { copy, detail };
    let sector_size = geometry.logical_sector_size;
    let offset = geometry.offset_of(header_lba);
    let raw = image
        .slice(offset, HEADER_SIZE as usize)
        .ok_or(CorruptReason::MissingRegion {
            offset,
            len: HEADER_SIZE as usize,
        })?;

    if &raw[0..8] != HEADER_SIGNATURE {
        return Err(bad("no EFI PART signature".to_string()));
    }
    let revision = le_u32(raw, 8);
    if revision != HEADER_REVISION {
        return Err(bad(format!("unsupported revision 0x{revision:08x}")));
    }
    let header_size = le_u32(raw, 12);
    if header_size != HEADER_SIZE {
        return Err(bad(format!("header size {header_size}, expected {HEADER_SIZE}")));
    }

    let stored_crc = le_u32(raw, 16);
    if le_u32(raw, 20) != 0 {
        return Err(bad("reserved field is not zero".to_string()));
    }
    let fields = HeaderFields {
        my_lba: le_u64(raw, 24),
        alternate_lba: le_u64(raw, 32),
        first_usable: le_u64(raw, 40),
        last_usable: le_u64(raw, 48),
        disk_guid: guid_at(raw, 56),
        entry_lba: le_u64(raw, 72),
        entry_count: le_u32(raw, 80),
        entries_crc: le_u32(raw, 88),
    };
    if fields.header_crc() != stored_crc {
        return Err(CorruptReason::HeaderChecksum { copy });
    }

    if fields.my_lba != header_lba {
        return Err(bad(format!("claims to live at LBA {}", fields.my_lba)));
    }
    let entry_size = le_u32(raw, 84);
    if entry_size != GPT_ENTRY_SIZE {
        return Err(bad(format!("entry size {entry_size}, expected {GPT_ENTRY_SIZE}")));
    }
    if fields.entry_count > GPT_DEFAULT_ENTRIES {
        return Err(CorruptReason::EntryCountExceedsCapacity {
            declared: fields.entry_count,
            capacity: GPT_DEFAULT_ENTRIES,
        });
    }
    if fields.entry_count == 0 {
        return Err(bad("no entry slots".to_string()));
    }
    if fields.first_usable > fields.last_usable || fields.last_usable >= geometry.total_sectors {
        return Err(bad(format!(
            "usable sectors {}-{} do not fit the disk",
            fields.first_usable, fields.last_usable
        )));
    }

    let entries_offset = geometry.offset_of(fields.entry_lba);
    let entries_len = entry_array_len(fields.entry_count, sector_size);
    let entries = image
        .slice(entries_offset, entries_len)
        .ok_or(CorruptReason::MissingRegion {
            offset: entries_offset,
            len: entries_len,
        })?;

    let crc = entry_array_crc(entries, fields.entry_count, sector_size).map_err(bad)?;
    if crc != fields.entries_crc {
        return Err(CorruptReason::EntryArrayChecksum { copy });
    }

    let mut partitions = Vec::new();
    for slot in 0..fields.entry_count {
        let entry = &entries[slot as usize * GPT_ENTRY_SIZE as usize..][..GPT_ENTRY_SIZE as usize];
        let kind = guid_at(entry, 0);
        if kind.is_nil() {
            continue;
        }

        let units: Vec<u16> = entry[NAME_AT..]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|unit| *unit != 0)
            .collect();

        partitions.push(Partition {
            index: slot,
            start: le_u64(entry, 32),
            end: le_u64(entry, 40),
            kind: PartitionType::Gpt(kind),
            label: String::from_utf16_lossy(&units),
            flags: le_u64(entry, 48),
            uuid: Some(guid_at(entry, 16)),
        });
    }

    Ok((fields, partitions))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GptCodec;

impl GptCodec {
    fn entry_spans(geometry: &Geometry) -> (RegionSpan, RegionSpan) {
        let sector = u64::from(geometry.logical_sector_size);
        let entry_sectors = gpt_entry_sectors(geometry);
        let len = (entry_sectors * sector) as usize;
        let backup_lba = geometry
            .last_sector()
            .saturating_sub(entry_sectors);
        (
            RegionSpan::new(2 * sector, len),
            RegionSpan::new(backup_lba * sector, len),
        )
    }
}

impl TableCodec for GptCodec {
    fn format(&self) -> TableFormat {
        TableFormat::Gpt
    }

    fn spans(&self, geometry: &Geometry) -> Vec<RegionSpan> {
        let sector = geometry.logical_sector_size as usize;
        let (primary_entries, backup_entries) = Self::entry_spans(geometry);
        vec![
            RegionSpan::new(MBR_TABLE_OFFSET, MBR_TABLE_LEN),
            RegionSpan::new(geometry.offset_of(1), sector),
            primary_entries,
            backup_entries,
            RegionSpan::new(geometry.offset_of(geometry.last_sector()), sector),
        ]
    }

    fn decode(&self, geometry: &Geometry, image: &TableImage) -> Result<Layout> {
        let (fields, partitions) = match read_copy(geometry, image, 1, "primary") {
            Ok(copy) => copy,
            Err(primary) => {
                match read_copy(geometry, image, geometry.last_sector(), "backup") {
                    Ok(copy) => {
                        warn!("primary GPT unusable ({primary}), using the backup copy");
                        copy
                    }
                    Err(backup) => {
                        warn!("backup GPT unusable as well: {backup}");
                        return Err(primary.into());
                    }
                }
            }
        };

        let label = TableLabel {
            format: TableFormat::Gpt,
            disk_id: DiskId::Gpt(fields.disk_guid),
            usable: SectorRange::new(fields.first_usable, fields.last_usable),
            capacity: fields.entry_count,
        };

        Ok(Layout::new(*geometry, label, partitions))
    }

    fn encode(&self, layout: &Layout) -> Result<TableImage> {
        let format = TableFormat::Gpt;
        let geometry = layout.geometry();
        let label = layout.label();
        let sector_size = geometry.logical_sector_size;

        if block_size(sector_size).is_none() {
            return Err(CodecError::unrepresentable(
                format,
                format!("{sector_size}-byte sectors are not supported"),
            ));
        }
        let DiskId::Gpt(disk_guid) = label.disk_id else {
            return Err(CodecError::unrepresentable(format, "disk identifier is not a GUID"));
        };

        let capacity = label.capacity;
        if capacity == 0 || capacity > GPT_DEFAULT_ENTRIES {
            return Err(CodecError::TooManyEntries {
                format: format.to_string(),
                needed: capacity,
                capacity: GPT_DEFAULT_ENTRIES,
            });
        }
        if layout.len() > capacity as usize {
            return Err(CodecError::TooManyEntries {
                format: format.to_string(),
                needed: layout.len() as u32,
                capacity,
            });
        }

        let entry_sectors = gpt_entry_sectors(geometry);
        let last = geometry.last_sector();
        let lowest = 2 + entry_sectors;
        let highest = last.checked_sub(1 + entry_sectors);
        if label.usable.start < lowest
            || highest.is_none_or(|highest| label.usable.end > highest)
            || label.usable.is_empty()
        {
            return Err(CodecError::unrepresentable(
                format,
                format!("usable sectors {} collide with the GPT structures", label.usable),
            ));
        }

        let (primary_span, backup_span) = Self::entry_spans(geometry);
        let mut entries = vec![0u8; primary_span.len];
        let mut used = vec![false; capacity as usize];

        for partition in layout.partitions() {
            let number = partition.number();
            let reject = |detail: String| {
                CodecError::unrepresentable(format, format!("partition {number}: {detail}"))
            };

            if partition.index >= capacity {
                return Err(CodecError::TooManyEntries {
                    format: format.to_string(),
                    needed: partition.index + 1,
                    capacity,
                });
            }
            let slot = partition.index as usize;
            if used[slot] {
                return Err(reject("entry slot used twice".to_string()));
            }
            used[slot] = true;

            let PartitionType::Gpt(kind) = partition.kind else {
                return Err(reject(format!("dos type {} on a GPT table", partition.kind.id())));
            };
            if kind.is_nil() {
                return Err(reject("the nil type GUID marks an empty slot".to_string()));
            }
            let Some(unique) = partition.uuid else {
                return Err(reject("missing unique partition GUID".to_string()));
            };
            let units: Vec<u16> = partition.label.encode_utf16().collect();
            if units.len() > MAX_NAME_UNITS || units.contains(&0) {
                return Err(reject(format!(
                    "name {:?} is longer than {MAX_NAME_UNITS} UTF-16 units or contains NUL",
                    partition.label
                )));
            }

            let entry = &mut entries[slot * GPT_ENTRY_SIZE as usize..][..GPT_ENTRY_SIZE as usize];
            entry[0..16].copy_from_slice(&kind.to_bytes_le());
            entry[16..32].copy_from_slice(&unique.to_bytes_le());
            entry[32..40].copy_from_slice(&partition.start.to_le_bytes());
            entry[40..48].copy_from_slice(&partition.end.to_le_bytes());
            entry[48..56].copy_from_slice(&partition.flags.to_le_bytes());
            for (i, unit) in units.iter().enumerate() {
                entry[NAME_AT + 2 * i..NAME_AT + 2 * i + 2].copy_from_slice(&unit.to_le_bytes());
            }
        }

        let used_len = entry_array_len(capacity, sector_size);
        let entries_crc = entry_array_crc(&entries, capacity, sector_size)
            .map_err(|detail| CodecError::unrepresentable(format, detail))?;

        // The backup array sits right in front of the backup header.
        let backup_entry_lba = last - (used_len as u64 / u64::from(sector_size));
        let mut backup_entries = vec![0u8; backup_span.len];
        let backup_at = (geometry.offset_of(backup_entry_lba) - backup_span.offset) as usize;
        backup_entries[backup_at..backup_at + used_len].copy_from_slice(&entries[..used_len]);

        let primary = HeaderFields {
            my_lba: 1,
            alternate_lba: last,
            first_usable: label.usable.start,
            last_usable: label.usable.end,
            disk_guid,
            entry_lba: 2,
            entry_count: capacity,
            entries_crc,
        };
        let backup = HeaderFields {
            my_lba: last,
            alternate_lba: 1,
            entry_lba: backup_entry_lba,
            ..primary
        };

        let sector = sector_size as usize;
        Ok(TableImage::new()
            .with_region(MBR_TABLE_OFFSET, protective_table(geometry))
            .with_region(geometry.offset_of(1), primary.to_sector(sector))
            .with_region(primary_span.offset, entries)
            .with_region(backup_span.offset, backup_entries)
            .with_region(geometry.offset_of(last), backup.to_sector(sector)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskman_types::PARTITION_FLAG_SYSTEM;

    const LINUX_FS: &str = "0fc63daf-8483-4772-8e79-3d69d8477de4";
    const ESP: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";

    fn sample(total: u64, sector_size: u32) -> Layout {
        let geometry = Geometry::new(total, sector_size, sector_size).unwrap();
        let label = TableLabel::new(
            &geometry,
            DiskId::Gpt(Uuid::parse_str("2f1d3b6a-7c55-4a0e-9d1e-5a8c4b7e9f10").unwrap()),
        )
        .unwrap();
        let first = label.usable.start;

        let mut esp = Partition::new(
            0,
            SectorRange::new(first + 100, first + 2047),
            PartitionType::Gpt(Uuid::parse_str(ESP).unwrap()),
        );
        esp.label = "EFI system partition".to_string();
        esp.flags = PARTITION_FLAG_SYSTEM;
        esp.uuid = Some(Uuid::parse_str("11111111-2222-4333-8444-555555555555").unwrap());

        let mut root = Partition::new(
            5,
            SectorRange::new(first + 4096, first + 8191),
            PartitionType::Gpt(Uuid::parse_str(LINUX_FS).unwrap()),
        );
        root.label = "racine ü".to_string();
        root.uuid = Some(Uuid::parse_str("66666666-7777-4888-9999-aaaaaaaaaaaa").unwrap());

        Layout::new(geometry, label, vec![esp, root])
    }

    fn flip(image: &TableImage, offset: u64) -> TableImage {
        let mut out = TableImage::new();
        for region in image.regions() {
            let mut bytes = region.bytes.clone();
            if region.span().overlaps(&RegionSpan::new(offset, 1)) {
                bytes[(offset - region.offset) as usize] ^= 0xff;
            }
            out.push(region.offset, bytes);
        }
        out
    }

    #[test]
    fn roundtrips_with_512_and_4096_byte_sectors() {
        for (total, sector_size) in [(8_388_608, 512), (1_048_576, 4096)] {
            let layout = sample(total, sector_size);
            let image = GptCodec.encode(&layout).unwrap();
            assert_eq!(image.spans(), GptCodec.spans(layout.geometry()));
            assert_eq!(GptCodec.decode(layout.geometry(), &image).unwrap(), layout);
        }
    }

    #[test]
    fn writes_a_protective_mbr_and_both_headers() {
        let layout = sample(8_388_608, 512);
        let image = GptCodec.encode(&layout).unwrap();

        let pmbr = image.slice(440, 72).unwrap();
        assert_eq!(pmbr[6 + 4], 0xee);
        assert_eq!(&pmbr[70..72], &[0x55, 0xaa]);

        assert_eq!(image.slice(512, 8), Some(&b"EFI PART"[..]));
        let backup_header = (8_388_608 - 1) * 512;
        assert_eq!(image.slice(backup_header, 8), Some(&b"EFI PART"[..]));
        // backup entries live at LBA N - 33
        let backup = image.slice(backup_header + 72, 8).unwrap();
        assert_eq!(u64::from_le_bytes(backup.try_into().unwrap()), 8_388_608 - 33);
    }

    #[test]
    fn damaged_primary_header_falls_back_to_backup() {
        let layout = sample(8_388_608, 512);
        let image = flip(&GptCodec.encode(&layout).unwrap(), 512 + 40);
        assert_eq!(GptCodec.decode(layout.geometry(), &image).unwrap(), layout);
    }

    #[test]
    fn damaged_primary_entries_fall_back_to_backup() {
        let layout = sample(8_388_608, 512);
        let image = flip(&GptCodec.encode(&layout).unwrap(), 2 * 512 + 33);
        assert_eq!(GptCodec.decode(layout.geometry(), &image).unwrap(), layout);
    }

    #[test]
    fn both_copies_damaged_is_corrupt() {
        let layout = sample(8_388_608, 512);
        let encoded = GptCodec.encode(&layout).unwrap();
        let image = flip(&flip(&encoded, 512 + 40), (8_388_608 - 1) * 512 + 40);
        assert_eq!(
            GptCodec.decode(layout.geometry(), &image),
            Err(CodecError::CorruptTable(CorruptReason::HeaderChecksum { copy: "primary" }))
        );
    }

    #[test]
    fn declared_entry_count_above_capacity_is_corrupt() {
        let layout = sample(8_388_608, 512);
        let geometry = *layout.geometry();
        let encoded = GptCodec.encode(&layout).unwrap();

        // Rewrite both headers with a checksum-valid but oversized entry count
        let mut image = TableImage::new();
        for region in encoded.regions() {
            let mut bytes = region.bytes.clone();
            if region.offset == 512 || region.offset == geometry.offset_of(geometry.last_sector()) {
                let (mut fields, _) = read_copy(&geometry, &encoded, region.offset / 512, "test").unwrap();
                fields.entry_count = 200;
                bytes = fields.to_sector(512);
            }
            image.push(region.offset, bytes);
        }

        assert_eq!(
            GptCodec.decode(&geometry, &image),
            Err(CodecError::CorruptTable(CorruptReason::EntryCountExceedsCapacity {
                declared: 200,
                capacity: 128,
            }))
        );
    }

    #[test]
    fn rejects_what_gpt_cannot_store() {
        let layout = sample(8_388_608, 512);
        let first = layout.label().usable.start;

        let mut long_name = layout.get(5).unwrap().clone();
        long_name.index = 6;
        long_name.start = first + 10_000;
        long_name.end = first + 10_100;
        long_name.label = "x".repeat(MAX_NAME_UNITS + 1);
        assert!(matches!(
            GptCodec.encode(&layout.insert(long_name)),
            Err(CodecError::Unrepresentable { .. })
        ));

        let mut beyond = layout.get(5).unwrap().clone();
        beyond.index = 128;
        beyond.start = first + 20_000;
        beyond.end = first + 20_100;
        assert!(matches!(
            GptCodec.encode(&layout.insert(beyond)),
            Err(CodecError::TooManyEntries { needed: 129, capacity: 128, .. })
        ));

        let dos_type = Partition::new(
            7,
            SectorRange::new(first + 30_000, first + 30_100),
            PartitionType::Dos(0x83),
        );
        assert!(matches!(
            GptCodec.encode(&layout.insert(dos_type)),
            Err(CodecError::Unrepresentable { .. })
        ));
    }
}

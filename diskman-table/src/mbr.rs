// SPDX-License-Identifier: GPL-3.0-only

//! Legacy "dos" (MBR) partition tables
//!
//! Only the partition table part of sector 0 is handled (bytes 440..512:
//! disk signature, four primary entries, boot signature). The boot code in
//! front of it is never read or written.

use diskman_types::{
    DOS_ENTRY_SLOTS, DiskId, Geometry, Layout, PARTITION_FLAG_LEGACY_BIOS_BOOTABLE, Partition,
    PartitionType, SectorRange, TableFormat, TableLabel, dos_usable,
};

use crate::TableCodec;
use crate::error::{CodecError, CorruptReason, Result};
use crate::image::{RegionSpan, TableImage};

/// Offset of the table area (disk signature) within sector 0
pub const MBR_TABLE_OFFSET: u64 = 440;

/// Length of the table area: signature, reserved word, 4 entries, boot signature
pub const MBR_TABLE_LEN: usize = 72;

const ENTRIES_AT: usize = 6;
const ENTRY_LEN: usize = 16;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xaa];

const STATUS_ACTIVE: u8 = 0x80;

/// Type code of the single entry of a GPT protective MBR
pub const PROTECTIVE_TYPE: u8 = 0xee;

/// A raw primary entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MbrEntry {
    pub status: u8,
    pub kind: u8,
    pub lba_start: u32,
    pub sectors: u32,
}

impl MbrEntry {
    fn read(bytes: &[u8]) -> Self {
        Self {
            status: bytes[0],
            kind: bytes[4],
            lba_start: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            sectors: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }

    /// Unused slots stay all zero
    fn write(&self, out: &mut [u8]) {
        if !self.is_used() {
            out.fill(0);
            return;
        }
        let last = self.lba_start.saturating_add(self.sectors.saturating_sub(1));
        out[0] = self.status;
        out[1..4].copy_from_slice(&lba_to_chs(self.lba_start));
        out[4] = self.kind;
        out[5..8].copy_from_slice(&lba_to_chs(last));
        out[8..12].copy_from_slice(&self.lba_start.to_le_bytes());
        out[12..16].copy_from_slice(&self.sectors.to_le_bytes());
    }

    fn is_used(&self) -> bool {
        self.kind != 0 && self.sectors != 0
    }
}

/// CHS address for `lba` using the usual 255 heads / 63 sectors translation.
///
/// Addresses past the CHS limit saturate to `fe ff ff`.
fn lba_to_chs(lba: u32) -> [u8; 3] {
    const HEADS: u32 = 255;
    const SECTORS: u32 = 63;

    let cylinder = lba / (HEADS * SECTORS);
    if cylinder > 1023 {
        return [0xfe, 0xff, 0xff];
    }
    let head = (lba / SECTORS) % HEADS;
    let sector = lba % SECTORS + 1;

    [
        head as u8,
        (((cylinder >> 2) & 0xc0) as u8) | sector as u8,
        (cylinder & 0xff) as u8,
    ]
}

/// Boot signature check on a table area or a whole sector 0
pub(crate) fn has_boot_signature(table: &[u8]) -> bool {
    table.len() >= MBR_TABLE_LEN && table[MBR_TABLE_LEN - 2..MBR_TABLE_LEN] == BOOT_SIGNATURE
}

/// Raw entries of a table area
pub(crate) fn read_entries(table: &[u8]) -> [MbrEntry; 4] {
    let mut entries = [MbrEntry::default(); 4];
    for (slot, entry) in entries.iter_mut().enumerate() {
        let at = ENTRIES_AT + slot * ENTRY_LEN;
        *entry = MbrEntry::read(&table[at..at + ENTRY_LEN]);
    }
    entries
}

/// Assemble a 72-byte table area
pub(crate) fn write_table(signature: u32, entries: &[MbrEntry; 4]) -> Vec<u8> {
    let mut table = vec![0u8; MBR_TABLE_LEN];
    table[0..4].copy_from_slice(&signature.to_le_bytes());
    for (slot, entry) in entries.iter().enumerate() {
        let at = ENTRIES_AT + slot * ENTRY_LEN;
        entry.write(&mut table[at..at + ENTRY_LEN]);
    }
    table[MBR_TABLE_LEN - 2..].copy_from_slice(&BOOT_SIGNATURE);
    table
}

/// Table area of a GPT protective MBR covering the whole disk
pub(crate) fn protective_table(geometry: &Geometry) -> Vec<u8> {
    let covered = geometry
        .total_sectors
        .saturating_sub(1)
        .min(u64::from(u32::MAX)) as u32;
    let mut entries = [MbrEntry::default(); 4];
    entries[0] = MbrEntry {
        status: 0,
        kind: PROTECTIVE_TYPE,
        lba_start: 1,
        sectors: covered,
    };
    write_table(0, &entries)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MbrCodec;

impl TableCodec for MbrCodec {
    fn format(&self) -> TableFormat {
        TableFormat::Dos
    }

    fn spans(&self, _geometry: &Geometry) -> Vec<RegionSpan> {
        vec![RegionSpan::new(MBR_TABLE_OFFSET, MBR_TABLE_LEN)]
    }

    fn decode(&self, geometry: &Geometry, image: &TableImage) -> Result<Layout> {
        let table = image.require(MBR_TABLE_OFFSET, MBR_TABLE_LEN)?;
        if !has_boot_signature(table) {
            return Err(CorruptReason::MissingSignature.into());
        }

        let signature = u32::from_le_bytes([table[0], table[1], table[2], table[3]]);
        let mut partitions = Vec::new();

        for (slot, entry) in read_entries(table).iter().enumerate() {
            let slot = slot as u32;
            if entry.status != 0 && entry.status != STATUS_ACTIVE {
                return Err(CorruptReason::BadEntry {
                    slot,
                    detail: format!("invalid status byte 0x{:02x}", entry.status),
                }
                .into());
            }
            if !entry.is_used() {
                continue;
            }

            let start = u64::from(entry.lba_start);
            let range = SectorRange::new(start, start + u64::from(entry.sectors) - 1);
            let mut partition = Partition::new(slot, range, PartitionType::Dos(entry.kind));
            if entry.status == STATUS_ACTIVE {
                partition.flags |= PARTITION_FLAG_LEGACY_BIOS_BOOTABLE;
            }
            partitions.push(partition);
        }

        let label = TableLabel {
            format: TableFormat::Dos,
            disk_id: DiskId::Dos(signature),
            usable: dos_usable(geometry),
            capacity: DOS_ENTRY_SLOTS,
        };

        Ok(Layout::new(*geometry, label, partitions))
    }

    fn encode(&self, layout: &Layout) -> Result<TableImage> {
        let format = TableFormat::Dos;
        let DiskId::Dos(signature) = layout.label().disk_id else {
            return Err(CodecError::unrepresentable(format, "disk identifier is a GUID"));
        };

        if layout.len() > DOS_ENTRY_SLOTS as usize {
            return Err(CodecError::TooManyEntries {
                format: format.to_string(),
                needed: layout.len() as u32,
                capacity: DOS_ENTRY_SLOTS,
            });
        }

        let mut entries = [MbrEntry::default(); 4];
        for partition in layout.partitions() {
            let number = partition.number();
            let reject = |detail: String| CodecError::unrepresentable(format, format!("partition {number}: {detail}"));

            if partition.index >= DOS_ENTRY_SLOTS {
                return Err(CodecError::TooManyEntries {
                    format: format.to_string(),
                    needed: partition.index + 1,
                    capacity: DOS_ENTRY_SLOTS,
                });
            }
            if entries[partition.index as usize].is_used() {
                return Err(reject("entry slot used twice".to_string()));
            }

            let PartitionType::Dos(kind) = partition.kind else {
                return Err(reject(format!("GPT type {} on a dos table", partition.kind.id())));
            };
            if kind == 0 {
                return Err(reject("type 0x00 marks an empty slot".to_string()));
            }
            if !partition.label.is_empty() {
                return Err(reject("dos entries have no name".to_string()));
            }
            if partition.uuid.is_some() {
                return Err(reject("dos entries have no unique GUID".to_string()));
            }
            if partition.flags & !PARTITION_FLAG_LEGACY_BIOS_BOOTABLE != 0 {
                return Err(reject(format!("attribute bits 0x{:x} need GPT", partition.flags)));
            }

            let lba_start = u32::try_from(partition.start)
                .map_err(|_| reject(format!("start sector {} needs more than 32 bits", partition.start)))?;
            let sectors = u32::try_from(partition.sectors())
                .map_err(|_| reject(format!("{} sectors need more than 32 bits", partition.sectors())))?;
            if sectors == 0 {
                return Err(reject(format!("empty range {}", partition.range())));
            }

            entries[partition.index as usize] = MbrEntry {
                status: if partition.is_legacy_bios_bootable() {
                    STATUS_ACTIVE
                } else {
                    0
                },
                kind,
                lba_start,
                sectors,
            };
        }

        Ok(TableImage::new().with_region(MBR_TABLE_OFFSET, write_table(signature, &entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry::new(8_388_608, 512, 512).unwrap()
    }

    fn sample() -> Layout {
        let geometry = geometry();
        let label = TableLabel::new(&geometry, DiskId::Dos(0xdead_beef)).unwrap();
        let mut boot = Partition::new(0, SectorRange::new(2048, 1026047), PartitionType::Dos(0x83));
        boot.flags = PARTITION_FLAG_LEGACY_BIOS_BOOTABLE;
        let swap = Partition::new(2, SectorRange::new(1026048, 2097151), PartitionType::Dos(0x82));
        Layout::new(geometry, label, vec![boot, swap])
    }

    #[test]
    fn roundtrips_entries_flags_and_slots() {
        let layout = sample();
        let image = MbrCodec.encode(&layout).unwrap();
        assert_eq!(image.spans(), vec![RegionSpan::new(440, 72)]);
        assert_eq!(MbrCodec.decode(&geometry(), &image).unwrap(), layout);
    }

    #[test]
    fn encodes_the_standard_entry_layout() {
        let image = MbrCodec.encode(&sample()).unwrap();
        let table = image.slice(440, 72).unwrap();

        assert_eq!(&table[0..4], &0xdead_beef_u32.to_le_bytes());
        assert_eq!(&table[70..72], &[0x55, 0xaa]);

        // first entry: active, Linux, LBA 2048, 1024000 sectors
        let entry = &table[6..22];
        assert_eq!(entry[0], 0x80);
        assert_eq!(&entry[1..4], &[32, 33, 0]);
        assert_eq!(entry[4], 0x83);
        assert_eq!(&entry[8..12], &2048u32.to_le_bytes());
        assert_eq!(&entry[12..16], &1_024_000u32.to_le_bytes());

        // slot 1 stays empty
        assert_eq!(&table[22..38], &[0u8; 16]);
    }

    #[test]
    fn protective_table_has_one_record() {
        let table = protective_table(&geometry());
        assert_eq!(table.len(), 72);
        assert_eq!(table[6 + 4], PROTECTIVE_TYPE);
        assert_eq!(&table[6 + 8..6 + 12], &1u32.to_le_bytes());
        assert!(table[22..70].iter().all(|b| *b == 0));
    }

    #[test]
    fn chs_saturates_past_the_limit() {
        assert_eq!(lba_to_chs(0), [0, 1, 0]);
        assert_eq!(lba_to_chs(63), [1, 1, 0]);
        assert_eq!(lba_to_chs(u32::MAX), [0xfe, 0xff, 0xff]);
    }

    #[test]
    fn missing_signature_is_corrupt() {
        let image = TableImage::new().with_region(440, vec![0; 72]);
        assert_eq!(
            MbrCodec.decode(&geometry(), &image),
            Err(CodecError::CorruptTable(CorruptReason::MissingSignature))
        );
    }

    #[test]
    fn bad_status_byte_is_corrupt() {
        let mut table = MbrCodec.encode(&sample()).unwrap().slice(440, 72).unwrap().to_vec();
        table[6] = 0x12;
        let image = TableImage::new().with_region(440, table);
        assert!(matches!(
            MbrCodec.decode(&geometry(), &image),
            Err(CodecError::CorruptTable(CorruptReason::BadEntry { slot: 0, .. }))
        ));
    }

    #[test]
    fn rejects_what_dos_cannot_store() {
        let layout = sample();

        let mut named = layout.get(0).unwrap().clone();
        named.index = 1;
        named.start = 3_000_000;
        named.end = 3_000_100;
        named.label = "root".to_string();
        assert!(matches!(
            MbrCodec.encode(&layout.insert(named)),
            Err(CodecError::Unrepresentable { .. })
        ));

        let far = Partition::new(
            1,
            SectorRange::new(u64::from(u32::MAX) + 10, u64::from(u32::MAX) + 20),
            PartitionType::Dos(0x83),
        );
        assert!(matches!(
            MbrCodec.encode(&layout.insert(far)),
            Err(CodecError::Unrepresentable { .. })
        ));

        let fifth = Partition::new(4, SectorRange::new(4_000_000, 4_000_100), PartitionType::Dos(0x83));
        assert!(matches!(
            MbrCodec.encode(&layout.insert(fifth)),
            Err(CodecError::TooManyEntries { capacity: 4, .. })
        ));
    }
}

// SPDX-License-Identifier: GPL-3.0-only

//! Text output in the style of `fdisk -l`

use std::fmt::Write as _;

use diskman_core::{Edit, Plan, PlanWarning};
use diskman_types::{
    Layout, SegmentKind, bytes_to_pretty, compute_segments, partition_device_path, short_size,
};

const HEADERS: [&str; 7] = ["Device", "Start", "End", "Sectors", "Size", "Id", "Type"];

/// Columns after the first are right aligned, except the last two
fn right_aligned(column: usize) -> bool {
    (1..=4).contains(&column)
}

fn table(rows: &[Vec<String>], headers: &[&str]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut out = line(headers.iter().copied(), &widths);
    out.push('\n');
    for row in rows {
        out.push_str(&line(row.iter().map(String::as_str), &widths));
        out.push('\n');
    }
    out
}

fn line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let mut out = String::new();
    for (i, cell) in cells.enumerate() {
        if i > 0 {
            out.push(' ');
        }
        if right_aligned(i) {
            let _ = write!(out, "{cell:>width$}", width = widths[i]);
        } else {
            let _ = write!(out, "{cell:<width$}", width = widths[i]);
        }
    }
    out.trim_end().to_string()
}

fn partition_rows(device: &str, layout: &Layout) -> Vec<Vec<String>> {
    let sector_size = u64::from(layout.geometry().logical_sector_size);
    layout
        .partitions()
        .iter()
        .map(|p| {
            let mut kind = p.kind.name();
            if !p.label.is_empty() {
                kind = format!("{kind} ({})", p.label);
            }
            vec![
                partition_device_path(device, p.number()),
                p.start.to_string(),
                p.end.to_string(),
                p.sectors().to_string(),
                short_size(p.sectors() * sector_size),
                p.kind.short_id(),
                kind,
            ]
        })
        .collect()
}

/// Disk summary and partition table
pub fn layout(device: &str, layout: &Layout) -> String {
    let geometry = layout.geometry();
    let label = layout.label();
    let mut out = String::new();

    let _ = writeln!(out, "Disk: {device}");
    let _ = writeln!(
        out,
        "Size: {}, {} sectors",
        bytes_to_pretty(&geometry.size_bytes(), true),
        geometry.total_sectors
    );
    let _ = writeln!(
        out,
        "Sector size (logical/physical): {} bytes / {} bytes",
        geometry.logical_sector_size, geometry.physical_sector_size
    );
    let _ = writeln!(out, "Disklabel type: {}", label.format);
    let _ = writeln!(out, "Disk identifier: {}", label.disk_id);
    let _ = writeln!(
        out,
        "Usable sectors: {} ({} of {} entries used)",
        label.usable,
        layout.len(),
        label.capacity
    );

    if !layout.is_empty() {
        out.push('\n');
        out.push_str(&table(&partition_rows(device, layout), &HEADERS));
    }
    out
}

/// Partitions, free space and reserved areas in disk order
pub fn segments(device: &str, layout: &Layout, alignment_bytes: u64) -> String {
    let computation = compute_segments(layout, alignment_bytes);
    let sector_size = u64::from(layout.geometry().logical_sector_size);

    let rows: Vec<Vec<String>> = computation
        .segments
        .iter()
        .map(|segment| {
            let range = segment.range();
            let (name, id, kind) = match (segment.kind, segment.partition_index) {
                (SegmentKind::Partition, Some(index)) => {
                    let partition = layout.get(index);
                    (
                        partition_device_path(device, index + 1),
                        partition.map(|p| p.kind.short_id()).unwrap_or_default(),
                        partition.map(|p| p.kind.name()).unwrap_or_default(),
                    )
                }
                (SegmentKind::FreeSpace, _) => ("-".to_string(), String::new(), "Free space".to_string()),
                _ => ("-".to_string(), String::new(), "Reserved".to_string()),
            };
            vec![
                name,
                range.start.to_string(),
                range.end.to_string(),
                segment.sectors.to_string(),
                short_size(segment.sectors * sector_size),
                id,
                kind,
            ]
        })
        .collect();

    let mut out = table(&rows, &HEADERS);
    for anomaly in &computation.anomalies {
        let _ = writeln!(out, "warning: {anomaly:?}");
    }
    out
}

/// What committing `plan` would change
pub fn plan(device: &str, plan: &Plan) -> String {
    let mut out = String::new();

    if plan.is_empty() {
        out.push_str("No changes.\n");
    }
    for edit in plan.edits() {
        let line = match edit {
            Edit::Create { partition } => format!(
                "create {} {} ({} sectors, {})",
                partition_device_path(device, partition.number()),
                partition.range(),
                partition.sectors(),
                partition.kind.name()
            ),
            Edit::Delete { index, range } => format!(
                "delete {} {range}",
                partition_device_path(device, index + 1)
            ),
            Edit::Resize {
                index,
                old_end,
                new_end,
            } => format!(
                "resize {} end {old_end} -> {new_end}",
                partition_device_path(device, index + 1)
            ),
        };
        let _ = writeln!(out, "  {line}");
    }

    for warning in plan.warnings() {
        let line = match warning {
            PlanWarning::Truncates {
                index,
                lost_sectors,
            } => format!(
                "warning: {} loses its last {lost_sectors} sectors",
                partition_device_path(device, index + 1)
            ),
            PlanWarning::Discards { index, sectors } => format!(
                "note: the {sectors} sectors of {} become free space",
                partition_device_path(device, index + 1)
            ),
        };
        let _ = writeln!(out, "{line}");
    }

    for violation in plan.violations() {
        let _ = writeln!(out, "invalid: {violation}");
    }

    out.push('\n');
    out.push_str(&layout(device, plan.target()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskman_types::{DiskId, Geometry, Partition, PartitionType, SectorRange, TableLabel};

    fn mockup_layout() -> Layout {
        let geometry = Geometry::new(8_388_608, 512, 512).unwrap();
        let label = TableLabel::new(&geometry, DiskId::Dos(0xdeadbeef)).unwrap();
        Layout::new(
            geometry,
            label,
            vec![
                Partition::new(0, SectorRange::new(2048, 1026047), PartitionType::Dos(0x83)),
                Partition::new(1, SectorRange::new(1026048, 2097151), PartitionType::Dos(0x82)),
                Partition::new(2, SectorRange::new(2097152, 8388607), PartitionType::Dos(0x83)),
            ],
        )
    }

    #[test]
    fn renders_the_fdisk_table() {
        let text = layout("/dev/nvme0n1", &mockup_layout());
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "Disk: /dev/nvme0n1");
        assert!(lines.contains(&"Disklabel type: dos"));
        assert!(lines.contains(&"Disk identifier: 0xdeadbeef"));

        let header = lines.iter().position(|l| l.starts_with("Device")).unwrap();
        assert_eq!(
            lines[header],
            "Device           Start     End Sectors Size Id Type"
        );
        assert_eq!(
            lines[header + 1],
            "/dev/nvme0n1p1    2048 1026047 1024000 500M 83 Linux"
        );
        assert_eq!(
            lines[header + 2],
            "/dev/nvme0n1p2 1026048 2097151 1071104 523M 82 Linux swap"
        );
        assert_eq!(
            lines[header + 3],
            "/dev/nvme0n1p3 2097152 8388607 6291456   3G 83 Linux"
        );
    }

    #[test]
    fn free_space_rows_follow_the_partitions() {
        let geometry = Geometry::new(8_388_608, 512, 512).unwrap();
        let label = TableLabel::new(&geometry, DiskId::Dos(1)).unwrap();
        let layout = Layout::new(
            geometry,
            label,
            vec![Partition::new(0, SectorRange::new(2048, 1026047), PartitionType::Dos(0x83))],
        );

        let text = segments("/dev/sda", &layout, 1024 * 1024);
        assert!(text.lines().any(|l| l.starts_with("/dev/sda1")));
        assert!(text.lines().any(|l| l.contains("Free space")));
        assert!(text.lines().any(|l| l.contains("Reserved")));
    }
}

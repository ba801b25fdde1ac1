// SPDX-License-Identifier: GPL-3.0-only

//! Disk segments: partitions, free space and reserved areas in disk order

use serde::Serialize;

use crate::common::align_up;
use crate::{Layout, SectorRange};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Partition,
    FreeSpace,
    Reserved,
}

/// A run of sectors; `start` is the first sector, `sectors` the length
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub start: u64,
    pub sectors: u64,
    pub partition_index: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum SegmentAnomaly {
    PartitionOverlapsPrevious {
        index: u32,
        partition_start: u64,
        previous_end: u64,
    },
    PartitionStartsPastUsable {
        index: u32,
        partition_start: u64,
        usable_end: u64,
    },
    PartitionEndPastUsable {
        index: u32,
        partition_end: u64,
        usable_end: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SegmentComputation {
    pub segments: Vec<Segment>,
    pub anomalies: Vec<SegmentAnomaly>,
}

impl Segment {
    pub fn free_space(start: u64, sectors: u64) -> Self {
        Self {
            kind: SegmentKind::FreeSpace,
            start,
            sectors,
            partition_index: None,
        }
    }

    pub fn reserved(start: u64, sectors: u64) -> Self {
        Self {
            kind: SegmentKind::Reserved,
            start,
            sectors,
            partition_index: None,
        }
    }

    pub fn partition(index: u32, start: u64, sectors: u64) -> Self {
        Self {
            kind: SegmentKind::Partition,
            start,
            sectors,
            partition_index: Some(index),
        }
    }

    /// Inclusive sector range of the segment
    pub fn range(&self) -> SectorRange {
        SectorRange::new(self.start, self.start + self.sectors.saturating_sub(1))
    }
}

fn push_aligned_gap_segments(
    segments: &mut Vec<Segment>,
    gap_start: u64,
    gap_end: u64,
    alignment_sectors: u64,
) {
    if gap_end <= gap_start {
        return;
    }

    let aligned_start = align_up(gap_start, alignment_sectors);

    if aligned_start >= gap_end {
        segments.push(Segment::reserved(gap_start, gap_end - gap_start));
        return;
    }

    if aligned_start > gap_start {
        segments.push(Segment::reserved(gap_start, aligned_start - gap_start));
    }

    segments.push(Segment::free_space(aligned_start, gap_end - aligned_start));
}

/// Split the whole disk into segments.
///
/// Sectors outside the table's usable area and alignment padding in front of
/// free space are reported as `Reserved`, so every `FreeSpace` segment starts
/// on an `alignment_bytes` boundary. Broken layouts still produce an ordered,
/// non-overlapping segment list; the problems are listed as anomalies.
pub fn compute_segments(layout: &Layout, alignment_bytes: u64) -> SegmentComputation {
    let geometry = layout.geometry();
    let total = geometry.total_sectors;
    let alignment_sectors = (alignment_bytes / u64::from(geometry.logical_sector_size)).max(1);

    let usable = layout.label().usable;
    let range_start = usable.start.min(total);
    let range_end = usable.end.saturating_add(1).min(total);

    let mut segments = Vec::new();
    let mut anomalies = Vec::new();

    if range_start > 0 {
        segments.push(Segment::reserved(0, range_start));
    }

    let mut current = range_start;

    for partition in layout.partitions() {
        let partition_start = partition.start;
        let partition_end = partition.end.saturating_add(1);
        if partition_end <= partition_start {
            continue;
        }

        if partition_start >= range_end {
            anomalies.push(SegmentAnomaly::PartitionStartsPastUsable {
                index: partition.index,
                partition_start,
                usable_end: range_end,
            });
            break;
        }

        if partition_start > current {
            push_aligned_gap_segments(&mut segments, current, partition_start, alignment_sectors);
            current = partition_start;
        } else if partition_start < current {
            anomalies.push(SegmentAnomaly::PartitionOverlapsPrevious {
                index: partition.index,
                partition_start,
                previous_end: current,
            });
        }

        let effective_end = if partition_end > range_end {
            anomalies.push(SegmentAnomaly::PartitionEndPastUsable {
                index: partition.index,
                partition_end,
                usable_end: range_end,
            });
            range_end
        } else {
            partition_end
        };

        // Overlapping entries are clamped so the output stays ordered.
        let effective_start = current.max(partition_start);
        let effective_size = effective_end.saturating_sub(effective_start);

        if effective_size > 0 {
            segments.push(Segment::partition(
                partition.index,
                effective_start,
                effective_size,
            ));
            current = effective_start + effective_size;
        }

        if current >= range_end {
            break;
        }
    }

    push_aligned_gap_segments(&mut segments, current, range_end, alignment_sectors);

    if range_end < total {
        segments.push(Segment::reserved(range_end, total - range_end));
    }

    SegmentComputation {
        segments,
        anomalies,
    }
}

/// First aligned start sector with room for `sectors` sectors
pub fn find_free_start(layout: &Layout, sectors: u64, alignment_bytes: u64) -> Option<u64> {
    compute_segments(layout, alignment_bytes)
        .segments
        .into_iter()
        .find(|s| s.kind == SegmentKind::FreeSpace && s.sectors >= sectors)
        .map(|s| s.start)
}

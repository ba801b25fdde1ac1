// SPDX-License-Identifier: GPL-3.0-only

//! Immutable partition layouts
//!
//! A [`Layout`] is the complete set of partition entries of one disk at a
//! point in time. Every edit returns a new value, so candidate layouts can be
//! validated, compared and thrown away without touching the one they came from.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{LayoutError, LayoutViolation, Result};
use crate::{Geometry, Partition, TableFormat, TableLabel};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layout {
    geometry: Geometry,
    label: TableLabel,

    /// Sorted by `(start, index)`
    partitions: Vec<Partition>,
}

impl Layout {
    /// Build a layout from decoded or planned entries.
    ///
    /// Entries are sorted but not validated; call [`Layout::validate`] before
    /// trusting the result.
    pub fn new(geometry: Geometry, label: TableLabel, mut partitions: Vec<Partition>) -> Self {
        sort_partitions(&mut partitions);
        Self {
            geometry,
            label,
            partitions,
        }
    }

    /// A table without any partitions
    pub fn empty(geometry: Geometry, label: TableLabel) -> Self {
        Self::new(geometry, label, Vec::new())
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn label(&self) -> &TableLabel {
        &self.label
    }

    pub fn format(&self) -> TableFormat {
        self.label.format
    }

    /// Partitions in start-sector order
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Look a partition up by its entry index
    pub fn get(&self, index: u32) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.index == index)
    }

    /// The partition that follows `index` on disk, if any
    pub fn next_after(&self, index: u32) -> Option<&Partition> {
        let position = self.partitions.iter().position(|p| p.index == index)?;
        self.partitions[position + 1..]
            .iter()
            .find(|p| p.index != index)
    }

    /// Lowest entry slot not used by any partition
    pub fn free_index(&self) -> Option<u32> {
        (0..self.label.capacity).find(|slot| self.get(*slot).is_none())
    }

    /// New layout containing `partition` in addition to the current entries
    pub fn insert(&self, partition: Partition) -> Self {
        let mut partitions = self.partitions.clone();
        partitions.push(partition);
        Self::new(self.geometry, self.label, partitions)
    }

    /// New layout without the entry `index`
    pub fn remove(&self, index: u32) -> Result<Self> {
        if self.get(index).is_none() {
            return Err(LayoutError::PartitionNotFound(index));
        }

        let partitions = self
            .partitions
            .iter()
            .filter(|p| p.index != index)
            .cloned()
            .collect();
        Ok(Self::new(self.geometry, self.label, partitions))
    }

    /// New layout where entry `index` ends at `new_end`; its start is unchanged
    pub fn resize(&self, index: u32, new_end: u64) -> Result<Self> {
        if self.get(index).is_none() {
            return Err(LayoutError::PartitionNotFound(index));
        }

        let partitions = self
            .partitions
            .iter()
            .map(|p| {
                let mut p = p.clone();
                if p.index == index {
                    p.end = new_end;
                }
                p
            })
            .collect();
        Ok(Self::new(self.geometry, self.label, partitions))
    }

    /// Check the layout invariants, reporting the first violation found
    pub fn validate(&self) -> std::result::Result<(), LayoutViolation> {
        match self.violations().into_iter().next() {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    /// Every broken invariant, in the order: index, range, overlap
    pub fn violations(&self) -> Vec<LayoutViolation> {
        let mut found = Vec::new();

        let mut seen: BTreeMap<u32, usize> = BTreeMap::new();
        for partition in &self.partitions {
            *seen.entry(partition.index).or_default() += 1;
        }
        found.extend(
            seen.into_iter()
                .filter(|(_, count)| *count > 1)
                .map(|(index, _)| LayoutViolation::DuplicateIndex { index }),
        );

        let usable = self.label.usable;
        for partition in &self.partitions {
            let range = partition.range();
            if range.is_empty() || !usable.covers(&range) || range.end >= self.geometry.total_sectors {
                found.push(LayoutViolation::OutOfRange {
                    index: partition.index,
                    range,
                    usable,
                });
            }
        }

        for (i, first) in self.partitions.iter().enumerate() {
            for second in &self.partitions[i + 1..] {
                // Sorted by start: nothing further along can reach back into `first`
                if second.start > first.end {
                    break;
                }
                if first.range().intersects(&second.range()) {
                    found.push(LayoutViolation::Overlap {
                        first: first.index,
                        first_range: first.range(),
                        second: second.index,
                        second_range: second.range(),
                    });
                }
            }
        }

        found
    }
}

/// Validate `layout`, wrapping the first violation as a [`LayoutError`]
pub fn validate(layout: &Layout) -> Result<()> {
    layout.validate().map_err(LayoutError::from)
}

fn sort_partitions(partitions: &mut [Partition]) {
    partitions.sort_by(|a, b| a.start.cmp(&b.start).then(a.index.cmp(&b.index)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DiskId, PartitionType, SectorRange};

    fn dos_layout(ranges: &[(u32, u64, u64)]) -> Layout {
        let geometry = Geometry::new(8_388_608, 512, 512).unwrap();
        let label = TableLabel::new(&geometry, DiskId::Dos(0x1234_5678)).unwrap();
        let partitions = ranges
            .iter()
            .map(|(index, start, end)| {
                Partition::new(*index, SectorRange::new(*start, *end), PartitionType::Dos(0x83))
            })
            .collect();
        Layout::new(geometry, label, partitions)
    }

    #[test]
    fn keeps_entries_in_start_order_with_stable_indices() {
        let layout = dos_layout(&[(0, 1026048, 2097151), (1, 2048, 1026047)]);
        let order: Vec<u32> = layout.partitions().iter().map(|p| p.index).collect();
        assert_eq!(order, vec![1, 0]);
        assert_eq!(layout.next_after(1).map(|p| p.index), Some(0));
        assert_eq!(layout.next_after(0), None);
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn edits_leave_the_receiver_untouched() {
        let layout = dos_layout(&[(0, 2048, 1026047), (1, 1026048, 2097151)]);
        let removed = layout.remove(1).unwrap();
        let resized = layout.resize(0, 4095).unwrap();

        assert_eq!(layout.len(), 2);
        assert_eq!(layout.get(0).unwrap().end, 1026047);
        assert_eq!(removed.len(), 1);
        assert_eq!(resized.get(0).unwrap().end, 4095);
    }

    #[test]
    fn missing_index_is_not_found() {
        let layout = dos_layout(&[(0, 2048, 4095)]);
        assert_eq!(layout.remove(3), Err(LayoutError::PartitionNotFound(3)));
        assert_eq!(layout.resize(3, 9000), Err(LayoutError::PartitionNotFound(3)));
    }

    #[test]
    fn reports_overlap_with_both_entries() {
        let layout = dos_layout(&[(0, 2048, 10000), (1, 9000, 20000)]);
        assert_eq!(
            layout.validate(),
            Err(LayoutViolation::Overlap {
                first: 0,
                first_range: SectorRange::new(2048, 10000),
                second: 1,
                second_range: SectorRange::new(9000, 20000),
            })
        );
    }

    #[test]
    fn reports_every_violation() {
        let layout = dos_layout(&[(0, 2048, 10000), (0, 20000, 30000), (2, 0, 100)]);
        let violations = layout.violations();
        assert!(violations.contains(&LayoutViolation::DuplicateIndex { index: 0 }));
        assert!(violations
            .iter()
            .any(|v| matches!(v, LayoutViolation::OutOfRange { index: 2, .. })));
        assert_eq!(violations.len(), 2);
        assert!(matches!(
            validate(&layout),
            Err(LayoutError::Invariant(LayoutViolation::DuplicateIndex { index: 0 }))
        ));
    }

    #[test]
    fn inverted_range_is_out_of_range() {
        let layout = dos_layout(&[(0, 4096, 4095)]);
        assert!(matches!(
            layout.validate(),
            Err(LayoutViolation::OutOfRange { index: 0, .. })
        ));
    }

    #[test]
    fn free_index_skips_used_slots() {
        let layout = dos_layout(&[(0, 2048, 1026047), (2, 2097152, 4194303)]);
        assert_eq!(layout.free_index(), Some(1));

        let full = dos_layout(&[(0, 10, 19), (1, 20, 29), (2, 30, 39), (3, 40, 49)]);
        assert_eq!(full.free_index(), None);
    }
}

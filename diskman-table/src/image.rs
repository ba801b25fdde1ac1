// SPDX-License-Identifier: GPL-3.0-only

//! Byte images of the on-disk table regions

use crate::error::{CorruptReason, Result};

/// Location of a table region on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionSpan {
    pub offset: u64,
    pub len: usize,
}

impl RegionSpan {
    pub fn new(offset: u64, len: usize) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }

    pub fn overlaps(&self, other: &RegionSpan) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Bytes of one region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

impl Region {
    pub fn span(&self) -> RegionSpan {
        RegionSpan::new(self.offset, self.bytes.len())
    }
}

/// The bytes a table occupies, as a list of `(offset, bytes)` regions.
///
/// Only these bytes are ever read or written by a table commit; everything
/// else on the device (boot code, partition data) is left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableImage {
    regions: Vec<Region>,
}

impl TableImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, offset: u64, bytes: Vec<u8>) {
        self.regions.push(Region { offset, bytes });
    }

    pub fn with_region(mut self, offset: u64, bytes: Vec<u8>) -> Self {
        self.push(offset, bytes);
        self
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn spans(&self) -> Vec<RegionSpan> {
        self.regions.iter().map(Region::span).collect()
    }

    /// Total number of bytes across all regions
    pub fn byte_len(&self) -> usize {
        self.regions.iter().map(|r| r.bytes.len()).sum()
    }

    /// Bytes `offset..offset+len`, which must lie inside a single region
    pub fn slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        self.regions.iter().find_map(|region| {
            let start = offset.checked_sub(region.offset)? as usize;
            region.bytes.get(start..start.checked_add(len)?)
        })
    }

    /// Like [`TableImage::slice`], failing with `MissingRegion`
    pub fn require(&self, offset: u64, len: usize) -> Result<&[u8]> {
        self.slice(offset, len)
            .ok_or_else(|| CorruptReason::MissingRegion { offset, len }.into())
    }

    /// Append zero-filled regions for every span not already covered.
    ///
    /// Used to erase the structures of a previous table format.
    pub fn wipe_spans(&mut self, spans: &[RegionSpan]) {
        for span in spans {
            if self.regions.iter().any(|r| r.span().overlaps(span)) {
                continue;
            }
            self.push(span.offset, vec![0u8; span.len]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_inside_one_region() {
        let image = TableImage::new()
            .with_region(440, vec![1; 72])
            .with_region(512, (0..=255).collect());
        assert_eq!(image.slice(446, 4), Some(&[1u8, 1, 1, 1][..]));
        assert_eq!(image.slice(512 + 8, 2), Some(&[8u8, 9][..]));
        assert_eq!(image.slice(500, 20), None);
        assert_eq!(image.slice(100, 1), None);
        assert!(image.require(0, 1).is_err());
        assert_eq!(image.byte_len(), 72 + 256);
    }

    #[test]
    fn wipe_skips_covered_spans() {
        let mut image = TableImage::new().with_region(440, vec![1; 72]);
        image.wipe_spans(&[RegionSpan::new(440, 72), RegionSpan::new(512, 512)]);
        assert_eq!(
            image.spans(),
            vec![RegionSpan::new(440, 72), RegionSpan::new(512, 512)]
        );
        assert_eq!(image.slice(512, 512), Some(&[0u8; 512][..]));
    }
}

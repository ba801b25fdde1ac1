// SPDX-License-Identifier: GPL-3.0-only

//! In-memory block device
//!
//! Clones share the same media, so one handle can play "another process"
//! modifying the disk behind the back of a second one.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::{BlockDevice, DEFAULT_SECTOR_SIZE, check_bounds};
use crate::error::{Result, SysError};

#[derive(Debug, Default)]
struct Media {
    bytes: Vec<u8>,
    writes: u64,
    attempts: u64,
    flushes: u64,
    /// Write attempts `from..until` fail
    fault: Option<(u64, Option<u64>)>,
}

#[derive(Debug, Clone)]
pub struct MemoryDevice {
    id: String,
    logical_sector_size: u32,
    physical_sector_size: u32,
    media: Arc<Mutex<Media>>,
}

impl MemoryDevice {
    /// Zero-filled media of `size` bytes with 512-byte sectors
    pub fn new(id: impl Into<String>, size: u64) -> Self {
        Self::with_sector_size(id, size, DEFAULT_SECTOR_SIZE)
    }

    pub fn with_sector_size(id: impl Into<String>, size: u64, sector_size: u32) -> Self {
        Self {
            id: id.into(),
            logical_sector_size: sector_size,
            physical_sector_size: sector_size,
            media: Arc::new(Mutex::new(Media {
                bytes: vec![0u8; size as usize],
                ..Media::default()
            })),
        }
    }

    fn media(&self) -> MutexGuard<'_, Media> {
        // A panicking writer leaves plain bytes behind; they are still readable.
        self.media.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the whole media
    pub fn snapshot(&self) -> Vec<u8> {
        self.media().bytes.clone()
    }

    /// Number of successful `write_region` calls so far
    pub fn write_count(&self) -> u64 {
        self.media().writes
    }

    pub fn flush_count(&self) -> u64 {
        self.media().flushes
    }

    /// Let the next `writes` writes succeed, then fail every write after them
    pub fn fail_writes_after(&self, writes: u64) {
        let mut media = self.media();
        media.fault = Some((media.attempts + writes, None));
    }

    /// Let the next `writes` writes succeed, fail the `count` after them,
    /// then behave again
    pub fn fail_writes_window(&self, writes: u64, count: u64) {
        let mut media = self.media();
        let from = media.attempts + writes;
        media.fault = Some((from, Some(from + count)));
    }

    pub fn clear_faults(&self) {
        self.media().fault = None;
    }
}

impl BlockDevice for MemoryDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn size_bytes(&self) -> u64 {
        self.media().bytes.len() as u64
    }

    fn sector_sizes(&self) -> (u32, u32) {
        (self.logical_sector_size, self.physical_sector_size)
    }

    fn read_region(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let media = self.media();
        check_bounds(media.bytes.len() as u64, offset, len as u64)?;
        let start = offset as usize;
        Ok(media.bytes[start..start + len].to_vec())
    }

    fn write_region(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut media = self.media();
        check_bounds(media.bytes.len() as u64, offset, bytes.len() as u64)?;

        let attempt = media.attempts;
        media.attempts += 1;
        let failing = media
            .fault
            .is_some_and(|(from, until)| attempt >= from && until.is_none_or(|until| attempt < until));
        if failing {
            return Err(SysError::Io(std::io::Error::other(format!(
                "injected write failure on {} at offset {offset}",
                self.id
            ))));
        }

        let start = offset as usize;
        media.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        media.writes += 1;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.media().flushes += 1;
        Ok(())
    }
}

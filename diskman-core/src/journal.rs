// SPDX-License-Identifier: GPL-3.0-only

//! Staging journal for table commits
//!
//! Before a table is overwritten, the bytes it is about to receive are staged
//! in a journal kept on a separate block store. The body goes down and is
//! flushed first; the header is armed afterwards with a single sector write.
//! An armed journal found on open means a commit was interrupted after the
//! swap began, and replaying it finishes that commit.
//!
//! Store layout:
//!
//! ```text
//! 0      8      12     16        24        32          40     42
//! | magic | state | count | sequence | body len | device size | id len | id ...
//! 512: body = count x (offset: u64, len: u32, bytes)
//! ```
//!
//! All integers are little endian.

use std::path::Path;
use std::sync::Arc;

use diskman_sys::{BlockDevice, FileDevice, MemoryDevice, SysError};
use diskman_table::TableImage;
use tracing::{debug, info};

use crate::error::{Error, Result};

const MAGIC: &[u8; 8] = b"DMJRNL01";
const HEADER_LEN: usize = 512;
const MAX_ID_LEN: usize = HEADER_LEN - 42;
const ENTRY_HEADER_LEN: usize = 12;

const STATE_CLEAR: u32 = 0;
const STATE_ARMED: u32 = 1;

/// Size given to newly created journal files
pub const JOURNAL_FILE_LEN: u64 = 1024 * 1024;

/// A staged table image waiting to be written to `device_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImage {
    pub device_id: String,
    pub device_size: u64,
    pub sequence: u64,
    pub image: TableImage,
}

struct Header {
    state: u32,
    count: u32,
    sequence: u64,
    body_len: u64,
    device_size: u64,
    device_id: String,
}

impl Header {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&self.state.to_le_bytes());
        buf[12..16].copy_from_slice(&self.count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.sequence.to_le_bytes());
        buf[24..32].copy_from_slice(&self.body_len.to_le_bytes());
        buf[32..40].copy_from_slice(&self.device_size.to_le_bytes());

        // stage refuses ids that do not fit
        let id = self.device_id.as_bytes();
        let id_len = id.len().min(MAX_ID_LEN);
        buf[40..42].copy_from_slice(&(id_len as u16).to_le_bytes());
        buf[42..42 + id_len].copy_from_slice(&id[..id_len]);
        buf
    }

    /// `None` for a store that never held a journal
    fn parse(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_LEN || &buf[0..8] != MAGIC {
            return Ok(None);
        }
        let u32_at = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[o..o + 8]);
            u64::from_le_bytes(b)
        };

        let id_len = usize::from(u16::from_le_bytes([buf[40], buf[41]]));
        if id_len > MAX_ID_LEN {
            return Err(corrupt_journal(format!("device id length {id_len}")));
        }
        let device_id = String::from_utf8_lossy(&buf[42..42 + id_len]).into_owned();

        Ok(Some(Self {
            state: u32_at(8),
            count: u32_at(12),
            sequence: u64_at(16),
            body_len: u64_at(24),
            device_size: u64_at(32),
            device_id,
        }))
    }
}

fn corrupt_journal(detail: String) -> Error {
    Error::Storage(SysError::OperationFailed(format!("corrupt journal: {detail}")))
}

fn encode_body(image: &TableImage) -> Vec<u8> {
    let mut body = Vec::with_capacity(image.byte_len() + image.regions().len() * ENTRY_HEADER_LEN);
    for region in image.regions() {
        body.extend_from_slice(&region.offset.to_le_bytes());
        body.extend_from_slice(&(region.bytes.len() as u32).to_le_bytes());
        body.extend_from_slice(&region.bytes);
    }
    body
}

fn decode_body(body: &[u8], count: u32) -> Result<TableImage> {
    let mut image = TableImage::new();
    let mut pos = 0usize;
    for n in 0..count {
        let Some(head) = body.get(pos..pos + ENTRY_HEADER_LEN) else {
            return Err(corrupt_journal(format!("region {n} header truncated")));
        };
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&head[0..8]);
        let len = u32::from_le_bytes([head[8], head[9], head[10], head[11]]) as usize;
        pos += ENTRY_HEADER_LEN;

        let Some(bytes) = body.get(pos..pos + len) else {
            return Err(corrupt_journal(format!("region {n} truncated")));
        };
        image.push(u64::from_le_bytes(offset), bytes.to_vec());
        pos += len;
    }
    Ok(image)
}

/// Journal on its own block store
pub struct Journal {
    store: Arc<dyn BlockDevice>,
    sequence: u64,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("store", &self.store.id())
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl Journal {
    pub fn new(store: Arc<dyn BlockDevice>) -> Self {
        Self { store, sequence: 0 }
    }

    /// Journal in a sidecar file, created if missing
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let store = FileDevice::create(path, JOURNAL_FILE_LEN)?;
        Ok(Self::new(Arc::new(store)))
    }

    /// Journal that lives only as long as the process
    pub fn in_memory(device_id: &str) -> Self {
        let store = MemoryDevice::new(format!("{device_id}.journal"), JOURNAL_FILE_LEN);
        Self::new(Arc::new(store))
    }

    pub fn store_id(&self) -> &str {
        self.store.id()
    }

    /// Stage `image` for `device` and arm the journal
    pub fn stage(&mut self, device: &dyn BlockDevice, image: &TableImage) -> Result<()> {
        if device.id().len() > MAX_ID_LEN {
            return Err(Error::Unsupported(format!(
                "device id of {} bytes does not fit the journal (at most {MAX_ID_LEN})",
                device.id().len()
            )));
        }

        let body = encode_body(image);
        let needed = (HEADER_LEN + body.len()) as u64;
        if needed > self.store.size_bytes() {
            return Err(SysError::OutOfBounds {
                offset: 0,
                len: needed,
                size: self.store.size_bytes(),
            }
            .into());
        }

        self.sequence = self.pending_sequence()?.max(self.sequence) + 1;
        let header = Header {
            state: STATE_ARMED,
            count: image.regions().len() as u32,
            sequence: self.sequence,
            body_len: body.len() as u64,
            device_size: device.size_bytes(),
            device_id: device.id().to_string(),
        };

        self.store.write_region(HEADER_LEN as u64, &body)?;
        self.store.flush()?;
        self.store.write_region(0, &header.to_bytes())?;
        self.store.flush()?;

        debug!(
            journal = %self.store.id(),
            device = %device.id(),
            sequence = self.sequence,
            regions = header.count,
            "staged table image"
        );
        Ok(())
    }

    /// Disarm the journal after the table is known to be consistent
    pub fn clear(&mut self) -> Result<()> {
        let header = self.store.read_region(0, HEADER_LEN)?;
        let Some(mut parsed) = Header::parse(&header)? else {
            return Ok(());
        };
        if parsed.state == STATE_CLEAR {
            return Ok(());
        }
        parsed.state = STATE_CLEAR;
        self.store.write_region(0, &parsed.to_bytes())?;
        self.store.flush()?;
        debug!(journal = %self.store.id(), sequence = parsed.sequence, "journal cleared");
        Ok(())
    }

    /// The armed image, if a commit was interrupted
    pub fn pending(&self) -> Result<Option<StagedImage>> {
        let header = self.store.read_region(0, HEADER_LEN)?;
        let Some(header) = Header::parse(&header)? else {
            return Ok(None);
        };
        if header.state != STATE_ARMED {
            return Ok(None);
        }

        let body_len = usize::try_from(header.body_len)
            .map_err(|_| corrupt_journal(format!("body length {}", header.body_len)))?;
        let body = self.store.read_region(HEADER_LEN as u64, body_len)?;
        let image = decode_body(&body, header.count)?;

        Ok(Some(StagedImage {
            device_id: header.device_id,
            device_size: header.device_size,
            sequence: header.sequence,
            image,
        }))
    }

    fn pending_sequence(&self) -> Result<u64> {
        let header = self.store.read_region(0, HEADER_LEN)?;
        Ok(Header::parse(&header)?.map_or(0, |h| h.sequence))
    }

    /// Write an armed image to `device` and disarm the journal.
    ///
    /// Returns whether anything was replayed. An image staged for another
    /// device is left armed.
    pub fn replay(&mut self, device: &dyn BlockDevice) -> Result<bool> {
        let Some(staged) = self.pending()? else {
            return Ok(false);
        };
        if staged.device_id != device.id() || staged.device_size != device.size_bytes() {
            return Err(Error::Unsupported(format!(
                "journal {} holds a table for {} ({} bytes), not {}",
                self.store.id(),
                staged.device_id,
                staged.device_size,
                device.id()
            )));
        }

        info!(
            device = %device.id(),
            sequence = staged.sequence,
            regions = staged.image.regions().len(),
            "replaying interrupted table commit"
        );
        for region in staged.image.regions() {
            device.write_region(region.offset, &region.bytes)?;
        }
        device.flush()?;
        self.clear()?;
        Ok(true)
    }
}

// SPDX-License-Identifier: GPL-3.0-only

//! Block devices and image files using positional I/O

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Result, SysError};

/// Sector size assumed for plain image files
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Byte-addressed access to a disk.
///
/// Implementations never retry: every I/O failure is returned to the caller
/// as it happened.
pub trait BlockDevice: Send + Sync {
    /// Stable identifier (device path) used for locking and logging
    fn id(&self) -> &str;

    /// Size of the device in bytes
    fn size_bytes(&self) -> u64;

    /// Logical and physical sector size in bytes
    fn sector_sizes(&self) -> (u32, u32);

    /// Read `len` bytes starting at `offset`
    fn read_region(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write `bytes` at `offset`
    fn write_region(&self, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Push written data to stable storage
    fn flush(&self) -> Result<()>;

    fn is_writable(&self) -> bool {
        true
    }

    /// Ask the kernel to pick up a rewritten partition table
    fn notify_table_changed(&self) -> Result<()> {
        Ok(())
    }
}

/// Fail with `OutOfBounds` unless `offset..offset+len` lies within `size`
pub fn check_bounds(size: u64, offset: u64, len: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(SysError::OutOfBounds { offset, len, size }),
    }
}

// linux/fs.h
const BLKRRPART: libc::c_ulong = 0x125f;
const BLKSSZGET: libc::c_ulong = 0x1268;
const BLKPBSZGET: libc::c_ulong = 0x127b;
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

fn ioctl_int(file: &File, request: libc::c_ulong) -> io::Result<u32> {
    let mut value: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request, &mut value) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    u32::try_from(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn ioctl_size(file: &File) -> io::Result<u64> {
    let mut size: u64 = 0;
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(size)
}

fn lock_file(file: &File, device: &str, exclusive: bool) -> Result<()> {
    let mode = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
    let ret = unsafe { libc::flock(file.as_raw_fd(), mode | libc::LOCK_NB) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(SysError::DeviceBusy(device.to_string()));
        }
        return Err(SysError::Io(err));
    }
    Ok(())
}

/// A disk image file or block device node.
///
/// The open file holds an advisory `flock`: shared for read-only access,
/// exclusive for writable access. The lock is released on drop.
#[derive(Debug)]
pub struct FileDevice {
    path: String,
    file: File,
    size: u64,
    logical_sector_size: u32,
    physical_sector_size: u32,
    block_device: bool,
    writable: bool,
}

impl FileDevice {
    /// Open for reading only
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path.as_ref(), false)
    }

    /// Open for reading and writing, taking the exclusive lock
    pub fn open_writable(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path.as_ref(), true)
    }

    /// Create (or reuse) a regular file of at least `len` bytes and open it writable
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let path = path.as_ref();
        let device = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| SysError::from_open(e, &device, "writing"))?;
        lock_file(&file, &device, true)?;

        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        drop(file);

        Self::open(path, true)
    }

    fn open(path: &Path, writable: bool) -> Result<Self> {
        let device = path.display().to_string();
        let purpose = if writable { "writing" } else { "reading" };
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| SysError::from_open(e, &device, purpose))?;

        lock_file(&file, &device, writable)?;

        let metadata = file.metadata()?;
        let block_device = metadata.file_type().is_block_device();

        let (size, logical, physical) = if block_device {
            let size = ioctl_size(&file)?;
            let logical = ioctl_int(&file, BLKSSZGET)?;
            let physical = ioctl_int(&file, BLKPBSZGET).unwrap_or(logical);
            (size, logical, physical)
        } else if metadata.is_file() {
            (metadata.len(), DEFAULT_SECTOR_SIZE, DEFAULT_SECTOR_SIZE)
        } else {
            return Err(SysError::OperationFailed(format!(
                "{device} is neither a regular file nor a block device"
            )));
        };

        debug!(
            device = %device,
            size,
            logical,
            physical,
            block_device,
            writable,
            "opened device"
        );

        Ok(Self {
            path: device,
            file,
            size,
            logical_sector_size: logical,
            physical_sector_size: physical,
            block_device,
            writable,
        })
    }

    /// Override the sector sizes of an image file.
    ///
    /// Block devices always report what the kernel says.
    pub fn with_sector_sizes(mut self, logical: u32, physical: u32) -> Self {
        if self.block_device {
            warn!(
                device = %self.path,
                "ignoring sector size override for a block device"
            );
            return self;
        }
        self.logical_sector_size = logical;
        self.physical_sector_size = physical.max(logical);
        self
    }

    pub fn is_block_device(&self) -> bool {
        self.block_device
    }
}

impl BlockDevice for FileDevice {
    fn id(&self) -> &str {
        &self.path
    }

    fn size_bytes(&self) -> u64 {
        self.size
    }

    fn sector_sizes(&self) -> (u32, u32) {
        (self.logical_sector_size, self.physical_sector_size)
    }

    fn read_region(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_bounds(self.size, offset, len as u64)?;
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn write_region(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SysError::ReadOnly(self.path.clone()));
        }
        check_bounds(self.size, offset, bytes.len() as u64)?;
        self.file.write_all_at(bytes, offset)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn notify_table_changed(&self) -> Result<()> {
        if !self.block_device {
            return Ok(());
        }

        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), BLKRRPART) };
        if ret < 0 {
            // Busy partitions keep the old kernel view until the next reboot
            // or a partx/partprobe run; the table on disk is already correct.
            let err = io::Error::last_os_error();
            warn!(device = %self.path, "kernel did not re-read partition table: {err}");
        }
        Ok(())
    }
}

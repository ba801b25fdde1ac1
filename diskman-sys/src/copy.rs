// SPDX-License-Identifier: GPL-3.0-only

//! Sector copies within one device
//!
//! Moving partition data is never done implicitly by a table commit; callers
//! run this step explicitly before committing a plan that needs it.

use tracing::info;

use crate::device::BlockDevice;
use crate::error::{Result, SysError};

const CHUNK_BYTES: u64 = 1024 * 1024; // 1MB buffer

/// Copy `sectors` sectors starting at `from_start` to `to_start`.
///
/// Overlapping ranges are handled: a copy towards higher sectors runs from
/// the end backwards so no source sector is overwritten before it was read.
/// The device is flushed once at the end. Returns the number of bytes copied.
///
/// # Arguments
/// * `progress_callback` - Optional callback for progress updates (bytes copied)
pub fn copy_sectors<F>(
    device: &dyn BlockDevice,
    from_start: u64,
    sectors: u64,
    to_start: u64,
    sector_size: u32,
    mut progress_callback: Option<F>,
) -> Result<u64>
where
    F: FnMut(u64),
{
    let sector_size = u64::from(sector_size);
    let overflow = || SysError::OperationFailed("sector range overflows the device".to_string());

    let total = sectors.checked_mul(sector_size).ok_or_else(overflow)?;
    let source = from_start.checked_mul(sector_size).ok_or_else(overflow)?;
    let dest = to_start.checked_mul(sector_size).ok_or_else(overflow)?;

    if total == 0 || source == dest {
        return Ok(0);
    }

    info!(
        device = device.id(),
        from_start, to_start, sectors, "copying partition data"
    );

    let backwards = dest > source && dest < source + total;
    let mut copied: u64 = 0;

    while copied < total {
        let chunk = CHUNK_BYTES.min(total - copied);
        let offset = if backwards {
            total - copied - chunk
        } else {
            copied
        };

        let buffer = device.read_region(source + offset, chunk as usize)?;
        device.write_region(dest + offset, &buffer)?;
        copied += chunk;

        if let Some(ref mut callback) = progress_callback {
            callback(copied);
        }
    }

    device.flush()?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDevice;

    fn patterned(size: usize) -> MemoryDevice {
        let device = MemoryDevice::new("mem0", size as u64);
        let pattern: Vec<u8> = (0..size).map(|i| (i / 512) as u8).collect();
        device.write_region(0, &pattern).unwrap();
        device
    }

    #[test]
    fn overlapping_move_right_preserves_data() {
        // 5000 sectors is more than two chunks, so the backwards order matters
        let device = patterned(8000 * 512);
        let before = device.snapshot();

        let copied = copy_sectors(&device, 0, 5000, 1000, 512, None::<fn(u64)>).unwrap();
        assert_eq!(copied, 5000 * 512);

        let after = device.snapshot();
        assert_eq!(after[1000 * 512..6000 * 512], before[..5000 * 512]);
    }

    #[test]
    fn overlapping_move_left_preserves_data() {
        let device = patterned(8000 * 512);
        let before = device.snapshot();

        copy_sectors(&device, 3000, 5000, 1000, 512, None::<fn(u64)>).unwrap();

        let after = device.snapshot();
        assert_eq!(after[1000 * 512..6000 * 512], before[3000 * 512..8000 * 512]);
    }

    #[test]
    fn reports_progress_and_flushes() {
        let device = patterned(4096 * 512);
        let mut seen = Vec::new();
        copy_sectors(&device, 0, 2048, 2048, 512, Some(|n| seen.push(n))).unwrap();
        assert_eq!(seen, vec![1024 * 1024]);
        assert_eq!(device.flush_count(), 1);
    }

    #[test]
    fn copy_past_the_end_fails() {
        let device = MemoryDevice::new("mem0", 1024 * 512);
        assert!(matches!(
            copy_sectors(&device, 0, 1000, 500, 512, None::<fn(u64)>),
            Err(SysError::OutOfBounds { .. })
        ));
    }
}

// SPDX-License-Identifier: GPL-3.0-only

//! Common utility types shared across models

use anyhow::Result;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

/// Partition alignment boundary (1 MiB) - standard for modern disks
pub const DEFAULT_ALIGNMENT_BYTES: u64 = 1024 * 1024;

/// An inclusive range of sectors, `start..=end`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorRange {
    /// First sector (inclusive)
    pub start: u64,

    /// Last sector (inclusive)
    pub end: u64,
}

impl SectorRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Build a range from a start sector and a sector count.
    ///
    /// Returns `None` for an empty count or when the end would overflow.
    pub fn from_len(start: u64, len: u64) -> Option<Self> {
        let last = len.checked_sub(1)?;
        Some(Self {
            start,
            end: start.checked_add(last)?,
        })
    }

    /// Number of sectors covered (zero for an inverted range)
    pub fn len(&self) -> u64 {
        if self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, sector: u64) -> bool {
        self.start <= sector && sector <= self.end
    }

    /// Check if `other` lies entirely inside this range
    pub fn covers(&self, other: &SectorRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersects(&self, other: &SectorRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl std::fmt::Display for SectorRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Round `value` up to the next multiple of `alignment`
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Derive the device node of a partition from its disk and 1-based number.
///
/// Disks whose name ends in a digit (`nvme0n1`, `mmcblk0`, `loop0`) use a `p`
/// separator, everything else appends the number directly (`sda1`).
pub fn partition_device_path(disk: &str, number: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{disk}p{number}")
    } else {
        format!("{disk}{number}")
    }
}

/// Format utilities for converting between bytes and human-readable strings
/// Convert bytes to human-readable format (e.g., "1.50 GB")
pub fn bytes_to_pretty(bytes: &u64, add_bytes: bool) -> String {
    let mut steps = 0;
    let mut val: f64 = *bytes as f64;

    while val > 1024. && steps <= 8 {
        val /= 1024.;
        steps += 1;
    }

    let unit = match steps {
        0 => "B",
        1 => "KB",
        2 => "MB",
        3 => "GB",
        4 => "TB",
        5 => "PB",
        6 => "EB",
        7 => "ZB",
        8 => "YB",
        _ => "Not Supported",
    };

    if add_bytes {
        let bytes_str = bytes.to_formatted_string(&Locale::en);
        format!("{:.2} {} ({} bytes)", val, unit, bytes_str)
    } else {
        format!("{:.2} {}", val, unit)
    }
}

/// Compact fdisk-style size ("500M", "1.5G", "3G")
pub fn short_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "K", "M", "G", "T", "P"];

    let mut val = bytes as f64;
    let mut steps = 0;
    while val >= 1024. && steps < UNITS.len() - 1 {
        val /= 1024.;
        steps += 1;
    }

    let rounded = (val * 10.).round() / 10.;
    if rounded.fract() == 0.0 {
        format!("{}{}", rounded as u64, UNITS[steps])
    } else {
        format!("{:.1}{}", rounded, UNITS[steps])
    }
}

fn unit_steps(unit: &str) -> Option<u32> {
    let steps = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 1,
        "M" | "MB" | "MIB" => 2,
        "G" | "GB" | "GIB" => 3,
        "T" | "TB" | "TIB" => 4,
        "P" | "PB" | "PIB" => 5,
        "E" | "EB" | "EIB" => 6,
        "Z" | "ZB" | "ZIB" => 7,
        "Y" | "YB" | "YIB" => 8,
        _ => return None,
    };
    Some(steps)
}

/// Parse human-readable format to bytes (e.g., "1.5 GB" or "512M" -> bytes)
fn pretty_to_bytes(pretty: &str) -> Result<u64> {
    let trimmed = pretty.trim();
    let split_at = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split_at);

    if number.is_empty() {
        return Err(anyhow::anyhow!("Invalid input: {}", pretty));
    }

    let mut val: f64 = number.parse()?;
    let mut steps =
        unit_steps(unit.trim()).ok_or_else(|| anyhow::anyhow!("Invalid unit: {}", unit.trim()))?;

    while steps > 0 {
        val *= 1024.;
        steps -= 1;
    }

    Ok(val as u64)
}

/// Parse a size given either as a bare sector count ("2048") or with a unit
/// ("512M", "1.5 GiB") into whole sectors of `sector_size` bytes.
pub fn parse_sectors(input: &str, sector_size: u32) -> Result<u64> {
    let trimmed = input.trim();
    if let Ok(sectors) = trimmed.parse::<u64>() {
        return Ok(sectors);
    }

    let bytes = pretty_to_bytes(trimmed)?;
    if sector_size == 0 {
        return Err(anyhow::anyhow!("Invalid sector size: 0"));
    }
    Ok(bytes / u64::from(sector_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_range_len_and_intersection() {
        let a = SectorRange::new(2048, 1026047);
        let b = SectorRange::new(1026048, 2097151);
        assert_eq!(a.len(), 1024000);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&SectorRange::new(1026047, 1026047)));
        assert_eq!(SectorRange::from_len(10, 0), None);
        assert_eq!(SectorRange::from_len(10, 1), Some(SectorRange::new(10, 10)));
        assert_eq!(SectorRange::from_len(u64::MAX, 2), None);
    }

    #[test]
    fn short_size_matches_fdisk_style() {
        assert_eq!(short_size(1024000 * 512), "500M");
        assert_eq!(short_size(6291456 * 512), "3G");
        assert_eq!(short_size(1536 * 1024 * 1024), "1.5G");
        assert_eq!(short_size(512), "512B");
    }

    #[test]
    fn parses_sectors_with_and_without_units() {
        assert_eq!(parse_sectors("2048", 512).unwrap(), 2048);
        assert_eq!(parse_sectors("512M", 512).unwrap(), 1048576);
        assert_eq!(parse_sectors("1.5 GiB", 4096).unwrap(), 393216);
        assert!(parse_sectors("12 parsecs", 512).is_err());
        assert!(parse_sectors("", 512).is_err());
    }

    #[test]
    fn partition_paths_follow_kernel_naming() {
        assert_eq!(partition_device_path("/dev/sda", 1), "/dev/sda1");
        assert_eq!(partition_device_path("/dev/nvme0n1", 3), "/dev/nvme0n1p3");
        assert_eq!(partition_device_path("disk.img", 2), "disk.img2");
    }

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(34, 2048), 2048);
        assert_eq!(align_up(2048, 2048), 2048);
        assert_eq!(align_up(7, 0), 7);
    }
}

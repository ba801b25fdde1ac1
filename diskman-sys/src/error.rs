// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Error types for block storage operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device is busy: {0} is locked by another process")]
    DeviceBusy(String),

    #[error("Region {offset}+{len} lies outside the {size}-byte device")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("Device {0} is open read-only")]
    ReadOnly(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl SysError {
    /// Map an open() failure onto the more specific variants
    pub(crate) fn from_open(error: std::io::Error, device: &str, purpose: &str) -> Self {
        match error.kind() {
            std::io::ErrorKind::PermissionDenied => {
                SysError::PermissionDenied(format!("Cannot open {device} for {purpose}"))
            }
            std::io::ErrorKind::NotFound => SysError::DeviceNotFound(device.to_string()),
            _ => SysError::Io(error),
        }
    }
}

/// Result type alias for block storage operations
pub type Result<T> = std::result::Result<T, SysError>;

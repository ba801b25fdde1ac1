// SPDX-License-Identifier: GPL-3.0-only

//! Block storage access for diskman
//!
//! The only gateway between the partition engine and physical media:
//! - `BlockDevice`: region reads and writes against a device or image
//! - `FileDevice`: image files and block device nodes, with `flock` based
//!   exclusion between processes
//! - `MemoryDevice`: shared in-memory media with fault injection
//! - `copy_sectors`: the explicit data-copy step used before moving or
//!   shrinking partitions
//!
//! Nothing here knows about partition tables or mount state.

pub mod copy;
pub mod device;
pub mod error;
pub mod memory;

pub use copy::copy_sectors;
pub use device::{BlockDevice, FileDevice, check_bounds};
pub use error::{Result, SysError};
pub use memory::MemoryDevice;

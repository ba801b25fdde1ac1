// SPDX-License-Identifier: GPL-3.0-only

//! Partition table codecs
//!
//! Pure transforms between the on-disk table regions ([`TableImage`]) and a
//! [`Layout`]. No device I/O happens here: callers read the regions named by
//! [`TableCodec::spans`], hand them to `decode`, and write back what `encode`
//! returns.
//!
//! For every valid layout a format can hold, `decode(encode(layout))` gives
//! the same layout back.

pub mod error;
pub mod gpt;
pub mod image;
pub mod mbr;
pub mod probe;

use diskman_types::{Geometry, Layout, TableFormat};

pub use error::{CodecError, CorruptReason, Result};
pub use gpt::GptCodec;
pub use image::{Region, RegionSpan, TableImage};
pub use mbr::MbrCodec;
pub use probe::probe;

/// Encoder/decoder for one table format
pub trait TableCodec: Send + Sync {
    fn format(&self) -> TableFormat;

    /// Device regions holding the table on a disk of `geometry`
    fn spans(&self, geometry: &Geometry) -> Vec<RegionSpan>;

    /// Parse the regions listed by [`TableCodec::spans`]
    fn decode(&self, geometry: &Geometry, image: &TableImage) -> Result<Layout>;

    /// Serialize `layout`, failing when it does not fit the format
    fn encode(&self, layout: &Layout) -> Result<TableImage>;
}

/// Codec for `format`
pub fn codec_for(format: TableFormat) -> &'static dyn TableCodec {
    match format {
        TableFormat::Dos => &MbrCodec,
        TableFormat::Gpt => &GptCodec,
    }
}

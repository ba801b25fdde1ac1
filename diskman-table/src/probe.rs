// SPDX-License-Identifier: GPL-3.0-only

//! Table format detection

use diskman_types::TableFormat;
use tracing::{debug, warn};

use crate::error::{CorruptReason, Result};
use crate::gpt::HEADER_SIGNATURE;
use crate::mbr::{MBR_TABLE_LEN, MBR_TABLE_OFFSET, PROTECTIVE_TYPE, has_boot_signature, read_entries};

/// Decide the table format from the first two sectors of a disk.
///
/// A dos table that carries a protective (0xEE) entry belongs to a GPT, even
/// when the primary GPT header is damaged: the backup copy may still be good.
/// Without a boot signature, a GPT header at LBA 1 is still accepted.
pub fn probe(sector0: &[u8], sector1: &[u8]) -> Result<TableFormat> {
    let gpt_header = sector1.starts_with(HEADER_SIGNATURE);
    let table_end = MBR_TABLE_OFFSET as usize + MBR_TABLE_LEN;

    let Some(table) = sector0.get(MBR_TABLE_OFFSET as usize..table_end) else {
        return Err(CorruptReason::MissingSignature.into());
    };

    if has_boot_signature(table) {
        let protective = read_entries(table)
            .iter()
            .any(|entry| entry.kind == PROTECTIVE_TYPE);
        if protective {
            debug!(gpt_header, "protective MBR found");
            return Ok(TableFormat::Gpt);
        }
        if gpt_header {
            warn!("stale GPT header next to a dos table without protective entry; treating disk as dos");
        }
        return Ok(TableFormat::Dos);
    }

    if gpt_header {
        warn!("GPT header without protective MBR");
        return Ok(TableFormat::Gpt);
    }

    Err(CorruptReason::MissingSignature.into())
}

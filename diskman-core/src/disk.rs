// SPDX-License-Identifier: GPL-3.0-only

//! Disk handle
//!
//! Owns the device, its geometry, the layout last loaded from it and the
//! staging journal. This is the surface a user interface drives:
//! [`Disk::current_layout`], [`Disk::plan`] and [`Disk::commit`].

use std::sync::Arc;

use diskman_sys::{BlockDevice, copy_sectors};
use diskman_table::mbr::{MBR_TABLE_LEN, MBR_TABLE_OFFSET};
use diskman_table::{
    CorruptReason, GptCodec, MbrCodec, RegionSpan, TableCodec, TableImage, codec_for, probe,
};
use diskman_types::{
    DiskId, Geometry, Layout, SectorRange, TableFormat, TableLabel, gpt_default_usable,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::locks;
use crate::plan::{Intent, Plan};
use crate::planner;
use crate::transaction::{Transaction, TransactionOutcome};

/// Regions holding the table structures of `formats`.
///
/// A blank disk (no format) is watched through its MBR table area. Sectors
/// of a format that is neither on the disk nor being written are partition
/// data and never part of a snapshot.
pub(crate) fn watched_spans(geometry: &Geometry, formats: &[TableFormat]) -> Vec<RegionSpan> {
    let mut spans: Vec<RegionSpan> = Vec::new();
    for &format in formats {
        if format == TableFormat::Gpt && gpt_default_usable(geometry).is_none() {
            continue;
        }
        for span in codec_for(format).spans(geometry) {
            if !spans.contains(&span) {
                spans.push(span);
            }
        }
    }
    if spans.is_empty() {
        spans = MbrCodec.spans(geometry);
    }
    spans.sort_by_key(|span| span.offset);
    spans
}

pub(crate) fn read_spans(device: &dyn BlockDevice, spans: &[RegionSpan]) -> Result<TableImage> {
    let mut image = TableImage::new();
    for span in spans {
        image.push(span.offset, device.read_region(span.offset, span.len)?);
    }
    Ok(image)
}

/// Format decision from the MBR table area and LBA 1
fn probe_regions(table: &[u8], sector1: &[u8]) -> Result<TableFormat> {
    let mut sector0 = vec![0u8; 512];
    sector0[MBR_TABLE_OFFSET as usize..].copy_from_slice(table);
    Ok(probe(&sector0, sector1)?)
}

/// Format of the table on `device`, or `None` when there is no recognisable one
fn probe_device(device: &dyn BlockDevice, geometry: &Geometry) -> Result<Option<TableFormat>> {
    let table = device.read_region(MBR_TABLE_OFFSET, MBR_TABLE_LEN)?;
    let sector1 = if geometry.total_sectors > 1 {
        device.read_region(geometry.offset_of(1), geometry.logical_sector_size as usize)?
    } else {
        Vec::new()
    };

    match probe_regions(&table, &sector1) {
        Ok(format) => Ok(Some(format)),
        Err(Error::CorruptTable(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Probe and decode a snapshot of the watched regions
pub(crate) fn decode_snapshot(geometry: &Geometry, image: &TableImage) -> Result<(TableFormat, Layout)> {
    let table = image
        .slice(MBR_TABLE_OFFSET, MBR_TABLE_LEN)
        .ok_or(CorruptReason::MissingSignature)
        .map_err(Error::CorruptTable)?;

    let sector_size = geometry.logical_sector_size as usize;
    let sector1 = image
        .slice(geometry.offset_of(1), sector_size)
        .unwrap_or_default();

    let format = probe_regions(table, sector1)?;
    let layout = codec_for(format).decode(geometry, image)?;
    Ok((format, layout))
}

pub struct Disk {
    device: Arc<dyn BlockDevice>,
    geometry: Geometry,
    journal: Journal,
    table: std::result::Result<Layout, CorruptReason>,
    format: Option<TableFormat>,
    snapshot: TableImage,
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("device", &self.device.id())
            .field("geometry", &self.geometry)
            .field("format", &self.format)
            .field("journal", &self.journal)
            .finish()
    }
}

impl Disk {
    /// Open a disk with a readable partition table.
    ///
    /// An interrupted commit staged in `journal` is finished first.
    pub fn open(device: Arc<dyn BlockDevice>, journal: Journal) -> Result<Self> {
        let disk = Self::attach(device, journal)?;
        disk.current_layout()?;
        Ok(disk)
    }

    /// Open a disk that may not carry a table yet (blank or unreadable)
    pub fn open_for_init(device: Arc<dyn BlockDevice>, journal: Journal) -> Result<Self> {
        Self::attach(device, journal)
    }

    fn attach(device: Arc<dyn BlockDevice>, mut journal: Journal) -> Result<Self> {
        let (logical, physical) = device.sector_sizes();
        let geometry = Geometry::from_size(device.size_bytes(), logical, physical)?;

        if journal.pending()?.is_some() {
            if device.is_writable() {
                warn!(
                    device = %device.id(),
                    journal = %journal.store_id(),
                    "found an interrupted table commit"
                );
                journal.replay(device.as_ref())?;
            } else {
                warn!(
                    device = %device.id(),
                    "interrupted table commit pending; open the device writable to recover it"
                );
            }
        }

        let mut disk = Self {
            device,
            geometry,
            journal,
            table: Err(CorruptReason::MissingSignature),
            format: None,
            snapshot: TableImage::new(),
        };
        disk.reload()?;
        Ok(disk)
    }

    /// Re-read the table from the device
    fn reload(&mut self) -> Result<()> {
        let found = probe_device(self.device.as_ref(), &self.geometry)?;
        let spans = watched_spans(&self.geometry, found.as_slice());
        self.snapshot = read_spans(self.device.as_ref(), &spans)?;
        match decode_snapshot(&self.geometry, &self.snapshot) {
            Ok((format, layout)) => {
                info!(
                    device = %self.id(),
                    %format,
                    partitions = layout.len(),
                    "loaded partition table"
                );
                self.format = Some(format);
                self.table = Ok(layout);
            }
            Err(Error::CorruptTable(reason)) => {
                warn!(device = %self.id(), %reason, "no usable partition table");
                self.format = None;
                self.table = Err(reason);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Regions a commit writing a `target` table watches and may restore:
    /// those of the loaded format and of the target
    pub(crate) fn spans_for(&self, target: TableFormat) -> Vec<RegionSpan> {
        let formats: Vec<TableFormat> = self.format.into_iter().chain([target]).collect();
        watched_spans(&self.geometry, &formats)
    }

    pub(crate) fn read(&self, spans: &[RegionSpan]) -> Result<TableImage> {
        read_spans(self.device.as_ref(), spans)
    }

    pub(crate) fn applied(&mut self, layout: Layout, read_back: TableImage) {
        self.format = Some(layout.format());
        self.table = Ok(layout);
        self.snapshot = read_back;
    }

    pub(crate) fn device_and_journal(&mut self) -> (&dyn BlockDevice, &mut Journal) {
        (self.device.as_ref(), &mut self.journal)
    }

    pub(crate) fn journal(&self) -> &Journal {
        &self.journal
    }

    pub(crate) fn journal_mut(&mut self) -> &mut Journal {
        &mut self.journal
    }

    pub fn id(&self) -> &str {
        self.device.id()
    }

    pub fn device(&self) -> &dyn BlockDevice {
        self.device.as_ref()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Format of the table found on the device, if any
    pub fn format(&self) -> Option<TableFormat> {
        self.format
    }

    /// Table bytes as last read from the device
    pub fn snapshot(&self) -> &TableImage {
        &self.snapshot
    }

    /// The layout last loaded from the device
    pub fn current_layout(&self) -> Result<&Layout> {
        self.table
            .as_ref()
            .map_err(|reason| Error::CorruptTable(reason.clone()))
    }

    /// Plan `intent` against the current layout
    pub fn plan(&self, intent: &Intent) -> Result<Plan> {
        planner::plan(self.current_layout()?, intent)
    }

    /// Plan a batch of intents as one plan
    pub fn plan_all(&self, intents: &[Intent]) -> Result<Plan> {
        planner::plan_all(self.current_layout()?, intents)
    }

    /// Open a transaction for `plan`
    pub fn begin(&mut self, plan: Plan) -> Result<Transaction<'_>> {
        Transaction::open(self, plan)
    }

    /// Open a transaction for `plan` and commit it
    pub fn commit(&mut self, plan: Plan) -> Result<TransactionOutcome> {
        self.begin(plan)?.commit()
    }

    /// The plan writing a fresh, empty table of `format`
    pub fn initial_plan(&self, format: TableFormat) -> Result<Plan> {
        let disk_id = DiskId::generate(format, Uuid::new_v4());
        let label = TableLabel::new(&self.geometry, disk_id)?;
        let empty = Layout::empty(self.geometry, label);
        let base = self.table.as_ref().ok().cloned().unwrap_or_else(|| empty.clone());
        Ok(Plan::new(base, Vec::new(), empty, Vec::new()))
    }

    /// Replace whatever table is on the device with the empty table of
    /// `plan`, as returned by [`Disk::initial_plan`].
    ///
    /// Structures of a previous GPT are zeroed when switching to dos.
    pub fn initialize(&mut self, plan: Plan) -> Result<TransactionOutcome> {
        let format = plan.target().format();
        if !plan.target().is_empty() {
            return Err(Error::Unsupported(format!(
                "a fresh {format} table cannot hold {} partition(s)",
                plan.target().len()
            )));
        }
        let wipe = match (self.format, format) {
            (Some(TableFormat::Gpt), TableFormat::Dos) => GptCodec.spans(&self.geometry),
            _ => Vec::new(),
        };

        info!(device = %self.id(), %format, "initializing partition table");
        self.begin(plan)?.replacing(wipe).commit()
    }

    /// Re-read the table, dropping what was loaded before
    pub fn refresh(&mut self) -> Result<&Layout> {
        self.reload()?;
        self.current_layout()
    }

    /// Finish an interrupted commit, if one is staged. Returns whether one was.
    pub fn recover(&mut self) -> Result<bool> {
        let lock = locks::device_lock(self.id());
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let replayed = self.journal.replay(self.device.as_ref())?;
        if replayed {
            self.reload()?;
        }
        Ok(replayed)
    }

    /// Copy the sectors of `from` to `to_start` on the same disk.
    ///
    /// This is the explicit data move that must precede a table commit which
    /// relocates a partition or shrinks it below its data. Returns the number
    /// of bytes copied.
    pub fn copy_data<F>(&self, from: SectorRange, to_start: u64, progress: Option<F>) -> Result<u64>
    where
        F: FnMut(u64),
    {
        let last = self.geometry.last_sector();
        let to = SectorRange::from_len(to_start, from.len())
            .ok_or_else(|| Error::InvalidSize(format!("destination {to_start} overflows the sector space")))?;
        if from.is_empty() || from.end > last || to.end > last {
            return Err(Error::InvalidSize(format!(
                "copy {from} -> {to} does not fit a disk of {} sectors",
                self.geometry.total_sectors
            )));
        }

        let lock = locks::device_lock(self.id());
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        Ok(copy_sectors(
            self.device.as_ref(),
            from.start,
            from.len(),
            to.start,
            self.geometry.logical_sector_size,
            progress,
        )?)
    }
}

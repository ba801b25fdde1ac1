// SPDX-License-Identifier: GPL-3.0-only

//! Transaction engine
//!
//! A [`Transaction`] binds the table bytes read at open, a [`Plan`], and the
//! outcome of committing it. It goes `Open -> Validating -> Committed` or
//! `-> RolledBack`, and is never partially applied: every check runs before
//! the first byte is written, and the write itself goes through the staging
//! journal so either the old or the new table survives a failure.

use diskman_sys::{BlockDevice, SysError};
use diskman_table::{RegionSpan, TableImage, codec_for};
use diskman_types::Layout;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::disk::{Disk, decode_snapshot, watched_spans};
use crate::error::{Error, Result};
use crate::locks;
use crate::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Open,
    Validating,
    Committed,
    RolledBack,
}

/// How a transaction ended
#[derive(Debug)]
pub enum TransactionOutcome {
    /// The new table is on disk
    Applied { layout: Layout },

    /// Nothing was written; the previous table stands
    Aborted { reason: Error },
}

impl TransactionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransactionOutcome::Applied { .. })
    }

    /// The applied layout, or the abort reason as an error
    pub fn into_result(self) -> Result<Layout> {
        match self {
            TransactionOutcome::Applied { layout } => Ok(layout),
            TransactionOutcome::Aborted { reason } => Err(reason),
        }
    }
}

pub struct Transaction<'d> {
    disk: &'d mut Disk,
    plan: Plan,
    /// Table regions of the format on disk and of the target
    spans: Vec<RegionSpan>,
    pre_image: TableImage,
    pre_layout: Option<Layout>,
    /// Set for a fresh table: the base is not compared, and these spans of
    /// the old table are zeroed
    replace: Option<Vec<RegionSpan>>,
    state: TransactionState,
}

impl<'d> Transaction<'d> {
    /// Open a transaction, capturing the table as it is on disk now
    pub(crate) fn open(disk: &'d mut Disk, plan: Plan) -> Result<Self> {
        let spans = disk.spans_for(plan.target().format());
        let pre_image = disk.read(&spans)?;
        let pre_layout = decode_snapshot(disk.geometry(), &pre_image)
            .ok()
            .map(|(_, layout)| layout);

        debug!(
            device = %disk.id(),
            edits = plan.edits().len(),
            "transaction opened"
        );

        Ok(Self {
            disk,
            plan,
            spans,
            pre_image,
            pre_layout,
            replace: None,
            state: TransactionState::Open,
        })
    }

    pub(crate) fn replacing(mut self, wipe: Vec<RegionSpan>) -> Self {
        self.replace = Some(wipe);
        self
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// The layout found on disk when the transaction opened
    pub fn pre_layout(&self) -> Option<&Layout> {
        self.pre_layout.as_ref()
    }

    /// Discard the transaction without touching the disk
    pub fn abort(mut self) -> TransactionOutcome {
        self.state = TransactionState::RolledBack;
        debug!(device = %self.disk.id(), "transaction cancelled");
        TransactionOutcome::Aborted {
            reason: Error::Cancelled,
        }
    }

    /// Validate against the live table and write the plan's target.
    ///
    /// Validation failures come back as `Ok(Aborted)` with nothing written.
    /// `Err` means the write itself failed (`CommitFailed`) or the table could
    /// not be read.
    pub fn commit(mut self) -> Result<TransactionOutcome> {
        let lock = locks::device_lock(self.disk.id());
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        self.state = TransactionState::Validating;
        let image = match self.validate() {
            Ok(image) => image,
            Err(Error::Storage(source)) if !matches!(source, SysError::ReadOnly(_)) => {
                self.state = TransactionState::RolledBack;
                return Err(Error::Storage(source));
            }
            Err(reason) => {
                warn!(device = %self.disk.id(), %reason, "transaction aborted");
                self.state = TransactionState::RolledBack;
                return Ok(TransactionOutcome::Aborted { reason });
            }
        };

        info!(
            device = %self.disk.id(),
            format = %self.plan.target().format(),
            edits = self.plan.edits().len(),
            partitions = self.plan.target().len(),
            "writing partition table"
        );

        let staged = {
            let (device, journal) = self.disk.device_and_journal();
            journal.stage(device, &image)
        };
        if let Err(e) = staged {
            self.state = TransactionState::RolledBack;
            error!(device = %self.disk.id(), error = %e, "could not stage the new table");
            return Err(Error::CommitFailed {
                source: into_sys_error(e),
                restored: true,
            });
        }

        match self.swap(&image) {
            Ok(read_back) => {
                self.state = TransactionState::Committed;
                let layout = self.plan.target().clone();
                self.disk.applied(layout.clone(), read_back);
                info!(device = %self.disk.id(), "partition table applied");
                Ok(TransactionOutcome::Applied { layout })
            }
            Err(source) => {
                self.state = TransactionState::RolledBack;
                error!(device = %self.disk.id(), %source, "partition table write failed");
                let restored = self.restore();
                Err(Error::CommitFailed { source, restored })
            }
        }
    }

    /// Every check that can reject the commit, in order. Returns the image
    /// to write.
    fn validate(&self) -> Result<TableImage> {
        let device = self.disk.id().to_string();

        if self.replace.is_none() && self.pre_layout.as_ref() != Some(self.plan.base()) {
            return Err(Error::StalePlan { device });
        }

        let current = self.disk.read(&self.spans)?;
        if current != self.pre_image {
            return Err(Error::ConcurrentModification { device });
        }

        if let Some(violation) = self.plan.violations().next() {
            return Err(Error::LayoutInvariantViolation(violation.clone()));
        }

        if !self.plan.data_loss_acknowledged() {
            return Err(Error::DataLossNotAcknowledged);
        }

        let target = self.plan.target();
        let mut image = codec_for(target.format()).encode(target)?;
        if let Some(wipe) = &self.replace {
            image.wipe_spans(wipe);
        }

        if !self.disk.device().is_writable() {
            return Err(SysError::ReadOnly(device).into());
        }

        Ok(image)
    }

    /// Overwrite the table with the staged image and verify it. Returns the
    /// table bytes read back.
    fn swap(&mut self, image: &TableImage) -> std::result::Result<TableImage, SysError> {
        let device = self.disk.device();
        for region in image.regions() {
            device.write_region(region.offset, &region.bytes)?;
        }
        device.flush()?;

        for region in image.regions() {
            let written = device.read_region(region.offset, region.bytes.len())?;
            if written != region.bytes {
                return Err(SysError::OperationFailed(format!(
                    "read-back of {} bytes at offset {} on {} does not match what was written",
                    region.bytes.len(),
                    region.offset,
                    device.id()
                )));
            }
        }

        let target_spans = watched_spans(self.disk.geometry(), &[self.plan.target().format()]);
        let read_back = self.disk.read(&target_spans).map_err(into_sys_error)?;
        match decode_snapshot(self.disk.geometry(), &read_back) {
            Ok((_, layout)) if &layout == self.plan.target() => {}
            Ok(_) => {
                return Err(SysError::OperationFailed(format!(
                    "table read back from {} differs from the planned layout",
                    device.id()
                )));
            }
            Err(e) => {
                return Err(SysError::OperationFailed(format!(
                    "table read back from {} does not decode: {e}",
                    device.id()
                )));
            }
        }

        if let Err(e) = self.disk.journal_mut().clear() {
            // replaying the same image on the next open is harmless
            warn!(device = %self.disk.id(), error = %e, "failed to clear the staging journal");
        }
        if let Err(e) = self.disk.device().notify_table_changed() {
            warn!(device = %self.disk.id(), error = %e, "kernel did not re-read the partition table");
        }

        Ok(read_back)
    }

    /// Put the pre-image back. Returns whether the old table is intact and
    /// the journal disarmed.
    fn restore(&mut self) -> bool {
        let device = self.disk.device();
        let rewritten = self
            .pre_image
            .regions()
            .iter()
            .try_for_each(|region| device.write_region(region.offset, &region.bytes))
            .and_then(|()| device.flush());

        let intact = match rewritten {
            Ok(()) => self
                .disk
                .read(&self.spans)
                .is_ok_and(|current| current == self.pre_image),
            Err(e) => {
                error!(device = %device.id(), error = %e, "could not restore the previous table");
                false
            }
        };
        if !intact {
            warn!(
                device = %self.disk.id(),
                journal = %self.disk.journal().store_id(),
                "new table left staged in the journal; it is replayed on the next open"
            );
            return false;
        }

        match self.disk.journal_mut().clear() {
            Ok(()) => {
                info!(device = %self.disk.id(), "previous partition table restored");
                true
            }
            Err(e) => {
                warn!(
                    device = %self.disk.id(),
                    error = %e,
                    "previous table restored but the journal is still armed"
                );
                false
            }
        }
    }
}

fn into_sys_error(error: Error) -> SysError {
    match error {
        Error::Storage(e) => e,
        other => SysError::OperationFailed(other.to_string()),
    }
}

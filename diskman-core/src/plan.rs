// SPDX-License-Identifier: GPL-3.0-only

//! Intents, edits and plans

use diskman_types::{Layout, LayoutViolation, Partition, SectorRange};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A requested change, as issued by a user interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Intent {
    /// Move the end of partition `index` so it spans `new_size` sectors
    Resize { index: u32, new_size: u64 },

    /// Remove partition `index`; its sectors become free space
    Delete { index: u32 },

    /// Add a partition of `size` sectors at `start`.
    ///
    /// `kind` is a type name from the catalog ("Linux", "EFI System"), a dos
    /// type code or a GPT type GUID.
    Create {
        start: u64,
        size: u64,
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        label: String,
    },
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::Resize { index, new_size } => {
                write!(f, "resize partition {} to {new_size} sectors", index + 1)
            }
            Intent::Delete { index } => write!(f, "delete partition {}", index + 1),
            Intent::Create {
                start, size, kind, ..
            } => write!(f, "create {kind} partition of {size} sectors at {start}"),
        }
    }
}

/// One atomic layout edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "edit", rename_all = "snake_case")]
pub enum Edit {
    Create { partition: Partition },
    Delete { index: u32, range: SectorRange },
    Resize { index: u32, old_end: u64, new_end: u64 },
}

/// Layout invariants every plan target is checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Invariant {
    UniqueIndex,
    WithinUsable,
    NonOverlap,
}

impl Invariant {
    pub const ALL: [Invariant; 3] = [
        Invariant::UniqueIndex,
        Invariant::WithinUsable,
        Invariant::NonOverlap,
    ];

    fn covers(&self, violation: &LayoutViolation) -> bool {
        matches!(
            (self, violation),
            (Invariant::UniqueIndex, LayoutViolation::DuplicateIndex { .. })
                | (Invariant::WithinUsable, LayoutViolation::OutOfRange { .. })
                | (Invariant::NonOverlap, LayoutViolation::Overlap { .. })
        )
    }
}

/// Outcome of checking one invariant on a plan target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvariantCheck {
    pub invariant: Invariant,
    pub violations: Vec<LayoutViolation>,
}

impl InvariantCheck {
    pub fn satisfied(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Check every invariant of `layout`
pub fn check_layout(layout: &Layout) -> Vec<InvariantCheck> {
    let violations = layout.violations();
    Invariant::ALL
        .iter()
        .map(|invariant| InvariantCheck {
            invariant: *invariant,
            violations: violations
                .iter()
                .filter(|v| invariant.covers(v))
                .cloned()
                .collect(),
        })
        .collect()
}

/// Data a plan gives up when committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum PlanWarning {
    /// A shrinking resize cuts `lost_sectors` off the end of the partition
    Truncates { index: u32, lost_sectors: u64 },

    /// A delete releases the partition's sectors
    Discards { index: u32, sectors: u64 },
}

/// A proposed, unapplied set of edits with its candidate layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    base: Layout,
    edits: Vec<Edit>,
    target: Layout,
    checks: Vec<InvariantCheck>,
    warnings: Vec<PlanWarning>,
    data_loss_acknowledged: bool,
}

impl Plan {
    pub(crate) fn new(
        base: Layout,
        edits: Vec<Edit>,
        target: Layout,
        warnings: Vec<PlanWarning>,
    ) -> Self {
        let checks = check_layout(&target);
        Self {
            base,
            edits,
            target,
            checks,
            warnings,
            data_loss_acknowledged: false,
        }
    }

    /// The layout this plan was made against
    pub fn base(&self) -> &Layout {
        &self.base
    }

    /// The layout committing this plan produces
    pub fn target(&self) -> &Layout {
        &self.target
    }

    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    pub fn checks(&self) -> &[InvariantCheck] {
        &self.checks
    }

    pub fn warnings(&self) -> &[PlanWarning] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Whether every invariant holds on the target
    pub fn is_valid(&self) -> bool {
        self.checks.iter().all(InvariantCheck::satisfied)
    }

    /// Violations found on the target, across all invariants
    pub fn violations(&self) -> impl Iterator<Item = &LayoutViolation> {
        self.checks.iter().flat_map(|check| check.violations.iter())
    }

    /// Whether a resize in this plan cuts partition data off
    pub fn truncates_data(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, PlanWarning::Truncates { .. }))
    }

    /// Accept the data loss of truncating resizes
    pub fn acknowledge_data_loss(mut self) -> Self {
        self.data_loss_acknowledged = true;
        self
    }

    pub fn data_loss_acknowledged(&self) -> bool {
        self.data_loss_acknowledged || !self.truncates_data()
    }

    /// Extend this plan with `intent`, planned against the current target
    pub fn then(self, intent: &Intent) -> Result<Plan> {
        let step = crate::planner::plan(&self.target, intent)?;

        let mut edits = self.edits;
        edits.extend(step.edits);
        let mut warnings = self.warnings;
        warnings.extend(step.warnings);

        Ok(Plan {
            base: self.base,
            edits,
            target: step.target,
            checks: step.checks,
            warnings,
            data_loss_acknowledged: self.data_loss_acknowledged,
        })
    }
}

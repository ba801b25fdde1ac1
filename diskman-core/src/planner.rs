// SPDX-License-Identifier: GPL-3.0-only

//! Mutation planner
//!
//! Turns an [`Intent`] into a [`Plan`] without touching storage. Planning
//! works on a snapshot layout and needs no device lock.

use diskman_table::gpt::MAX_NAME_UNITS;
use diskman_types::{
    Layout, LayoutViolation, Partition, PartitionType, SectorRange, TableFormat,
};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::plan::{Edit, Intent, Plan, PlanWarning};

/// Plan a single intent against `layout`
pub fn plan(layout: &Layout, intent: &Intent) -> Result<Plan> {
    debug!(%intent, "planning");

    let plan = match intent {
        Intent::Resize { index, new_size } => plan_resize(layout, *index, *new_size)?,
        Intent::Delete { index } => plan_delete(layout, *index)?,
        Intent::Create {
            start,
            size,
            kind,
            label,
        } => plan_create(layout, *start, *size, kind, label)?,
    };

    if !plan.is_valid() {
        debug!(
            violations = plan.violations().count(),
            "planned layout breaks invariants"
        );
    }
    Ok(plan)
}

/// Plan a batch of intents, each against the result of the previous ones
pub fn plan_all(layout: &Layout, intents: &[Intent]) -> Result<Plan> {
    let mut plan = Plan::new(layout.clone(), Vec::new(), layout.clone(), Vec::new());
    for intent in intents {
        plan = plan.then(intent)?;
    }
    Ok(plan)
}

fn plan_resize(layout: &Layout, index: u32, new_size: u64) -> Result<Plan> {
    let partition = layout.get(index).ok_or(Error::PartitionNotFound(index))?;

    if new_size == 0 {
        return Err(Error::InvalidSize(format!(
            "partition {} cannot be resized to zero sectors",
            partition.number()
        )));
    }
    let new_end = partition
        .start
        .checked_add(new_size - 1)
        .ok_or_else(|| Error::InvalidSize(format!("{new_size} sectors overflow the sector space")))?;

    if let Some(next) = layout.next_after(index)
        && new_end >= next.start
    {
        return Err(Error::InsufficientSpace {
            detail: format!(
                "partition {} would end at sector {new_end}, but partition {} starts at {}",
                partition.number(),
                next.number(),
                next.start
            ),
            blocked_by: Some(next.index),
        });
    }

    let usable = layout.label().usable;
    if new_end > usable.end {
        return Err(Error::InsufficientSpace {
            detail: format!(
                "partition {} would end at sector {new_end}, past the last usable sector {}",
                partition.number(),
                usable.end
            ),
            blocked_by: None,
        });
    }

    let mut warnings = Vec::new();
    if new_end < partition.end {
        warnings.push(PlanWarning::Truncates {
            index,
            lost_sectors: partition.end - new_end,
        });
    }

    let edit = Edit::Resize {
        index,
        old_end: partition.end,
        new_end,
    };
    let target = layout.resize(index, new_end)?;
    Ok(Plan::new(layout.clone(), vec![edit], target, warnings))
}

fn plan_delete(layout: &Layout, index: u32) -> Result<Plan> {
    let partition = layout.get(index).ok_or(Error::PartitionNotFound(index))?;

    let edit = Edit::Delete {
        index,
        range: partition.range(),
    };
    let warnings = vec![PlanWarning::Discards {
        index,
        sectors: partition.sectors(),
    }];
    let target = layout.remove(index)?;
    Ok(Plan::new(layout.clone(), vec![edit], target, warnings))
}

fn plan_create(layout: &Layout, start: u64, size: u64, kind: &str, label: &str) -> Result<Plan> {
    let format = layout.format();

    let kind = PartitionType::parse(format, kind).ok_or_else(|| {
        Error::Unsupported(format!("unknown partition type '{kind}' for a {format} table"))
    })?;
    if kind.is_empty() {
        return Err(Error::Unsupported(format!(
            "type {} marks an unused entry",
            kind.id()
        )));
    }

    if !label.is_empty() {
        if !format.supports_labels() {
            return Err(Error::Unsupported(format!(
                "{format} partitions cannot carry a name"
            )));
        }
        if label.encode_utf16().count() > MAX_NAME_UNITS {
            return Err(Error::Unsupported(format!(
                "partition name '{label}' is longer than {MAX_NAME_UNITS} characters"
            )));
        }
        if label.contains('\0') {
            return Err(Error::Unsupported(format!(
                "partition name {label:?} contains a NUL character"
            )));
        }
    }

    if size == 0 {
        return Err(Error::InvalidSize(
            "a partition needs at least one sector".to_string(),
        ));
    }
    let range = SectorRange::from_len(start, size).ok_or_else(|| {
        Error::InvalidSize(format!("{size} sectors at {start} overflow the sector space"))
    })?;

    let capacity = layout.label().capacity;
    let index = layout.free_index().ok_or(Error::TableFull { capacity })?;

    let usable = layout.label().usable;
    if range.start < usable.start {
        return Err(LayoutViolation::OutOfRange {
            index,
            range,
            usable,
        }
        .into());
    }

    if let Some(existing) = layout
        .partitions()
        .iter()
        .find(|p| p.range().intersects(&range))
    {
        return Err(LayoutViolation::Overlap {
            first: existing.index,
            first_range: existing.range(),
            second: index,
            second_range: range,
        }
        .into());
    }

    if range.end > usable.end {
        return Err(Error::InsufficientSpace {
            detail: format!(
                "{size} sectors at {start} end past the last usable sector {}",
                usable.end
            ),
            blocked_by: None,
        });
    }

    let mut partition = Partition::new(index, range, kind);
    partition.label = label.to_string();
    if format == TableFormat::Gpt {
        partition.uuid = Some(Uuid::new_v4());
    }

    let edit = Edit::Create {
        partition: partition.clone(),
    };
    let target = layout.insert(partition);
    Ok(Plan::new(layout.clone(), vec![edit], target, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Invariant;
    use diskman_types::{DiskId, Geometry, TableLabel};

    fn layout(format: TableFormat, ranges: &[(u32, u64, u64)]) -> Layout {
        let geometry = Geometry::new(8_388_608, 512, 512).unwrap();
        let (disk_id, kind) = match format {
            TableFormat::Dos => (DiskId::Dos(0x0bad_cafe), PartitionType::Dos(0x83)),
            TableFormat::Gpt => (
                DiskId::Gpt(Uuid::nil()),
                PartitionType::Gpt(Uuid::parse_str("0fc63daf-8483-4772-8e79-3d69d8477de4").unwrap()),
            ),
        };
        let label = TableLabel::new(&geometry, disk_id).unwrap();
        let partitions = ranges
            .iter()
            .map(|(index, start, end)| Partition::new(*index, SectorRange::new(*start, *end), kind))
            .collect();
        Layout::new(geometry, label, partitions)
    }

    fn two_partitions() -> Layout {
        layout(TableFormat::Dos, &[(0, 2048, 1026047), (1, 1026048, 2097151)])
    }

    #[test]
    fn resize_up_to_the_next_partition_succeeds() {
        let base = two_partitions();
        let plan = plan(&base, &Intent::Resize { index: 0, new_size: 1026048 - 2048 }).unwrap();
        assert_eq!(plan.target().get(0).unwrap().end, 1026047);
        assert!(plan.is_valid());

        let grown = layout(TableFormat::Dos, &[(0, 2048, 4095), (1, 1026048, 2097151)]);
        let plan = super::plan(&grown, &Intent::Resize { index: 0, new_size: 1026048 - 2048 }).unwrap();
        assert_eq!(plan.target().get(0).unwrap().end, 1026047);
        assert!(plan.warnings().is_empty());
    }

    #[test]
    fn resize_onto_the_next_partition_fails() {
        let base = two_partitions();
        let err = plan(&base, &Intent::Resize { index: 0, new_size: 1026048 - 2048 + 1 }).unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace { blocked_by: Some(1), .. }));

        let err = plan(&base, &Intent::Resize { index: 0, new_size: 4_000_000 }).unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace { blocked_by: Some(1), .. }));
    }

    #[test]
    fn resize_past_the_disk_fails() {
        let base = two_partitions();
        let err = plan(&base, &Intent::Resize { index: 1, new_size: 8_000_000 }).unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace { blocked_by: None, .. }));
    }

    #[test]
    fn zero_size_and_missing_partitions_are_rejected() {
        let base = two_partitions();
        assert!(matches!(
            plan(&base, &Intent::Resize { index: 0, new_size: 0 }),
            Err(Error::InvalidSize(_))
        ));
        assert!(matches!(
            plan(&base, &Intent::Resize { index: 7, new_size: 10 }),
            Err(Error::PartitionNotFound(7))
        ));
        assert!(matches!(
            plan(&base, &Intent::Delete { index: 2 }),
            Err(Error::PartitionNotFound(2))
        ));
    }

    #[test]
    fn shrinking_warns_about_truncation() {
        let base = two_partitions();
        let plan = plan(&base, &Intent::Resize { index: 1, new_size: 1024 }).unwrap();
        assert_eq!(
            plan.warnings(),
            &[PlanWarning::Truncates {
                index: 1,
                lost_sectors: 2097151 - (1026048 + 1023),
            }]
        );
        assert!(plan.truncates_data());
        assert!(!plan.data_loss_acknowledged());
        assert!(plan.acknowledge_data_loss().data_loss_acknowledged());
    }

    #[test]
    fn delete_frees_the_range_without_reassigning_it() {
        let base = two_partitions();
        let plan = plan(&base, &Intent::Delete { index: 1 }).unwrap();
        assert_eq!(plan.target().len(), 1);
        assert_eq!(plan.target().get(0), base.get(0));
        assert_eq!(plan.warnings(), &[PlanWarning::Discards { index: 1, sectors: 1071104 }]);
        // planning leaves the base alone
        assert_eq!(base.len(), 2);
    }

    #[test]
    fn create_overlapping_names_the_blocking_partition() {
        let base = two_partitions();
        let err = plan(
            &base,
            &Intent::Create {
                start: 2_000_000,
                size: 500_000,
                kind: "Linux".to_string(),
                label: String::new(),
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::LayoutInvariantViolation(LayoutViolation::Overlap { first: 1, second: 2, .. })
        ));
    }

    #[test]
    fn create_takes_the_lowest_free_slot() {
        let base = layout(TableFormat::Dos, &[(1, 2048, 4095)]);
        let plan = plan(
            &base,
            &Intent::Create {
                start: 4096,
                size: 2048,
                kind: "linux swap".to_string(),
                label: String::new(),
            },
        )
        .unwrap();
        let created = plan.target().get(0).unwrap();
        assert_eq!(created.range(), SectorRange::new(4096, 6143));
        assert_eq!(created.kind, PartitionType::Dos(0x82));
        assert!(created.uuid.is_none());
    }

    #[test]
    fn create_checks_range_type_and_capacity() {
        let base = two_partitions();
        let create = |start, size, kind: &str, label: &str| {
            plan(
                &base,
                &Intent::Create {
                    start,
                    size,
                    kind: kind.to_string(),
                    label: label.to_string(),
                },
            )
        };

        assert!(matches!(
            create(0, 100, "Linux", ""),
            Err(Error::LayoutInvariantViolation(LayoutViolation::OutOfRange { .. }))
        ));
        assert!(matches!(
            create(8_000_000, 1_000_000, "Linux", ""),
            Err(Error::InsufficientSpace { blocked_by: None, .. })
        ));
        assert!(matches!(create(3_000_000, 0, "Linux", ""), Err(Error::InvalidSize(_))));
        assert!(matches!(create(3_000_000, 10, "Not A Filesystem", ""), Err(Error::Unsupported(_))));
        assert!(matches!(create(3_000_000, 10, "Linux", "root"), Err(Error::Unsupported(_))));

        let full = layout(
            TableFormat::Dos,
            &[(0, 2048, 4095), (1, 4096, 8191), (2, 8192, 16383), (3, 16384, 32767)],
        );
        assert!(matches!(
            super::plan(
                &full,
                &Intent::Create {
                    start: 40000,
                    size: 10,
                    kind: "Linux".to_string(),
                    label: String::new(),
                }
            ),
            Err(Error::TableFull { capacity: 4 })
        ));
    }

    #[test]
    fn gpt_creates_get_a_fresh_guid_and_name() {
        let base = layout(TableFormat::Gpt, &[(0, 2048, 4095)]);
        let plan = plan(
            &base,
            &Intent::Create {
                start: 4096,
                size: 2048,
                kind: "EFI System".to_string(),
                label: "esp".to_string(),
            },
        )
        .unwrap();
        let created = plan.target().get(1).unwrap();
        assert!(created.uuid.is_some());
        assert_eq!(created.label, "esp");
    }

    #[test]
    fn gpt_names_the_codec_cannot_store_are_refused_when_planning() {
        let base = layout(TableFormat::Gpt, &[(0, 2048, 4095)]);
        let create = |label: String| {
            plan(
                &base,
                &Intent::Create {
                    start: 4096,
                    size: 2048,
                    kind: "Linux".to_string(),
                    label,
                },
            )
        };

        assert!(create("x".repeat(MAX_NAME_UNITS)).is_ok());
        assert!(matches!(create("x".repeat(MAX_NAME_UNITS + 1)), Err(Error::Unsupported(_))));
        assert!(matches!(create("ro\0ot".to_string()), Err(Error::Unsupported(_))));
    }

    #[test]
    fn batch_plans_chain_edits_from_the_same_base() {
        let base = two_partitions();
        let plan = plan_all(
            &base,
            &[
                Intent::Delete { index: 1 },
                Intent::Create {
                    start: 1026048,
                    size: 6291456,
                    kind: "Linux".to_string(),
                    label: String::new(),
                },
            ],
        )
        .unwrap();

        assert_eq!(plan.base(), &base);
        assert_eq!(plan.edits().len(), 2);
        assert_eq!(plan.target().len(), 2);
        assert_eq!(
            plan.target().get(1).unwrap().range(),
            SectorRange::new(1026048, 7317503)
        );
        assert!(plan.checks().iter().all(|c| c.satisfied()));
        assert_eq!(plan.checks().len(), Invariant::ALL.len());
    }

    #[test]
    fn broken_base_layouts_show_up_in_the_checks() {
        let base = layout(TableFormat::Dos, &[(0, 2048, 10000), (1, 9000, 20000), (2, 30000, 40000)]);
        let plan = plan(&base, &Intent::Delete { index: 2 }).unwrap();
        assert!(!plan.is_valid());
        let failed: Vec<Invariant> = plan
            .checks()
            .iter()
            .filter(|c| !c.satisfied())
            .map(|c| c.invariant)
            .collect();
        assert_eq!(failed, vec![Invariant::NonOverlap]);

        let repaired = plan.then(&Intent::Delete { index: 1 }).unwrap();
        assert!(repaired.is_valid());
    }
}

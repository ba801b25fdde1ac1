// SPDX-License-Identifier: GPL-3.0-only

//! Batch files for `diskman apply`
//!
//! A batch is a TOML file of `[[step]]` tables, committed as one plan:
//!
//! ```toml
//! [[step]]
//! op = "delete"
//! partition = 2
//!
//! [[step]]
//! op = "create"
//! size = "3G"
//! type = "Linux"
//! ```
//!
//! Partitions are numbered from 1 as `diskman show` prints them. Sizes and
//! starts are sector counts or sizes with a unit.

use anyhow::{Context, Result, anyhow, bail};
use diskman_core::{Intent, Plan};
use diskman_types::{Layout, find_free_start, parse_sectors};
use serde::Deserialize;

pub const DEFAULT_TYPE: &str = "Linux";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Batch {
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    Resize {
        partition: u32,
        size: String,
    },
    Delete {
        partition: u32,
    },
    Create {
        size: String,
        #[serde(default)]
        start: Option<String>,
        #[serde(rename = "type", default = "default_type")]
        kind: String,
        #[serde(default)]
        label: String,
    },
}

fn default_type() -> String {
    DEFAULT_TYPE.to_string()
}

impl Batch {
    pub fn parse(text: &str) -> Result<Self> {
        let batch: Self = toml::from_str(text)?;
        if batch.steps.is_empty() {
            bail!("batch has no steps");
        }
        Ok(batch)
    }

    /// Fold the steps into a plan on top of `plan`.
    ///
    /// Each step is resolved against the target of the steps before it, so
    /// automatic placement sees space freed earlier in the batch.
    pub fn extend(&self, mut plan: Plan, alignment_bytes: u64) -> Result<Plan> {
        for (n, step) in self.steps.iter().enumerate() {
            let intent = step
                .to_intent(plan.target(), alignment_bytes)
                .with_context(|| format!("step {}", n + 1))?;
            plan = plan
                .then(&intent)
                .with_context(|| format!("step {}: {intent}", n + 1))?;
        }
        Ok(plan)
    }
}

/// Turn a 1-based partition number into an entry index
pub fn partition_index(number: u32) -> Result<u32> {
    number
        .checked_sub(1)
        .ok_or_else(|| anyhow!("partition numbers start at 1"))
}

impl Step {
    pub fn to_intent(&self, layout: &Layout, alignment_bytes: u64) -> Result<Intent> {
        let sector_size = layout.geometry().logical_sector_size;
        let intent = match self {
            Step::Resize { partition, size } => Intent::Resize {
                index: partition_index(*partition)?,
                new_size: parse_sectors(size, sector_size)?,
            },
            Step::Delete { partition } => Intent::Delete {
                index: partition_index(*partition)?,
            },
            Step::Create {
                size,
                start,
                kind,
                label,
            } => {
                let size = parse_sectors(size, sector_size)?;
                let start = match start {
                    Some(start) => parse_sectors(start, sector_size)?,
                    None => place(layout, size, alignment_bytes)?,
                };
                Intent::Create {
                    start,
                    size,
                    kind: kind.clone(),
                    label: label.clone(),
                }
            }
        };
        Ok(intent)
    }
}

/// First aligned free start with room for `size` sectors
pub fn place(layout: &Layout, size: u64, alignment_bytes: u64) -> Result<u64> {
    find_free_start(layout, size, alignment_bytes)
        .ok_or_else(|| anyhow!("no free region holds {size} sectors"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskman_types::{DiskId, Geometry, Partition, PartitionType, SectorRange, TableLabel};

    const MIB: u64 = 1024 * 1024;

    fn dos_layout() -> Layout {
        let geometry = Geometry::new(8_388_608, 512, 512).unwrap();
        let label = TableLabel::new(&geometry, DiskId::Dos(0x1234)).unwrap();
        Layout::new(
            geometry,
            label,
            vec![
                Partition::new(0, SectorRange::new(2048, 1026047), PartitionType::Dos(0x83)),
                Partition::new(1, SectorRange::new(1026048, 2097151), PartitionType::Dos(0x82)),
            ],
        )
    }

    #[test]
    fn parses_steps_with_defaults() {
        let batch = Batch::parse(
            r#"
            [[step]]
            op = "delete"
            partition = 2

            [[step]]
            op = "create"
            size = "3G"
            "#,
        )
        .unwrap();

        assert_eq!(batch.steps[0], Step::Delete { partition: 2 });
        assert_eq!(
            batch.steps[1],
            Step::Create {
                size: "3G".to_string(),
                start: None,
                kind: "Linux".to_string(),
                label: String::new(),
            }
        );
    }

    #[test]
    fn rejects_empty_and_unknown_steps() {
        assert!(Batch::parse("").is_err());
        assert!(Batch::parse("[[step]]\nop = \"format\"\n").is_err());
        assert!(Batch::parse("[[step]]\nop = \"delete\"\npartition = 1\nforce = true\n").is_err());
    }

    #[test]
    fn partition_zero_is_refused() {
        let layout = dos_layout();
        let step = Step::Delete { partition: 0 };
        assert!(step.to_intent(&layout, MIB).is_err());
    }

    #[test]
    fn sizes_accept_units() {
        let layout = dos_layout();
        let step = Step::Resize {
            partition: 1,
            size: "1G".to_string(),
        };
        assert_eq!(
            step.to_intent(&layout, MIB).unwrap(),
            Intent::Resize {
                index: 0,
                new_size: 2_097_152,
            }
        );
    }

    #[test]
    fn creation_reuses_space_freed_earlier_in_the_batch() {
        let layout = dos_layout();
        let base = diskman_core::plan_all(&layout, &[]).unwrap();
        let batch = Batch::parse(
            r#"
            [[step]]
            op = "delete"
            partition = 2

            [[step]]
            op = "create"
            size = "6291456"
            type = "Linux swap"
            "#,
        )
        .unwrap();

        let plan = batch.extend(base, MIB).unwrap();
        let created = plan.target().get(1).unwrap();
        assert_eq!(created.start, 1_026_048);
        assert_eq!(created.sectors(), 6_291_456);
        assert_eq!(created.kind, PartitionType::Dos(0x82));
    }

    #[test]
    fn failing_step_is_named() {
        let layout = dos_layout();
        let base = diskman_core::plan_all(&layout, &[]).unwrap();
        let batch = Batch::parse("[[step]]\nop = \"delete\"\npartition = 4\n").unwrap();

        let err = batch.extend(base, MIB).unwrap_err();
        assert!(format!("{err:#}").starts_with("step 1"));
    }
}

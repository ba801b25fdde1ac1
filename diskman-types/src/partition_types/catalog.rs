// SPDX-License-Identifier: GPL-3.0-only

use super::PartitionTypeInfo;
use serde::Deserialize;

// Load TOML data at compile time from the workspace resources directory
const GPT_TOML: &str = include_str!("../../../resources/types/gpt_types.toml");
const DOS_TOML: &str = include_str!("../../../resources/types/dos_types.toml");

#[derive(Deserialize)]
struct PartitionTypeCatalog {
    types: Vec<PartitionTypeInfo>,
}

fn parse_catalog(raw: &str) -> Vec<PartitionTypeInfo> {
    toml::from_str::<PartitionTypeCatalog>(raw)
        .map(|catalog| catalog.types)
        .unwrap_or_default()
}

pub static PARTITION_TYPES: std::sync::LazyLock<Vec<PartitionTypeInfo>> =
    std::sync::LazyLock::new(|| {
        let mut all_types = parse_catalog(GPT_TOML);
        all_types.extend(parse_catalog(DOS_TOML));
        all_types
    });

// SPDX-License-Identifier: GPL-3.0-only

use super::{PARTITION_TYPES, PartitionTypeInfo};

pub fn find_by_id(type_id: String) -> Option<PartitionTypeInfo> {
    PARTITION_TYPES
        .iter()
        .find(|p| p.ty.eq_ignore_ascii_case(&type_id))
        .cloned()
}

/// Look a type up by its name (or one of its aliases) within a table type.
pub fn find_by_name(table_type: &str, name: &str) -> Option<PartitionTypeInfo> {
    let candidates = || PARTITION_TYPES.iter().filter(|p| p.table_type == table_type);

    candidates()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .or_else(|| {
            candidates().find(|p| p.aliases.iter().any(|alias| alias.eq_ignore_ascii_case(name)))
        })
        .cloned()
}

pub fn get_all_partition_type_infos(table_type: &str) -> Vec<PartitionTypeInfo> {
    PARTITION_TYPES
        .iter()
        .filter(|p| p.table_type == table_type)
        .cloned()
        .collect()
}

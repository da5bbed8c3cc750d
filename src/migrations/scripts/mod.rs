//! Registered migration steps, one module per version.

pub mod m1_0_0_initial_schema;
pub mod m1_0_14_recompute_project_status;
pub mod m1_0_1_seed_asset_types;
pub mod m1_0_2_rename_history;
pub mod m1_0_3_normalize_legacy_numbers;
pub mod m1_1_0_merge_valve_chamber;
pub mod m1_1_1_replace_priority_levels;

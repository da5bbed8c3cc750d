use async_trait::async_trait;

use crate::error::StepError;
use crate::migrations::reference::{replace_owned_group, ReferenceEntry};
use crate::migrations::{FailurePolicy, MigrationContext, MigrationStep};

const PRIORITY_LEVEL_GROUP: &str = "priorityLevel";

fn priority_levels() -> Vec<ReferenceEntry> {
    [
        ("1", "Projet en cours", "Ongoing project"),
        ("2", "Conflit avec un projet en cours", "Conflict with an ongoing project"),
        ("3", "Actif en mauvais état", "Asset in poor condition"),
        ("4", "Autre", "Other"),
    ]
    .into_iter()
    .zip(1..)
    .map(|((code, fr, en), order)| ReferenceEntry::new(PRIORITY_LEVEL_GROUP, code, fr, en).with_display_order(order))
    .collect()
}

/// The priority level group is defined here in full; older entries are discarded.
pub struct ReplacePriorityLevels;

#[async_trait]
impl MigrationStep for ReplacePriorityLevels {
    fn name(&self) -> &'static str {
        "replace_priority_levels"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Strict
    }

    async fn apply(&self, ctx: &MigrationContext<'_>) -> Result<(), StepError> {
        replace_owned_group(ctx, PRIORITY_LEVEL_GROUP, &priority_levels()).await?;
        Ok(())
    }
}

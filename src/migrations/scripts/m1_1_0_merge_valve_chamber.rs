use async_trait::async_trait;

use super::m1_0_1_seed_asset_types::{asset_types, ASSET_TYPE_GROUP};
use crate::error::StepError;
use crate::migrations::collections::{INTERVENTIONS, PROGRAM_BOOKS, PROJECTS, TAXONOMIES};
use crate::migrations::reference::{CodeChange, ReferencePath};
use crate::migrations::{FailurePolicy, MigrationContext, MigrationStep};

const DUPLICATE: &str = "valveChamber";
const SURVIVOR: &str = "aqueductValveChamber";

/// Every place an asset type code is stored.
fn asset_type_references() -> Vec<ReferencePath> {
    vec![
        ReferencePath::new(INTERVENTIONS, "assets[].typeId"),
        ReferencePath::new(PROJECTS, "interventions[].assets[].typeId"),
        ReferencePath::new(PROGRAM_BOOKS, "objectives[].values.assetTypeIds[]"),
    ]
}

/// `valveChamber` duplicated `aqueductValveChamber`; keep the latter.
pub struct MergeValveChamber;

#[async_trait]
impl MigrationStep for MergeValveChamber {
    fn name(&self) -> &'static str {
        "merge_valve_chamber"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Strict
    }

    async fn apply(&self, ctx: &MigrationContext<'_>) -> Result<(), StepError> {
        let survivor: Vec<_> = asset_types().into_iter().filter(|entry| entry.code == SURVIVOR).collect();
        let report = ctx.batch().upsert_reference_entries(TAXONOMIES, &survivor).await;
        ctx.settle(report)?;

        let rewritten = CodeChange::new(ASSET_TYPE_GROUP, DUPLICATE, SURVIVOR)
            .merge(ctx, &asset_type_references())
            .await?;
        ctx.info(format!("{rewritten} document(s) now reference '{SURVIVOR}'"));
        Ok(())
    }
}

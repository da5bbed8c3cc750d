use async_trait::async_trait;
use mongodb::bson::doc;

use crate::error::StepError;
use crate::migrations::collections::TAXONOMIES;
use crate::migrations::reference::ReferenceEntry;
use crate::migrations::{FailurePolicy, MigrationContext, MigrationStep};

pub const ASSET_TYPE_GROUP: &str = "assetType";

pub(crate) fn asset_types() -> Vec<ReferenceEntry> {
    vec![
        ReferenceEntry::new(ASSET_TYPE_GROUP, "fireHydrant", "Borne d'incendie", "Fire hydrant")
            .with_properties(doc! {"namespace": "aqueducts", "owners": ["dre"]})
            .with_display_order(1),
        ReferenceEntry::new(
            ASSET_TYPE_GROUP,
            "aqueductValveChamber",
            "Chambre de vanne d'aqueduc",
            "Aqueduct valve chamber",
        )
        .with_properties(doc! {"namespace": "aqueducts", "owners": ["dre"]})
        .with_display_order(2),
        ReferenceEntry::new(ASSET_TYPE_GROUP, "valveChamber", "Chambre de vanne", "Valve chamber")
            .with_properties(doc! {"namespace": "aqueducts", "owners": ["dre"]})
            .with_display_order(3),
        ReferenceEntry::new(ASSET_TYPE_GROUP, "sewerManhole", "Regard d'égout", "Sewer manhole")
            .with_properties(doc! {"namespace": "sewers", "owners": ["dre"]})
            .with_display_order(4),
        ReferenceEntry::new(ASSET_TYPE_GROUP, "roadway", "Chaussée", "Roadway")
            .with_properties(doc! {"namespace": "roads", "owners": ["sum", "borough"]})
            .with_display_order(5),
    ]
}

pub struct SeedAssetTypes;

#[async_trait]
impl MigrationStep for SeedAssetTypes {
    fn name(&self) -> &'static str {
        "seed_asset_types"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Strict
    }

    async fn apply(&self, ctx: &MigrationContext<'_>) -> Result<(), StepError> {
        let report = ctx.batch().upsert_reference_entries(TAXONOMIES, &asset_types()).await;
        let report = ctx.settle(report)?;
        ctx.info(format!("{} asset type(s) inserted, {} updated", report.upserted, report.modified));
        Ok(())
    }
}

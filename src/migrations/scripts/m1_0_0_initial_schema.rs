use async_trait::async_trait;
use mongodb::bson::doc;

use crate::error::StepError;
use crate::migrations::collections::{COUNTERS, INTERVENTIONS, LEGACY_HISTORY, PROGRAM_BOOKS, PROJECTS, TAXONOMIES};
use crate::migrations::reference::seed_sequence;
use crate::migrations::{FailurePolicy, MigrationContext, MigrationStep};
use crate::store::IndexDefinition;

/// Sequences and the first value each one hands out.
const SEQUENCES: [(&str, i64); 3] = [("interventionId", 1), ("projectId", 1), ("programBookId", 1)];

pub struct InitialSchema;

#[async_trait]
impl MigrationStep for InitialSchema {
    fn name(&self) -> &'static str {
        "initial_schema"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Strict
    }

    async fn apply(&self, ctx: &MigrationContext<'_>) -> Result<(), StepError> {
        let store = ctx.store();
        for collection in [TAXONOMIES, INTERVENTIONS, PROJECTS, PROGRAM_BOOKS, COUNTERS, LEGACY_HISTORY] {
            store.create_collection(collection).await?;
        }

        store
            .create_index(TAXONOMIES, IndexDefinition::new("group_code_unique", doc! {"group": 1, "code": 1}).unique())
            .await?;
        store.create_index(INTERVENTIONS, IndexDefinition::new("project_id", doc! {"project.id": 1})).await?;
        store.create_index(PROJECTS, IndexDefinition::new("status", doc! {"status": 1})).await?;
        store
            .create_index(PROGRAM_BOOKS, IndexDefinition::new("annual_program_id", doc! {"annualProgramId": 1}))
            .await?;

        for (name, start) in SEQUENCES {
            seed_sequence(ctx, name, start).await?;
        }
        ctx.info("Collections, indexes and sequences in place");
        Ok(())
    }
}

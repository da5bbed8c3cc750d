use std::collections::HashSet;

use async_trait::async_trait;
use mongodb::bson::doc;

use crate::error::StepError;
use crate::migrations::collections::{HISTORIES, LEGACY_HISTORY};
use crate::migrations::{FailurePolicy, MigrationContext, MigrationStep};
use crate::store::{document_key, IndexDefinition};

/// Moves the audit trail from `history` to `histories`.
///
/// When both collections exist (a previous attempt created `histories` but died
/// before dropping `history`) the documents not yet copied are moved over first.
pub struct RenameHistoryCollection;

#[async_trait]
impl MigrationStep for RenameHistoryCollection {
    fn name(&self) -> &'static str {
        "rename_history_collection"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Strict
    }

    async fn apply(&self, ctx: &MigrationContext<'_>) -> Result<(), StepError> {
        let store = ctx.store();
        let collections = store.list_collections().await?;
        let has_legacy = collections.iter().any(|c| c == LEGACY_HISTORY);
        let has_target = collections.iter().any(|c| c == HISTORIES);

        match (has_legacy, has_target) {
            (true, false) => {
                store.rename_collection(LEGACY_HISTORY, HISTORIES).await?;
                ctx.info(format!("Renamed '{LEGACY_HISTORY}' to '{HISTORIES}'"));
            }
            (true, true) => {
                let present: HashSet<String> =
                    store.find(HISTORIES, doc! {}).await?.iter().map(document_key).collect();
                let missing: Vec<_> = store
                    .find(LEGACY_HISTORY, doc! {})
                    .await?
                    .into_iter()
                    .filter(|entry| !present.contains(&document_key(entry)))
                    .collect();
                let moved = if missing.is_empty() { 0 } else { store.insert_many(HISTORIES, missing).await? };
                store.drop_collection(LEGACY_HISTORY).await?;
                ctx.info(format!("Moved {moved} remaining document(s) into '{HISTORIES}'"));
            }
            (false, _) => store.create_collection(HISTORIES).await?,
        }

        store
            .create_index(HISTORIES, IndexDefinition::new("reference", doc! {"objectTypeId": 1, "referenceId": 1}))
            .await?;
        Ok(())
    }
}

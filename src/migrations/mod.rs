//! Versioned schema and reference-data migrations.
//!
//! A migration is a [`MigrationStep`] registered under a [`SchemaVersion`] in the
//! [`VersionCatalog`]. The [`MigrationRunner`] reads the stored version marker,
//! applies every registered step above it in ascending version order and advances
//! the marker after each step that succeeds. The first failing step halts the run;
//! re-running resumes from that step.
//!
//! Steps must be safe to re-apply: a step interrupted before the marker moved is
//! executed again from the start on the next run. Reference data is upserted by
//! `(group, code)`, data wholly owned by a step is deleted then re-inserted, and
//! nothing is inserted blindly.
//!
//! # Adding a migration
//!
//! 1. Create `scripts/m<major>_<minor>_<patch>_<what>.rs` with a unit struct implementing
//!    [`MigrationStep`].
//! 2. Register it in [`all_migrations`] under its version.

use async_trait::async_trait;

use crate::error::{MigrationError, StepError};
use crate::version::SchemaVersion;

pub mod batch;
pub mod catalog;
pub mod collections;
pub mod context;
pub mod reference;
pub mod reporter;
pub mod runner;
pub mod scripts;
pub mod verify;

pub use batch::{BatchReport, BatchUpdateExecutor, BatchWrite, PartialBatchFailure};
pub use catalog::{MigrationDescriptor, VersionCatalog};
pub use context::MigrationContext;
pub use reporter::{MigrationReporter, Phase, StepEvent};
pub use runner::{MigrationOutcome, MigrationRunner, MigrationStatus, OutcomeStatus, RunReport, RunnerConfig};
pub use verify::ConsistencyVerifier;

/// How a step reacts to individual write failures inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Any failed batched write fails the step, halting the run.
    Strict,
    /// Failed writes are logged with their document identifier and the step carries on.
    #[default]
    BestEffort,
}

/// One versioned unit of database transformation.
#[async_trait]
pub trait MigrationStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::BestEffort
    }

    async fn apply(&self, ctx: &MigrationContext<'_>) -> Result<(), StepError>;
}

/// The registration table: every migration the binary knows about.
pub fn all_migrations() -> Result<VersionCatalog, MigrationError> {
    use scripts::*;

    let mut catalog = VersionCatalog::new();
    catalog.register(SchemaVersion::new(1, 0, 0), m1_0_0_initial_schema::InitialSchema)?;
    catalog.register(SchemaVersion::new(1, 0, 1), m1_0_1_seed_asset_types::SeedAssetTypes)?;
    catalog.register(SchemaVersion::new(1, 0, 2), m1_0_2_rename_history::RenameHistoryCollection)?;
    catalog.register(SchemaVersion::new(1, 0, 3), m1_0_3_normalize_legacy_numbers::NormalizeLegacyNumbers)?;
    catalog.register(SchemaVersion::new(1, 0, 14), m1_0_14_recompute_project_status::RecomputeProjectStatus)?;
    catalog.register(SchemaVersion::new(1, 1, 0), m1_1_0_merge_valve_chamber::MergeValveChamber)?;
    catalog.register(SchemaVersion::new(1, 1, 1), m1_1_1_replace_priority_levels::ReplacePriorityLevels)?;
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_valid_and_ordered() {
        let catalog = all_migrations().unwrap();
        let versions: Vec<String> = catalog.list().iter().map(|d| d.version.to_string()).collect();
        assert_eq!(versions, vec!["1.0.0", "1.0.1", "1.0.2", "1.0.3", "1.0.14", "1.1.0", "1.1.1"]);
        assert_eq!(catalog.latest(), Some(SchemaVersion::new(1, 1, 1)));
    }

    #[tokio::test]
    async fn test_full_catalog_on_legacy_database() {
        use crate::store::{DocumentStore, MemoryStore};
        use mongodb::bson::doc;

        let store = MemoryStore::new();
        store.insert_many(collections::LEGACY_HISTORY, vec![doc! {"_id": "h1", "referenceId": "I1"}]).await.unwrap();
        store
            .insert_many(
                collections::INTERVENTIONS,
                vec![doc! {"_id": "I1", "interventionYear": "", "assets": [{"typeId": "valveChamber"}]}],
            )
            .await
            .unwrap();
        let runner = MigrationRunner::new(all_migrations().unwrap(), RunnerConfig::default());

        let report = runner.run(&store).await.unwrap();

        assert_eq!(report.to, SchemaVersion::new(1, 1, 1));
        assert_eq!(report.applied(), 7);
        assert_eq!(
            store.find(collections::INTERVENTIONS, doc! {}).await.unwrap(),
            vec![doc! {
                "_id": "I1",
                "interventionYear": mongodb::bson::Bson::Null,
                "assets": [{"typeId": "aqueductValveChamber"}],
            }]
        );
        assert_eq!(store.count(collections::HISTORIES, doc! {}).await.unwrap(), 1);
        assert_eq!(store.count(collections::TAXONOMIES, doc! {"code": "valveChamber"}).await.unwrap(), 0);
        assert_eq!(
            runner.status(&store).await.unwrap(),
            MigrationStatus::UpToDate { current: SchemaVersion::new(1, 1, 1) }
        );
        assert_eq!(runner.run(&store).await.unwrap().applied(), 0);
    }
}

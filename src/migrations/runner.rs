use mongodb::bson::{doc, DateTime as MongoDateTime};
use serde::Serialize;
use tracing::Instrument;

use super::batch::DEFAULT_CHUNK_SIZE;
use super::catalog::VersionCatalog;
use super::context::MigrationContext;
use super::reporter::MigrationReporter;
use crate::error::{MigrationError, StoreError};
use crate::store::{delete_scoped, DocumentStore, WriteOptions};
use crate::telemetry::create_step_span;
use crate::version::SchemaVersion;

/// `_id` of the single marker document.
pub const MARKER_ID: &str = "current";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub version_collection: String,
    pub history_collection: String,
    pub chunk_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            version_collection: "schemaVersion".to_string(),
            history_collection: "migrationHistory".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOutcome {
    pub version: SchemaVersion,
    pub name: String,
    pub status: OutcomeStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a run that reached its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub outcomes: Vec<MigrationOutcome>,
}

impl RunReport {
    pub fn applied(&self) -> usize {
        self.outcomes.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    UpToDate { current: SchemaVersion },
    Pending { current: SchemaVersion, target: SchemaVersion, steps: Vec<(SchemaVersion, &'static str)> },
    AheadOfCatalog { current: SchemaVersion, latest: Option<SchemaVersion> },
}

pub struct MigrationRunner {
    catalog: VersionCatalog,
    config: RunnerConfig,
    reporter: MigrationReporter,
}

impl MigrationRunner {
    pub fn new(catalog: VersionCatalog, config: RunnerConfig) -> Self {
        Self { catalog, config, reporter: MigrationReporter::new() }
    }

    pub fn with_reporter(mut self, reporter: MigrationReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn catalog(&self) -> &VersionCatalog {
        &self.catalog
    }

    /// Version of the last fully applied step, `0.0.0` when no marker exists.
    pub async fn current_version(&self, store: &dyn DocumentStore) -> Result<SchemaVersion, MigrationError> {
        let mut markers = store.find(&self.config.version_collection, doc! {"_id": MARKER_ID}).await?;
        let Some(marker) = markers.pop() else {
            return Ok(SchemaVersion::ZERO);
        };
        let version = marker
            .get_str("version")
            .map_err(|e| MigrationError::InvalidMarker(format!("field 'version': {e}")))?;
        version.parse().map_err(|_| MigrationError::InvalidMarker(format!("unparsable version '{version}'")))
    }

    async fn persist_version(&self, store: &dyn DocumentStore, version: SchemaVersion) -> Result<(), StoreError> {
        store
            .update_one(
                &self.config.version_collection,
                doc! {"_id": MARKER_ID},
                doc! {"$set": {"version": version.to_string(), "updatedAt": MongoDateTime::now()}},
                WriteOptions::upsert(),
            )
            .await?;
        Ok(())
    }

    async fn record_history(&self, store: &dyn DocumentStore, outcome: &MigrationOutcome) -> Result<(), StoreError> {
        store
            .update_one(
                &self.config.history_collection,
                doc! {"version": outcome.version.to_string()},
                doc! {"$set": {
                    "name": outcome.name.as_str(),
                    "appliedAt": MongoDateTime::now(),
                    "durationMs": i64::try_from(outcome.duration_ms).unwrap_or(i64::MAX),
                }},
                WriteOptions::upsert(),
            )
            .await?;
        Ok(())
    }

    /// Writes the history row then advances the marker. The history row is removed
    /// again when the marker cannot be written, so both keep describing the same state.
    async fn commit(&self, store: &dyn DocumentStore, outcome: &MigrationOutcome) -> Result<(), StoreError> {
        self.record_history(store, outcome).await?;
        if let Err(err) = self.persist_version(store, outcome.version).await {
            let history = doc! {"version": outcome.version.to_string()};
            if let Err(cleanup) = delete_scoped(store, &self.config.history_collection, history).await {
                tracing::warn!(
                    version = %outcome.version,
                    "Failed to remove history row for unrecorded step: {cleanup}"
                );
            }
            return Err(err);
        }
        Ok(())
    }

    pub async fn status(&self, store: &dyn DocumentStore) -> Result<MigrationStatus, MigrationError> {
        self.status_to(store, None).await
    }

    pub async fn status_to(
        &self,
        store: &dyn DocumentStore,
        target: Option<SchemaVersion>,
    ) -> Result<MigrationStatus, MigrationError> {
        let current = self.current_version(store).await?;
        let latest = self.catalog.latest();
        if current > latest.unwrap_or(SchemaVersion::ZERO) {
            return Ok(MigrationStatus::AheadOfCatalog { current, latest });
        }
        let steps: Vec<(SchemaVersion, &'static str)> = self
            .catalog
            .pending_since(current)
            .into_iter()
            .filter(|descriptor| target.map_or(true, |target| descriptor.version <= target))
            .map(|descriptor| (descriptor.version, descriptor.name()))
            .collect();
        match steps.last() {
            Some(&(target, _)) => Ok(MigrationStatus::Pending { current, target, steps }),
            None => Ok(MigrationStatus::UpToDate { current }),
        }
    }

    /// Applies every pending step.
    pub async fn run(&self, store: &dyn DocumentStore) -> Result<RunReport, MigrationError> {
        self.run_to(store, None).await
    }

    /// Applies pending steps up to and including `target`, one at a time.
    ///
    /// The marker is advanced after each step that succeeds. The first failing step
    /// stops the run and the marker stays at the last step that completed.
    pub async fn run_to(
        &self,
        store: &dyn DocumentStore,
        target: Option<SchemaVersion>,
    ) -> Result<RunReport, MigrationError> {
        let current = self.current_version(store).await?;
        if let Some(latest) = self.catalog.latest() {
            if current > latest {
                tracing::warn!(
                    current = %current,
                    latest = %latest,
                    "Stored schema version is newer than every registered migration, nothing to apply"
                );
            }
        }

        let pending: Vec<_> = self
            .catalog
            .pending_since(current)
            .into_iter()
            .filter(|descriptor| target.map_or(true, |target| descriptor.version <= target))
            .collect();
        let Some(last) = pending.last() else {
            tracing::info!(current = %current, "Schema is up to date");
            return Ok(RunReport { from: current, to: current, outcomes: Vec::new() });
        };
        tracing::info!("Migrating schema from v{} to v{} ({} step(s))", current, last.version, pending.len());

        let mut last_applied = current;
        let mut outcomes = Vec::with_capacity(pending.len());
        for descriptor in pending {
            let name = descriptor.name();
            let step_reporter = self.reporter.step(descriptor.version, name);
            let ctx = MigrationContext::new(store, step_reporter.clone(), descriptor.policy(), self.config.chunk_size);

            let result = descriptor
                .step
                .apply(&ctx)
                .instrument(create_step_span(&descriptor.version.to_string(), name))
                .await;
            let duration_ms = step_reporter.elapsed_ms();

            if let Err(source) = result {
                let outcome = MigrationOutcome {
                    version: descriptor.version,
                    name: name.to_string(),
                    status: OutcomeStatus::Failed,
                    duration_ms,
                    error: Some(source.to_string()),
                };
                step_reporter.error(format!("Migration '{name}' failed: {source}"));
                tracing::error!(
                    last_applied = %last_applied,
                    failed_version = %outcome.version,
                    outcome = %serde_json::to_string(&outcome).unwrap_or_default(),
                    "Migration halted; fix the step and re-run to resume from v{}",
                    outcome.version
                );
                return Err(MigrationError::StepExecution {
                    last_applied,
                    failed_version: descriptor.version,
                    name: outcome.name,
                    source,
                });
            }

            let outcome = MigrationOutcome {
                version: descriptor.version,
                name: name.to_string(),
                status: OutcomeStatus::Success,
                duration_ms,
                error: None,
            };
            if let Err(source) = self.commit(store, &outcome).await {
                step_reporter
                    .error(format!("Migration '{name}' ran but the version marker was not advanced: {source}"));
                tracing::error!(
                    last_applied = %last_applied,
                    failed_version = %descriptor.version,
                    "Version marker write failed; re-run to apply v{} again",
                    descriptor.version
                );
                return Err(MigrationError::MarkerWrite {
                    last_applied,
                    failed_version: descriptor.version,
                    name: outcome.name,
                    source,
                });
            }
            last_applied = descriptor.version;
            step_reporter.done(format!("Migration '{name}' applied in {duration_ms}ms"));
            outcomes.push(outcome);
        }

        tracing::info!("Schema migrated to v{}", last_applied);
        Ok(RunReport { from: current, to: last_applied, outcomes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::error::StepError;
    use crate::migrations::reporter::tests::capturing_reporter;
    use crate::migrations::reporter::Phase;
    use crate::migrations::{FailurePolicy, MigrationStep};
    use crate::store::{DeleteOutcome, IndexDefinition, MemoryStore, UpdateOutcome};
    use mongodb::bson::Document;

    /// Records its invocation, writes one document and fails while `fail` is set.
    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MigrationStep for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn policy(&self) -> FailurePolicy {
            FailurePolicy::Strict
        }

        async fn apply(&self, ctx: &MigrationContext<'_>) -> Result<(), StepError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StepError::UnexpectedShape {
                    collection: "steps".to_string(),
                    message: "forced".to_string(),
                });
            }
            ctx.store()
                .update_one("steps", doc! {"_id": self.name}, doc! {"$inc": {"applied": 1}}, WriteOptions::upsert())
                .await?;
            Ok(())
        }
    }

    /// Updates three documents in one batch; the write to `bad` is rejected by the store.
    struct PartialWrites;

    #[async_trait]
    impl MigrationStep for PartialWrites {
        fn name(&self) -> &'static str {
            "partial_writes"
        }

        fn policy(&self) -> FailurePolicy {
            FailurePolicy::Strict
        }

        async fn apply(&self, ctx: &MigrationContext<'_>) -> Result<(), StepError> {
            let items = ctx.store().find("steps", doc! {}).await?;
            let report = ctx
                .batch()
                .apply("steps", items, |item| match item.get_str("_id").ok() {
                    Some("bad") => Some(doc! {"$push": {"tags": "x"}}),
                    _ => Some(doc! {"$set": {"done": true}}),
                })
                .await;
            ctx.settle(report)?;
            Ok(())
        }
    }

    /// Delegates to a [`MemoryStore`] but rejects every write to the version marker.
    struct MarkerRefusingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DocumentStore for MarkerRefusingStore {
        async fn find(&self, collection: &str, filter: Document) -> Result<Vec<Document>, StoreError> {
            self.inner.find(collection, filter).await
        }

        async fn count(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
            self.inner.count(collection, filter).await
        }

        async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<u64, StoreError> {
            self.inner.insert_many(collection, documents).await
        }

        async fn update_one(
            &self,
            collection: &str,
            filter: Document,
            update: Document,
            options: WriteOptions,
        ) -> Result<UpdateOutcome, StoreError> {
            if collection == "schemaVersion" {
                return Err(StoreError::InvalidUpdate("marker write refused".to_string()));
            }
            self.inner.update_one(collection, filter, update, options).await
        }

        async fn update_many(
            &self,
            collection: &str,
            filter: Document,
            update: Document,
            options: WriteOptions,
        ) -> Result<UpdateOutcome, StoreError> {
            self.inner.update_many(collection, filter, update, options).await
        }

        async fn delete_many(&self, collection: &str, filter: Document) -> Result<DeleteOutcome, StoreError> {
            self.inner.delete_many(collection, filter).await
        }

        async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
            self.inner.create_collection(name).await
        }

        async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_collections().await
        }

        async fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError> {
            self.inner.rename_collection(from, to).await
        }

        async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
            self.inner.drop_collection(name).await
        }

        async fn create_index(&self, collection: &str, index: IndexDefinition) -> Result<(), StoreError> {
            self.inner.create_index(collection, index).await
        }
    }

    struct Fixture {
        log: Arc<Mutex<Vec<&'static str>>>,
        failing: Arc<AtomicBool>,
    }

    impl Fixture {
        fn new() -> Self {
            Self { log: Arc::new(Mutex::new(Vec::new())), failing: Arc::new(AtomicBool::new(false)) }
        }

        /// Steps 1.0.1, 1.0.3 and 1.0.14; only 1.0.3 obeys the failure switch.
        fn runner(&self) -> MigrationRunner {
            let mut catalog = VersionCatalog::new();
            let never = Arc::new(AtomicBool::new(false));
            for (version, name, fail) in [
                ("1.0.14", "third", never.clone()),
                ("1.0.1", "first", never.clone()),
                ("1.0.3", "second", self.failing.clone()),
            ] {
                catalog
                    .register(version.parse().unwrap(), Recording { name, log: self.log.clone(), fail })
                    .unwrap();
            }
            MigrationRunner::new(catalog, RunnerConfig::default())
        }

        fn invocations(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_fresh_run_applies_all_in_numeric_order() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        let runner = fixture.runner();

        let report = runner.run(&store).await.unwrap();

        assert_eq!(fixture.invocations(), vec!["first", "second", "third"]);
        assert_eq!(report.from, SchemaVersion::ZERO);
        assert_eq!(report.to, SchemaVersion::new(1, 0, 14));
        assert!(report.outcomes.iter().all(|o| o.status == OutcomeStatus::Success && o.error.is_none()));
        assert_eq!(runner.current_version(&store).await.unwrap(), SchemaVersion::new(1, 0, 14));
        assert_eq!(store.count("migrationHistory", doc! {}).await.unwrap(), 3);
        assert_eq!(store.count("schemaVersion", doc! {}).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resume_from_failure() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        let runner = fixture.runner();
        fixture.failing.store(true, Ordering::SeqCst);

        let err = runner.run(&store).await.unwrap_err();
        match &err {
            MigrationError::StepExecution { last_applied, failed_version, name, .. } => {
                assert_eq!(*last_applied, SchemaVersion::new(1, 0, 1));
                assert_eq!(*failed_version, SchemaVersion::new(1, 0, 3));
                assert_eq!(name, "second");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(fixture.invocations(), vec!["first", "second"]);
        assert_eq!(runner.current_version(&store).await.unwrap(), SchemaVersion::new(1, 0, 1));

        fixture.failing.store(false, Ordering::SeqCst);
        let report = runner.run(&store).await.unwrap();

        assert_eq!(fixture.invocations(), vec!["first", "second", "second", "third"]);
        assert_eq!(report.from, SchemaVersion::new(1, 0, 1));
        assert_eq!(report.applied(), 2);
        assert_eq!(runner.current_version(&store).await.unwrap(), SchemaVersion::new(1, 0, 14));
        // 1.0.1 ran exactly once across both runs.
        let first = store.find("steps", doc! {"_id": "first"}).await.unwrap().remove(0);
        assert_eq!(first.get_i32("applied").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        let runner = fixture.runner();

        runner.run(&store).await.unwrap();
        let report = runner.run(&store).await.unwrap();

        assert_eq!(report.applied(), 0);
        assert_eq!(report.from, report.to);
        assert_eq!(fixture.invocations().len(), 3);
    }

    #[tokio::test]
    async fn test_run_to_stops_at_target() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        let runner = fixture.runner();

        let report = runner.run_to(&store, Some(SchemaVersion::new(1, 0, 5))).await.unwrap();

        assert_eq!(report.to, SchemaVersion::new(1, 0, 3));
        assert_eq!(fixture.invocations(), vec!["first", "second"]);
        assert_eq!(
            runner.status(&store).await.unwrap(),
            MigrationStatus::Pending {
                current: SchemaVersion::new(1, 0, 3),
                target: SchemaVersion::new(1, 0, 14),
                steps: vec![(SchemaVersion::new(1, 0, 14), "third")],
            }
        );
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        let runner = fixture.runner();

        match runner.status(&store).await.unwrap() {
            MigrationStatus::Pending { current, target, steps } => {
                assert_eq!(current, SchemaVersion::ZERO);
                assert_eq!(target, SchemaVersion::new(1, 0, 14));
                assert_eq!(steps.len(), 3);
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(
            runner.status_to(&store, Some(SchemaVersion::new(1, 0, 1))).await.unwrap(),
            MigrationStatus::Pending {
                current: SchemaVersion::ZERO,
                target: SchemaVersion::new(1, 0, 1),
                steps: vec![(SchemaVersion::new(1, 0, 1), "first")],
            }
        );

        runner.run(&store).await.unwrap();
        assert_eq!(
            runner.status(&store).await.unwrap(),
            MigrationStatus::UpToDate { current: SchemaVersion::new(1, 0, 14) }
        );
    }

    #[tokio::test]
    async fn test_marker_ahead_of_catalog_runs_nothing() {
        let store = MemoryStore::new();
        store
            .insert_many("schemaVersion", vec![doc! {"_id": MARKER_ID, "version": "2.0.0"}])
            .await
            .unwrap();
        let fixture = Fixture::new();
        let runner = fixture.runner();

        let report = runner.run(&store).await.unwrap();

        assert_eq!(report.applied(), 0);
        assert!(fixture.invocations().is_empty());
        assert_eq!(runner.current_version(&store).await.unwrap(), SchemaVersion::new(2, 0, 0));
        assert_eq!(
            runner.status(&store).await.unwrap(),
            MigrationStatus::AheadOfCatalog {
                current: SchemaVersion::new(2, 0, 0),
                latest: Some(SchemaVersion::new(1, 0, 14)),
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_marker_is_rejected() {
        let store = MemoryStore::new();
        store
            .insert_many("schemaVersion", vec![doc! {"_id": MARKER_ID, "version": "1.0"}])
            .await
            .unwrap();
        let fixture = Fixture::new();

        let result = fixture.runner().run(&store).await;

        assert!(matches!(result, Err(MigrationError::InvalidMarker(_))));
        assert!(fixture.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_reporter_receives_step_lifecycle() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        let (reporter, events) = capturing_reporter();
        let runner = fixture.runner().with_reporter(reporter);
        fixture.failing.store(true, Ordering::SeqCst);

        runner.run(&store).await.unwrap_err();

        let events = events.lock().unwrap();
        let timeline: Vec<(String, Phase)> = events.iter().map(|e| (e.step_version.to_string(), e.phase)).collect();
        assert_eq!(
            timeline,
            vec![
                ("1.0.1".to_string(), Phase::Start),
                ("1.0.1".to_string(), Phase::Done),
                ("1.0.3".to_string(), Phase::Start),
                ("1.0.3".to_string(), Phase::Error),
            ]
        );
    }

    #[tokio::test]
    async fn test_marker_write_failure_reports_versions_and_drops_history() {
        let store = MarkerRefusingStore { inner: MemoryStore::new() };
        let fixture = Fixture::new();
        let (reporter, events) = capturing_reporter();
        let runner = fixture.runner().with_reporter(reporter);

        let err = runner.run(&store).await.unwrap_err();

        match &err {
            MigrationError::MarkerWrite { last_applied, failed_version, name, source } => {
                assert_eq!(*last_applied, SchemaVersion::ZERO);
                assert_eq!(*failed_version, SchemaVersion::new(1, 0, 1));
                assert_eq!(name, "first");
                assert!(matches!(source, StoreError::InvalidUpdate(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.failed_version(), Some(SchemaVersion::new(1, 0, 1)));
        assert_eq!(fixture.invocations(), vec!["first"]);
        let phases: Vec<Phase> = events.lock().unwrap().iter().map(|e| e.phase).collect();
        assert_eq!(phases, vec![Phase::Start, Phase::Error]);
        assert_eq!(store.inner.count("migrationHistory", doc! {}).await.unwrap(), 0);
        assert_eq!(runner.current_version(&store).await.unwrap(), SchemaVersion::ZERO);
    }

    #[tokio::test]
    async fn test_strict_step_with_failed_batch_write_halts_run() {
        let store = MemoryStore::new();
        store
            .insert_many("steps", vec![doc! {"_id": "ok1"}, doc! {"_id": "bad"}, doc! {"_id": "ok2"}])
            .await
            .unwrap();
        let mut catalog = VersionCatalog::new();
        catalog.register(SchemaVersion::new(1, 0, 0), PartialWrites).unwrap();
        let runner = MigrationRunner::new(catalog, RunnerConfig::default());

        let err = runner.run(&store).await.unwrap_err();

        match err {
            MigrationError::StepExecution {
                last_applied,
                failed_version,
                source: StepError::PartialBatch { failed, attempted, .. },
                ..
            } => {
                assert_eq!(last_applied, SchemaVersion::ZERO);
                assert_eq!(failed_version, SchemaVersion::new(1, 0, 0));
                assert_eq!((failed, attempted), (1, 3));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(runner.current_version(&store).await.unwrap(), SchemaVersion::ZERO);
        assert_eq!(store.count("steps", doc! {"done": true}).await.unwrap(), 2);
        assert_eq!(store.count("migrationHistory", doc! {}).await.unwrap(), 0);
    }
}

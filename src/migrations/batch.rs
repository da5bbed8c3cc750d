//! Bounded-concurrency batched writes.
//!
//! Writes are split into chunks of `chunk_size`. The writes of one chunk are issued
//! concurrently and all of them are awaited before the next chunk starts, so at most
//! `chunk_size` operations are ever in flight against the store.

use futures::future::join_all;
use mongodb::bson::{doc, Bson, Document};

use super::reference::ReferenceEntry;
use super::reporter::StepReporter;
use crate::error::StoreError;
use crate::store::{document_key, DocumentStore, WriteOptions};

pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// One targeted write, identified by `key` in logs and failure reports.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchWrite {
    pub key: String,
    pub filter: Document,
    pub update: Document,
    pub options: WriteOptions,
}

impl BatchWrite {
    pub fn new(key: impl Into<String>, filter: Document, update: Document) -> Self {
        Self { key: key.into(), filter, update, options: WriteOptions::default() }
    }

    pub fn with_options(mut self, options: WriteOptions) -> Self {
        self.options = options;
        self
    }
}

/// A single write that failed inside a batch. Sibling writes are unaffected.
#[derive(Debug)]
pub struct PartialBatchFailure {
    pub key: String,
    pub error: StoreError,
}

#[derive(Debug)]
pub struct BatchReport {
    pub collection: String,
    pub attempted: usize,
    pub skipped: usize,
    pub modified: u64,
    pub upserted: u64,
    pub failures: Vec<PartialBatchFailure>,
}

impl BatchReport {
    pub fn new(collection: impl Into<String>) -> Self {
        Self { collection: collection.into(), attempted: 0, skipped: 0, modified: 0, upserted: 0, failures: Vec::new() }
    }

    pub fn succeeded(&self) -> usize {
        self.attempted - self.failures.len()
    }

    pub fn failed_keys(&self) -> Vec<&str> {
        self.failures.iter().map(|failure| failure.key.as_str()).collect()
    }
}

pub struct BatchUpdateExecutor<'a> {
    store: &'a dyn DocumentStore,
    reporter: StepReporter,
    chunk_size: usize,
}

impl<'a> BatchUpdateExecutor<'a> {
    pub fn new(store: &'a dyn DocumentStore, reporter: StepReporter, chunk_size: usize) -> Self {
        Self { store, reporter, chunk_size: chunk_size.max(1) }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Updates each item by `_id` with the update computed by `update_fn`.
    ///
    /// Items for which `update_fn` returns `None` are counted as skipped.
    pub async fn apply<F>(&self, collection: &str, items: Vec<Document>, update_fn: F) -> BatchReport
    where
        F: Fn(&Document) -> Option<Document>,
    {
        let mut skipped = 0;
        let mut writes = Vec::with_capacity(items.len());
        for item in &items {
            match update_fn(item) {
                Some(update) => {
                    let id = item.get("_id").cloned().unwrap_or(Bson::Null);
                    writes.push(BatchWrite::new(document_key(item), doc! {"_id": id}, update));
                }
                None => skipped += 1,
            }
        }
        let mut report = self.run(collection, writes).await;
        report.skipped = skipped;
        report
    }

    /// Upserts reference entries keyed by `(group, code)`.
    pub async fn upsert_reference_entries(&self, collection: &str, entries: &[ReferenceEntry]) -> BatchReport {
        self.run(collection, entries.iter().map(ReferenceEntry::upsert_write).collect()).await
    }

    pub async fn run(&self, collection: &str, writes: Vec<BatchWrite>) -> BatchReport {
        let mut report = BatchReport::new(collection);
        let mut remaining = writes.into_iter().peekable();
        while remaining.peek().is_some() {
            let (keys, pending): (Vec<String>, Vec<_>) = remaining
                .by_ref()
                .take(self.chunk_size)
                .map(|write| (write.key, self.store.update_one(collection, write.filter, write.update, write.options)))
                .unzip();
            let results = join_all(pending).await;
            for (key, result) in keys.into_iter().zip(results) {
                report.attempted += 1;
                match result {
                    Ok(outcome) => {
                        report.modified += outcome.modified;
                        if outcome.upserted_id.is_some() {
                            report.upserted += 1;
                        }
                    }
                    Err(error) => {
                        self.reporter.error(format!("Update of document '{key}' in '{collection}' failed: {error}"));
                        report.failures.push(PartialBatchFailure { key, error });
                    }
                }
            }
        }
        self.reporter.info(format!(
            "Batch on '{collection}': {} attempted, {} modified, {} upserted, {} skipped, {} failed",
            report.attempted,
            report.modified,
            report.upserted,
            report.skipped,
            report.failures.len()
        ));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rstest::rstest;

    use crate::migrations::reporter::tests::capturing_reporter;
    use crate::migrations::reporter::{MigrationReporter, Phase};
    use crate::store::{DeleteOutcome, IndexDefinition, MemoryStore, UpdateOutcome};
    use crate::version::SchemaVersion;

    /// Wraps a [`MemoryStore`] and records how many updates are in flight at once.
    struct CountingStore {
        inner: MemoryStore,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DocumentStore for CountingStore {
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let result = self.inner.update_one(collection, filter, update, options).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
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

    fn projects(count: usize) -> Vec<Document> {
        (0..count).map(|i| doc! {"_id": format!("P{i:04}"), "status": "planned"}).collect()
    }

    fn reporter() -> StepReporter {
        MigrationReporter::new().step(SchemaVersion::new(1, 0, 14), "batch_test")
    }

    #[rstest]
    #[case(1, 7)]
    #[case(3, 10)]
    #[case(10, 25)]
    #[case(10, 4)]
    #[tokio::test]
    async fn test_never_exceeds_chunk_size_in_flight(#[case] chunk_size: usize, #[case] items: usize) {
        let store = CountingStore::new();
        store.insert_many("projects", projects(items)).await.unwrap();

        let executor = BatchUpdateExecutor::new(&store, reporter(), chunk_size);
        let report = executor
            .apply("projects", projects(items), |_| Some(doc! {"$set": {"status": "programmed"}}))
            .await;

        assert_eq!(report.attempted, items);
        assert_eq!(report.modified, items as u64);
        assert!(report.failures.is_empty());
        assert_eq!(store.calls.load(Ordering::SeqCst), items);
        let max = store.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= chunk_size, "{max} writes in flight with chunk size {chunk_size}");
        assert_eq!(max, chunk_size.min(items));
        assert_eq!(store.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_siblings_or_later_chunks() {
        let store = MemoryStore::new();
        store.insert_many("projects", projects(6)).await.unwrap();
        let (reporter, events) = capturing_reporter();
        let executor = BatchUpdateExecutor::new(&store, reporter.step(SchemaVersion::new(1, 0, 14), "t"), 2);

        // `$push` is not understood by the store, so P0001 and P0004 fail.
        let report = executor
            .apply("projects", projects(6), |project| {
                let id = project.get_str("_id").unwrap_or_default();
                if id == "P0001" || id == "P0004" {
                    Some(doc! {"$push": {"tags": "x"}})
                } else {
                    Some(doc! {"$set": {"status": "programmed"}})
                }
            })
            .await;

        assert_eq!(report.attempted, 6);
        assert_eq!(report.succeeded(), 4);
        assert_eq!(report.failed_keys(), vec!["P0001", "P0004"]);
        assert_eq!(store.count("projects", doc! {"status": "programmed"}).await.unwrap(), 4);

        let events = events.lock().unwrap();
        let errors: Vec<&String> = events.iter().filter(|e| e.phase == Phase::Error).map(|e| &e.message).collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("P0001"));
        assert!(errors[1].contains("P0004"));
    }

    #[tokio::test]
    async fn test_skipped_items_are_not_written() {
        let store = MemoryStore::new();
        store.insert_many("projects", projects(3)).await.unwrap();
        let executor = BatchUpdateExecutor::new(&store, reporter(), DEFAULT_CHUNK_SIZE);

        let report = executor
            .apply("projects", projects(3), |project| {
                (project.get_str("_id").ok() != Some("P0001")).then(|| doc! {"$set": {"status": "canceled"}})
            })
            .await;

        assert_eq!(report.attempted, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.count("projects", doc! {"status": "planned"}).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_reference_entries_is_repeatable() {
        let store = MemoryStore::new();
        let executor = BatchUpdateExecutor::new(&store, reporter(), 2);
        let entries = vec![
            ReferenceEntry::new("assetType", "fireHydrant", "Borne d'incendie", "Fire hydrant").with_display_order(1),
            ReferenceEntry::new("assetType", "valveChamber", "Chambre de vanne", "Valve chamber"),
            ReferenceEntry::new("assetType", "sewerManhole", "Regard d'égout", "Sewer manhole"),
        ];

        let first = executor.upsert_reference_entries("taxonomies", &entries).await;
        assert_eq!(first.upserted, 3);
        let second = executor.upsert_reference_entries("taxonomies", &entries).await;
        assert_eq!(second.upserted, 0);
        assert_eq!(second.modified, 0);
        assert_eq!(store.count("taxonomies", doc! {"group": "assetType"}).await.unwrap(), 3);
    }
}

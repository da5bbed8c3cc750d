//! Document store abstraction the migration engine runs against.
//!
//! Steps never hold a collection handle of their own: every read and write goes
//! through the [`DocumentStore`] passed in the migration context, so the same step
//! runs unchanged against MongoDB or the in-memory store used by the tests.

use async_trait::async_trait;
use mongodb::bson::{Bson, Document};

use crate::error::StoreError;

mod matcher;
pub mod memory;
pub mod mongo;
mod update;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Index to create on a collection. Creation is idempotent by `name`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
    pub name: String,
    pub keys: Document,
    pub unique: bool,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, keys: Document) -> Self {
        Self { name: name.into(), keys, unique: false }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOptions {
    pub upsert: bool,
    /// Filters bound to the `$[identifier]` segments of the update paths.
    pub array_filters: Option<Vec<Document>>,
}

impl WriteOptions {
    pub fn upsert() -> Self {
        Self { upsert: true, array_filters: None }
    }

    pub fn with_array_filters(array_filters: Vec<Document>) -> Self {
        Self { upsert: false, array_filters: Some(array_filters) }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteOutcome {
    pub deleted: u64,
}

/// The store operations migration steps are allowed to use.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, collection: &str, filter: Document) -> Result<Vec<Document>, StoreError>;

    async fn count(&self, collection: &str, filter: Document) -> Result<u64, StoreError>;

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<u64, StoreError>;

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: WriteOptions,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: WriteOptions,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn delete_many(&self, collection: &str, filter: Document) -> Result<DeleteOutcome, StoreError>;

    /// Creates the collection if it does not exist yet.
    async fn create_collection(&self, name: &str) -> Result<(), StoreError>;

    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    async fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError>;

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError>;

    async fn create_index(&self, collection: &str, index: IndexDefinition) -> Result<(), StoreError>;
}

/// Deletes documents from a business collection, rejecting an empty filter.
pub async fn delete_scoped(
    store: &dyn DocumentStore,
    collection: &str,
    filter: Document,
) -> Result<DeleteOutcome, StoreError> {
    if filter.is_empty() {
        return Err(StoreError::UnscopedDelete(collection.to_string()));
    }
    store.delete_many(collection, filter).await
}

/// Best effort textual identifier of a document, used in logs.
pub fn document_key(document: &Document) -> String {
    match document.get("_id") {
        Some(Bson::String(id)) => id.clone(),
        Some(Bson::ObjectId(id)) => id.to_hex(),
        Some(other) => other.to_string(),
        None => "<no _id>".to_string(),
    }
}

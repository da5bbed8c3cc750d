//! In-memory [`DocumentStore`] used to exercise migration steps without a server.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{Bson, Document};
use tokio::sync::Mutex;

use super::matcher::{self, bson_equal};
use super::update::{apply_update, seed_from_filter};
use super::{DeleteOutcome, DocumentStore, IndexDefinition, UpdateOutcome, WriteOptions};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Collection {
    documents: Vec<Document>,
    indexes: Vec<IndexDefinition>,
}

impl Collection {
    /// Checks `candidate` against every unique index, ignoring the document at `skip`.
    fn check_unique(&self, collection: &str, candidate: &Document, skip: Option<usize>) -> Result<(), StoreError> {
        for index in self.indexes.iter().filter(|index| index.unique) {
            let key = index_key(index, candidate);
            let clash = self
                .documents
                .iter()
                .enumerate()
                .filter(|(position, _)| Some(*position) != skip)
                .any(|(_, existing)| keys_equal(&index_key(index, existing), &key));
            if clash {
                return Err(StoreError::DuplicateKey { collection: collection.to_string(), index: index.name.clone() });
            }
        }
        Ok(())
    }
}

fn index_key(index: &IndexDefinition, document: &Document) -> Vec<Bson> {
    index
        .keys
        .keys()
        .map(|field| matcher::values_at(document, field).into_iter().next().unwrap_or(Bson::Null))
        .collect()
}

fn keys_equal(left: &[Bson], right: &[Bson]) -> bool {
    left.len() == right.len() && left.iter().zip(right).all(|(l, r)| bson_equal(l, r))
}

/// Thread-safe in-memory document store.
///
/// Collections are created implicitly on first write, like MongoDB. Documents keep
/// their insertion order, which makes test assertions deterministic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<BTreeMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the indexes defined on `collection`.
    pub async fn index_names(&self, collection: &str) -> Vec<String> {
        let collections = self.collections.lock().await;
        collections
            .get(collection)
            .map(|c| c.indexes.iter().map(|index| index.name.clone()).collect())
            .unwrap_or_default()
    }

    async fn write(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: WriteOptions,
        multi: bool,
    ) -> Result<UpdateOutcome, StoreError> {
        let array_filters = options.array_filters.unwrap_or_default();
        let mut collections = self.collections.lock().await;
        let target = collections.entry(collection.to_string()).or_default();

        let mut positions = Vec::new();
        for (position, document) in target.documents.iter().enumerate() {
            if matcher::matches(document, &filter)? {
                positions.push(position);
                if !multi {
                    break;
                }
            }
        }

        if positions.is_empty() {
            if !options.upsert {
                return Ok(UpdateOutcome::default());
            }
            let mut inserted = seed_from_filter(&filter)?;
            apply_update(&mut inserted, &update, &array_filters, true)?;
            if !inserted.contains_key("_id") {
                inserted.insert("_id", ObjectId::new());
            }
            let id = inserted.get("_id").cloned().unwrap_or(Bson::Null);
            target.check_unique(collection, &inserted, None)?;
            target.documents.push(inserted);
            return Ok(UpdateOutcome { matched: 0, modified: 0, upserted_id: Some(id) });
        }

        // Stage every change first so a failing document leaves the collection untouched.
        let mut staged = HashMap::new();
        for &position in &positions {
            let mut updated = target.documents[position].clone();
            apply_update(&mut updated, &update, &array_filters, false)?;
            if updated != target.documents[position] {
                target.check_unique(collection, &updated, Some(position))?;
                staged.insert(position, updated);
            }
        }
        let modified = staged.len() as u64;
        for (position, updated) in staged {
            target.documents[position] = updated;
        }
        Ok(UpdateOutcome { matched: positions.len() as u64, modified, upserted_id: None })
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, collection: &str, filter: Document) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.lock().await;
        let Some(target) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut found = Vec::new();
        for document in &target.documents {
            if matcher::matches(document, &filter)? {
                found.push(document.clone());
            }
        }
        Ok(found)
    }

    async fn count(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
        Ok(self.find(collection, filter).await?.len() as u64)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<u64, StoreError> {
        let mut collections = self.collections.lock().await;
        let target = collections.entry(collection.to_string()).or_default();
        let mut inserted = 0;
        for mut document in documents {
            if !document.contains_key("_id") {
                document.insert("_id", ObjectId::new());
            }
            let id = document.get("_id").cloned().unwrap_or(Bson::Null);
            if target.documents.iter().any(|existing| existing.get("_id").is_some_and(|e| bson_equal(e, &id))) {
                return Err(StoreError::DuplicateKey { collection: collection.to_string(), index: "_id_".to_string() });
            }
            target.check_unique(collection, &document, None)?;
            target.documents.push(document);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: WriteOptions,
    ) -> Result<UpdateOutcome, StoreError> {
        self.write(collection, filter, update, options, false).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: WriteOptions,
    ) -> Result<UpdateOutcome, StoreError> {
        self.write(collection, filter, update, options, true).await
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> Result<DeleteOutcome, StoreError> {
        let mut collections = self.collections.lock().await;
        let Some(target) = collections.get_mut(collection) else {
            return Ok(DeleteOutcome::default());
        };
        let mut doomed = Vec::with_capacity(target.documents.len());
        for document in &target.documents {
            doomed.push(matcher::matches(document, &filter)?);
        }
        let before = target.documents.len();
        let mut flags = doomed.into_iter();
        target.documents.retain(|_| !flags.next().unwrap_or(false));
        let deleted = (before - target.documents.len()) as u64;
        Ok(DeleteOutcome { deleted })
    }

    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        self.collections.lock().await.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.collections.lock().await.keys().cloned().collect())
    }

    async fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let mut collections = self.collections.lock().await;
        if collections.contains_key(to) {
            return Err(StoreError::CollectionExists(to.to_string()));
        }
        let moved = collections.remove(from).ok_or_else(|| StoreError::CollectionNotFound(from.to_string()))?;
        collections.insert(to.to_string(), moved);
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        self.collections.lock().await.remove(name);
        Ok(())
    }

    async fn create_index(&self, collection: &str, index: IndexDefinition) -> Result<(), StoreError> {
        let mut collections = self.collections.lock().await;
        let target = collections.entry(collection.to_string()).or_default();
        if index.unique {
            for (position, document) in target.documents.iter().enumerate() {
                let key = index_key(&index, document);
                let clash = target.documents[position + 1..]
                    .iter()
                    .any(|other| keys_equal(&index_key(&index, other), &key));
                if clash {
                    return Err(StoreError::DuplicateKey { collection: collection.to_string(), index: index.name });
                }
            }
        }
        target.indexes.retain(|existing| existing.name != index.name);
        target.indexes.push(index);
        Ok(())
    }
}

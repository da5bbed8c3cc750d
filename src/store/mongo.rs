use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::{ClientOptions, IndexOptions, ServerApi, ServerApiVersion, UpdateOptions};
use mongodb::{Client, Collection, Database, IndexModel};

use super::{DeleteOutcome, DocumentStore, IndexDefinition, UpdateOutcome, WriteOptions};
use crate::config::MongoArgs;
use crate::error::StoreError;
use crate::metrics::time_store_operation;

/// [`DocumentStore`] backed by a live MongoDB database.
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    /// Connects with the pool settings from `args`. The driver connects lazily, so a
    /// bad host only surfaces on the first operation.
    pub async fn connect(args: &MongoArgs) -> Result<Self, StoreError> {
        let mut client_options = ClientOptions::parse(&args.uri).await?;
        client_options.app_name = Some("schema-migrator".to_string());
        client_options.max_pool_size = Some(args.max_pool_size);
        client_options.min_pool_size = Some(args.min_pool_size);
        client_options.max_idle_time = Some(Duration::from_millis(args.max_idle_time_ms));
        client_options.connect_timeout = Some(Duration::from_millis(args.connect_timeout_ms));
        client_options.server_api = Some(ServerApi::builder().version(ServerApiVersion::V1).build());
        let client = Client::with_options(client_options)?;
        Ok(Self::new(client, &args.database))
    }

    pub fn new(client: Client, database_name: &str) -> Self {
        let database = client.database(database_name);
        Self { client, database }
    }

    pub fn database_name(&self) -> &str {
        self.database.name()
    }

    /// Round-trips a `ping` so connection problems fail before any step runs.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.database.run_command(doc! {"ping": 1}, None).await?;
        Ok(())
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection(name)
    }
}

fn update_options(options: WriteOptions) -> UpdateOptions {
    UpdateOptions::builder().upsert(options.upsert).array_filters(options.array_filters).build()
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn find(&self, collection: &str, filter: Document) -> Result<Vec<Document>, StoreError> {
        time_store_operation("find", collection, async {
            let cursor = self.collection(collection).find(filter, None).await?;
            Ok(cursor.try_collect().await?)
        })
        .await
    }

    async fn count(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
        time_store_operation("count", collection, async {
            Ok(self.collection(collection).count_documents(filter, None).await?)
        })
        .await
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<u64, StoreError> {
        if documents.is_empty() {
            return Ok(0);
        }
        time_store_operation("insert_many", collection, async {
            let result = self.collection(collection).insert_many(documents, None).await?;
            Ok(result.inserted_ids.len() as u64)
        })
        .await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: WriteOptions,
    ) -> Result<UpdateOutcome, StoreError> {
        time_store_operation("update_one", collection, async {
            let result = self.collection(collection).update_one(filter, update, update_options(options)).await?;
            Ok(UpdateOutcome {
                matched: result.matched_count,
                modified: result.modified_count,
                upserted_id: result.upserted_id,
            })
        })
        .await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: WriteOptions,
    ) -> Result<UpdateOutcome, StoreError> {
        time_store_operation("update_many", collection, async {
            let result = self.collection(collection).update_many(filter, update, update_options(options)).await?;
            Ok(UpdateOutcome {
                matched: result.matched_count,
                modified: result.modified_count,
                upserted_id: result.upserted_id,
            })
        })
        .await
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> Result<DeleteOutcome, StoreError> {
        time_store_operation("delete_many", collection, async {
            let result = self.collection(collection).delete_many(filter, None).await?;
            Ok(DeleteOutcome { deleted: result.deleted_count })
        })
        .await
    }

    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        time_store_operation("create_collection", name, async {
            let existing = self.database.list_collection_names(None).await?;
            if !existing.iter().any(|c| c == name) {
                self.database.create_collection(name, None).await?;
            }
            Ok(())
        })
        .await
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        time_store_operation("list_collections", self.database.name(), async {
            let mut names = self.database.list_collection_names(None).await?;
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError> {
        time_store_operation("rename_collection", from, async {
            let database = self.database.name();
            let command = doc! {
                "renameCollection": format!("{database}.{from}"),
                "to": format!("{database}.{to}"),
                "dropTarget": false,
            };
            self.client.database("admin").run_command(command, None).await?;
            Ok(())
        })
        .await
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        time_store_operation("drop_collection", name, async {
            self.collection(name).drop(None).await?;
            Ok(())
        })
        .await
    }

    async fn create_index(&self, collection: &str, index: IndexDefinition) -> Result<(), StoreError> {
        time_store_operation("create_index", collection, async {
            let model = IndexModel::builder()
                .keys(index.keys)
                .options(IndexOptions::builder().name(index.name).unique(index.unique).build())
                .build();
            self.collection(collection).create_index(model, None).await?;
            Ok(())
        })
        .await
    }
}

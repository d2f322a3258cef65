//! MongoDB client and collection wrapper
//!
//! Typed collections apply their schema-declared indexes on first open.
//! The unique indexes on the journal and the ledger are what make replay
//! idempotent, so index creation failures are fatal at startup.

use bson::{doc, oid::ObjectId, DateTime, Document};
use futures_util::StreamExt;
use mongodb::{
    options::{IndexOptions, ReturnDocument, UpdateModifications},
    results::UpdateResult,
    Client, Collection, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, info};

use crate::db::schemas::Metadata;
use crate::types::{BridgeError, Result};

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// Trait for schemas with mutable metadata
pub trait MutMetadata {
    fn mut_metadata(&mut self) -> &mut Metadata;
}

/// Returns true when the error is a unique-index violation
pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    match &*err.kind {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == 11000,
        _ => false,
    }
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Connect and verify with a ping.
    ///
    /// `op_timeout` bounds individual operations (10 s in production,
    /// stretched to 10 min in dev mode for debugger-friendly sessions).
    pub async fn new(uri: &str, db_name: &str, op_timeout: std::time::Duration) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // serverSelectionTimeoutMS keeps startup from hanging on an
        // unreachable MongoDB
        let params = format!(
            "serverSelectionTimeoutMS=3000&connectTimeoutMS=3000&socketTimeoutMS={}",
            op_timeout.as_millis()
        );
        let timeout_uri = if uri.contains('?') {
            format!("{uri}&{params}")
        } else {
            format!("{uri}?{params}")
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| BridgeError::Database(format!("Failed to connect to MongoDB: {e}")))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| BridgeError::Database(format!("MongoDB ping failed: {e}")))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get a typed collection with its indexes applied
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
    {
        MongoCollection::new(&self.client, &self.db_name, name).await
    }

    /// Raw MongoDB client for aggregation pipelines
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

/// Typed MongoDB collection with automatic indexing
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
{
    pub async fn new(client: &Client, db_name: &str, collection_name: &str) -> Result<Self> {
        let collection = client.database(db_name).collection::<T>(collection_name);
        let mongo_collection = MongoCollection { inner: collection };
        mongo_collection.apply_indexes().await?;
        Ok(mongo_collection)
    }

    async fn apply_indexes(&self) -> Result<()> {
        let schema_indices = T::into_indices();
        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.inner
            .create_indexes(indices)
            .await
            .map_err(|e| BridgeError::Database(format!("Failed to create indexes: {e}")))?;

        Ok(())
    }

    /// Insert a document, setting metadata timestamps.
    ///
    /// A unique-index violation surfaces as `DuplicateEntry` so callers
    /// can treat replays as no-ops.
    pub async fn insert_one(&self, mut item: T) -> Result<ObjectId> {
        let metadata = item.mut_metadata();
        metadata.created_at = Some(DateTime::now());
        metadata.updated_at = Some(DateTime::now());

        let result = self.inner.insert_one(item).await.map_err(|e| {
            if is_duplicate_key(&e) {
                BridgeError::DuplicateEntry(format!("{e}"))
            } else {
                BridgeError::Database(format!("Insert failed: {e}"))
            }
        })?;

        result
            .inserted_id
            .as_object_id()
            .ok_or_else(|| BridgeError::Database("Failed to get inserted ID".into()))
    }

    pub async fn find_one(&self, filter: Document) -> Result<Option<T>> {
        self.inner
            .find_one(filter)
            .await
            .map_err(|e| BridgeError::Database(format!("Find failed: {e}")))
    }

    pub async fn find_many(&self, filter: Document) -> Result<Vec<T>> {
        let cursor = self
            .inner
            .find(filter)
            .await
            .map_err(|e| BridgeError::Database(format!("Find failed: {e}")))?;

        let results: Vec<T> = cursor
            .filter_map(|doc| async {
                match doc {
                    Ok(d) => Some(d),
                    Err(e) => {
                        error!("Error reading document: {}", e);
                        None
                    }
                }
            })
            .collect()
            .await;

        Ok(results)
    }

    pub async fn update_one(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
    ) -> Result<UpdateResult> {
        self.inner
            .update_one(filter, update.into())
            .await
            .map_err(|e| BridgeError::Database(format!("Update failed: {e}")))
    }

    /// Upsert keyed by `filter`
    pub async fn upsert_one(&self, filter: Document, update: Document) -> Result<UpdateResult> {
        self.inner
            .update_one(filter, update)
            .upsert(true)
            .await
            .map_err(|e| BridgeError::Database(format!("Upsert failed: {e}")))
    }

    /// Atomically claim and mutate one document, returning the new state.
    ///
    /// Used by the router to claim journal rows: the filter only matches
    /// unclaimed rows, so concurrent consumers cannot double-claim.
    pub async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        sort: Option<Document>,
    ) -> Result<Option<T>> {
        let mut action = self
            .inner
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After);
        if let Some(sort) = sort {
            action = action.sort(sort);
        }
        action
            .await
            .map_err(|e| BridgeError::Database(format!("Find-and-update failed: {e}")))
    }

    pub async fn count(&self, filter: Document) -> Result<u64> {
        self.inner
            .count_documents(filter)
            .await
            .map_err(|e| BridgeError::Database(format!("Count failed: {e}")))
    }

    /// Run an aggregation pipeline, returning raw documents
    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let cursor = self
            .inner
            .aggregate(pipeline)
            .await
            .map_err(|e| BridgeError::Database(format!("Aggregation failed: {e}")))?;

        let results: Vec<Document> = cursor
            .filter_map(|doc| async {
                match doc {
                    Ok(d) => Some(d),
                    Err(e) => {
                        error!("Error reading aggregation result: {}", e);
                        None
                    }
                }
            })
            .collect()
            .await;

        Ok(results)
    }

    /// Underlying collection for advanced operations
    pub fn inner(&self) -> &Collection<T> {
        &self.inner
    }
}

//! MongoDB client and collection wrapper
//!
//! Typed collections apply their schema indexes on open and stamp document
//! metadata on insert. Bulk helpers keep each handler step to one round trip.

use bson::{doc, Bson, DateTime, Document};
use mongodb::{options::IndexOptions, Client, Collection, Database, IndexModel};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

use crate::db::schemas::Metadata;
use crate::types::{BatchError, Result};

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// Trait for schemas with mutable metadata
pub trait MutMetadata {
    fn mut_metadata(&mut self) -> &mut Metadata;
}

/// One statement of a bulk `update` command
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub filter: Document,
    pub update: Document,
    pub upsert: bool,
}

impl UpdateStatement {
    pub fn new(filter: Document, update: Document) -> Self {
        Self {
            filter,
            update,
            upsert: false,
        }
    }

    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    fn into_document(self) -> Document {
        doc! { "q": self.filter, "u": self.update, "upsert": self.upsert }
    }
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Connect and verify with a ping
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Fail fast on an unreachable server instead of hanging
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| BatchError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| BatchError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get a typed collection, creating its indexes
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + Default + IntoIndexes + MutMetadata,
    {
        MongoCollection::new(&self.client, &self.db_name, name).await
    }

    /// Untyped handle for collections this crate only patches (counters)
    pub fn raw_collection(&self, name: &str) -> Collection<Document> {
        self.database().collection::<Document>(name)
    }

    pub fn database(&self) -> Database {
        self.client.database(&self.db_name)
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Run many updates against one collection in a single `update` command.
    ///
    /// Statements are unordered: one failing statement does not stop the
    /// rest, but any write error fails the call. Returns the matched count
    /// plus upserts.
    pub async fn bulk_update(&self, collection: &str, statements: Vec<UpdateStatement>) -> Result<u64> {
        if statements.is_empty() {
            return Ok(0);
        }

        let updates: Vec<Bson> = statements
            .into_iter()
            .map(|s| Bson::Document(s.into_document()))
            .collect();
        let reply = self
            .database()
            .run_command(doc! { "update": collection, "updates": updates, "ordered": false })
            .await
            .map_err(|e| BatchError::Database(format!("Bulk update on '{}' failed: {}", collection, e)))?;

        if let Ok(errors) = reply.get_array("writeErrors") {
            if !errors.is_empty() {
                let first = errors
                    .first()
                    .and_then(Bson::as_document)
                    .and_then(|e| e.get_str("errmsg").ok())
                    .unwrap_or("unknown write error");
                return Err(BatchError::Database(format!(
                    "Bulk update on '{}' had {} write error(s), first: {}",
                    collection,
                    errors.len(),
                    first
                )));
            }
        }

        Ok(reply_count(&reply, "n"))
    }
}

/// Read an integer field from a command reply, whatever its width
fn reply_count(reply: &Document, field: &str) -> u64 {
    match reply.get(field) {
        Some(Bson::Int32(n)) => *n as u64,
        Some(Bson::Int64(n)) => *n as u64,
        _ => 0,
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
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + Default + IntoIndexes + MutMetadata,
{
    /// Open a collection and apply its indexes
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
            .map_err(|e| BatchError::Database(format!("Failed to create indexes: {}", e)))?;

        Ok(())
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Unordered bulk insert, stamping metadata on every document
    pub async fn insert_many(&self, mut items: Vec<T>) -> Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }

        let now = DateTime::now();
        for item in items.iter_mut() {
            let metadata = item.mut_metadata();
            metadata.is_deleted = false;
            metadata.created_at = Some(now);
            metadata.updated_at = Some(now);
        }

        let result = self
            .inner
            .insert_many(items)
            .ordered(false)
            .await
            .map_err(|e| BatchError::Database(format!("Insert into '{}' failed: {}", self.name(), e)))?;

        Ok(result.inserted_ids.len() as u64)
    }

    /// Find one live document by filter
    pub async fn find_one(&self, filter: Document) -> Result<Option<T>> {
        let mut full_filter = filter;
        full_filter.insert("metadata.is_deleted", doc! { "$ne": true });

        self.inner
            .find_one(full_filter)
            .await
            .map_err(|e| BatchError::Database(format!("Find failed: {}", e)))
    }

    pub async fn count(&self, filter: Document) -> Result<u64> {
        self.inner
            .count_documents(filter)
            .await
            .map_err(|e| BatchError::Database(format!("Count on '{}' failed: {}", self.name(), e)))
    }

    /// Hard delete. Relation rows are removed outright so the unique
    /// index admits the next toggle.
    pub async fn delete_many(&self, filter: Document) -> Result<u64> {
        let result = self
            .inner
            .delete_many(filter)
            .await
            .map_err(|e| BatchError::Database(format!("Delete from '{}' failed: {}", self.name(), e)))?;
        Ok(result.deleted_count)
    }

    /// Same update applied to every match, bumping `metadata.updated_at`
    pub async fn update_many(&self, filter: Document, mut update: Document) -> Result<u64> {
        touch_updated_at(&mut update);
        let result = self
            .inner
            .update_many(filter, update)
            .await
            .map_err(|e| BatchError::Database(format!("Update on '{}' failed: {}", self.name(), e)))?;
        Ok(result.modified_count)
    }
}

/// Add `metadata.updated_at` to the `$set` stage of an update document
pub(crate) fn touch_updated_at(update: &mut Document) {
    let now = Bson::DateTime(DateTime::now());
    match update.get_mut("$set") {
        Some(Bson::Document(set)) => {
            set.insert("metadata.updated_at", now);
        }
        _ => {
            update.insert("$set", doc! { "metadata.updated_at": now });
        }
    }
}

#[cfg(test)]
mod tests {
    // Round trips need a running MongoDB instance; only pure helpers are
    // covered here.
    use super::*;

    #[test]
    fn test_touch_updated_at_extends_set() {
        let mut update = doc! { "$set": { "read": true } };
        touch_updated_at(&mut update);
        let set = update.get_document("$set").unwrap();
        assert!(set.get_bool("read").unwrap());
        assert!(set.get_datetime("metadata.updated_at").is_ok());
    }

    #[test]
    fn test_touch_updated_at_adds_set() {
        let mut update = doc! { "$inc": { "viewsCount": 1 } };
        touch_updated_at(&mut update);
        assert!(update.get_document("$set").is_ok());
        assert!(update.get_document("$inc").is_ok());
    }

    #[test]
    fn test_update_statement_document() {
        let statement = UpdateStatement::new(doc! { "_id": "p1" }, doc! { "$inc": { "savesCount": 1 } }).upsert();
        let rendered = statement.into_document();
        assert!(rendered.get_bool("upsert").unwrap());
        assert_eq!(rendered.get_document("q").unwrap().get_str("_id").unwrap(), "p1");
    }

    #[test]
    fn test_reply_count_reads_either_width() {
        assert_eq!(reply_count(&doc! { "n": 3_i32 }, "n"), 3);
        assert_eq!(reply_count(&doc! { "n": 4_i64 }, "n"), 4);
        assert_eq!(reply_count(&doc! {}, "n"), 0);
    }
}

//! MongoDB client, collection wrapper and the Mongo-backed [`Database`]

use async_trait::async_trait;
use bson::{doc, DateTime, Document};
use dashmap::DashMap;
use futures::StreamExt;
use mongodb::{
    options::{IndexOptions, UpdateModifications},
    results::UpdateResult,
    Client, Collection, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, info};

use crate::db::schemas::{
    GuildStorageDoc, Metadata, UserDoc, UserGuildData, GUILD_STORAGE_COLLECTION, USER_COLLECTION,
};
use crate::db::Database;
use crate::types::{BotError, Result};

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// Trait for schemas with mutable metadata
pub trait MutMetadata {
    fn mut_metadata(&mut self) -> &mut Metadata;
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Create a new MongoDB client
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Fail fast when the server is unreachable
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| BotError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| BotError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get a typed collection
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
    {
        MongoCollection::new(&self.client, &self.db_name, name).await
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
    /// Create a new collection and apply indexes
    pub async fn new(client: &Client, db_name: &str, collection_name: &str) -> Result<Self> {
        let collection = client.database(db_name).collection::<T>(collection_name);
        let mongo_collection = MongoCollection { inner: collection };

        mongo_collection.apply_indexes().await?;

        Ok(mongo_collection)
    }

    /// Apply schema-defined indexes
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
            .map_err(|e| BotError::Database(format!("Failed to create indexes: {}", e)))?;

        Ok(())
    }

    /// Find one document by filter
    pub async fn find_one(&self, filter: Document) -> Result<Option<T>> {
        self.inner
            .find_one(filter)
            .await
            .map_err(|e| BotError::Database(format!("Find failed: {}", e)))
    }

    /// Find many documents by filter, skipping documents that fail to decode
    pub async fn find_many(&self, filter: Document) -> Result<Vec<T>> {
        let cursor = self
            .inner
            .find(filter)
            .await
            .map_err(|e| BotError::Database(format!("Find failed: {}", e)))?;

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

    /// Count documents matching a filter
    pub async fn count(&self, filter: Document) -> Result<u64> {
        self.inner
            .count_documents(filter)
            .await
            .map_err(|e| BotError::Database(format!("Count failed: {}", e)))
    }

    /// Replace the document matching `filter`, inserting it if absent
    pub async fn upsert_one(&self, filter: Document, mut item: T) -> Result<()> {
        item.mut_metadata().touch();

        self.inner
            .replace_one(filter, item)
            .upsert(true)
            .await
            .map_err(|e| BotError::Database(format!("Upsert failed: {}", e)))?;

        Ok(())
    }

    /// Partial update of one document
    pub async fn update_one(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
        upsert: bool,
    ) -> Result<UpdateResult> {
        self.inner
            .update_one(filter, update.into())
            .upsert(upsert)
            .await
            .map_err(|e| BotError::Database(format!("Update failed: {}", e)))
    }
}

/// [`Database`] backed by the `users` and `guild_storage` collections.
///
/// Guild storage documents are cached per guild. Writes to them only happen
/// from inside that guild's mutation queue, so the cache cannot go stale
/// within one process.
pub struct MongoDatabase {
    users: MongoCollection<UserDoc>,
    guild_storage: MongoCollection<GuildStorageDoc>,
    storage_cache: DashMap<String, GuildStorageDoc>,
}

impl MongoDatabase {
    pub async fn new(mongo: &MongoClient) -> Result<Self> {
        let users = mongo.collection::<UserDoc>(USER_COLLECTION).await?;
        let guild_storage = mongo
            .collection::<GuildStorageDoc>(GUILD_STORAGE_COLLECTION)
            .await?;

        Ok(Self {
            users,
            guild_storage,
            storage_cache: DashMap::new(),
        })
    }
}

fn guild_field(guild_id: &str, rest: &str) -> String {
    if rest.is_empty() {
        format!("guilds.{}", guild_id)
    } else {
        format!("guilds.{}.{}", guild_id, rest)
    }
}

#[async_trait]
impl Database for MongoDatabase {
    async fn find_user(&self, member_id: &str) -> Result<Option<UserDoc>> {
        self.users.find_one(doc! { "member_id": member_id }).await
    }

    async fn create_user(&self, member_id: &str) -> Result<()> {
        let now = DateTime::now();
        let result = self
            .users
            .update_one(
                doc! { "member_id": member_id },
                doc! {
                    "$setOnInsert": {
                        "banned": false,
                        "metadata.created_at": now,
                        "metadata.updated_at": now,
                    }
                },
                true,
            )
            .await?;
        if result.upserted_id.is_some() {
            debug!(member_id = %member_id, "Created user");
        }
        Ok(())
    }

    async fn save_user(&self, user: &UserDoc) -> Result<()> {
        let now = DateTime::now();
        self.users
            .update_one(
                doc! { "member_id": &user.member_id },
                doc! {
                    "$set": {
                        "student_id": bson::to_bson(&user.student_id)?,
                        "verification_status": bson::to_bson(&user.verification_status)?,
                        "verification_code": bson::to_bson(&user.verification_code)?,
                        "metadata.updated_at": now,
                    },
                    "$setOnInsert": {
                        "banned": false,
                        "metadata.created_at": now,
                    }
                },
                true,
            )
            .await?;
        Ok(())
    }

    async fn save_user_guild(
        &self,
        member_id: &str,
        guild_id: &str,
        data: &UserGuildData,
    ) -> Result<()> {
        let now = DateTime::now();
        let mut set = Document::new();
        set.insert(guild_field(guild_id, ""), bson::to_bson(data)?);
        set.insert("metadata.updated_at", now);

        self.users
            .update_one(
                doc! { "member_id": member_id },
                doc! {
                    "$set": set,
                    "$setOnInsert": {
                        "banned": false,
                        "metadata.created_at": now,
                    }
                },
                true,
            )
            .await?;
        Ok(())
    }

    async fn set_banned(&self, member_id: &str, banned: bool) -> Result<()> {
        self.users
            .update_one(
                doc! { "member_id": member_id },
                doc! {
                    "$set": {
                        "banned": banned,
                        "metadata.updated_at": DateTime::now(),
                    },
                    "$setOnInsert": {
                        "metadata.created_at": DateTime::now(),
                    }
                },
                true,
            )
            .await?;
        Ok(())
    }

    async fn clear_guild(&self, member_id: &str, guild_id: &str) -> Result<()> {
        let mut unset = Document::new();
        unset.insert(guild_field(guild_id, ""), "");

        let result = self
            .users
            .update_one(
                doc! { "member_id": member_id },
                doc! {
                    "$unset": unset,
                    "$set": { "metadata.updated_at": DateTime::now() },
                },
                false,
            )
            .await?;
        debug!(
            member_id = %member_id,
            guild_id = %guild_id,
            modified = result.modified_count,
            "Cleared guild data"
        );
        Ok(())
    }

    async fn users_in_guild(&self, guild_id: &str) -> Result<Vec<UserDoc>> {
        let mut filter = Document::new();
        filter.insert(guild_field(guild_id, ""), doc! { "$exists": true });
        self.users.find_many(filter).await
    }

    async fn count_course_users(&self, guild_id: &str, course_key: &str) -> Result<u64> {
        let mut filter = Document::new();
        filter.insert(guild_field(guild_id, "courses.course_key"), course_key);
        self.users.count(filter).await
    }

    async fn find_user_by_code(&self, code: &str) -> Result<Option<UserDoc>> {
        self.users.find_one(doc! { "verification_code": code }).await
    }

    async fn find_users_by_student_id(&self, student_id: &str) -> Result<Vec<UserDoc>> {
        self.users.find_many(doc! { "student_id": student_id }).await
    }

    async fn guild_storage(&self, guild_id: &str) -> Result<GuildStorageDoc> {
        if let Some(cached) = self.storage_cache.get(guild_id) {
            return Ok(cached.value().clone());
        }

        let storage = match self
            .guild_storage
            .find_one(doc! { "guild_id": guild_id })
            .await?
        {
            Some(existing) => existing,
            None => {
                info!(guild_id = %guild_id, "Creating guild storage");
                let created = GuildStorageDoc::new(guild_id);
                self.guild_storage
                    .upsert_one(doc! { "guild_id": guild_id }, created.clone())
                    .await?;
                created
            }
        };

        self.storage_cache
            .insert(guild_id.to_string(), storage.clone());
        Ok(storage)
    }

    async fn save_guild_storage(&self, storage: &GuildStorageDoc) -> Result<()> {
        self.guild_storage
            .upsert_one(doc! { "guild_id": &storage.guild_id }, storage.clone())
            .await?;
        self.storage_cache
            .insert(storage.guild_id.clone(), storage.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Collection behaviour needs a running MongoDB instance; only the
    // pure helpers are covered here.

    #[test]
    fn test_guild_field_paths() {
        assert_eq!(guild_field("123", ""), "guilds.123");
        assert_eq!(
            guild_field("123", "courses.course_key"),
            "guilds.123.courses.course_key"
        );
    }
}

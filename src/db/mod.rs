//! Document store
//!
//! The bot persists two kinds of documents: one [`UserDoc`] per member and
//! one [`GuildStorageDoc`] per guild. [`Database`] is the seam between the
//! core and the store; [`MongoDatabase`] is used in production and
//! [`InMemoryDatabase`] in tests.

pub mod memory;
pub mod mongo;
pub mod schemas;

use async_trait::async_trait;

pub use memory::InMemoryDatabase;
pub use mongo::{MongoClient, MongoCollection, MongoDatabase};
pub use schemas::{
    CourseAssignment, CourseImplement, GuildStorageDoc, MajorImplement, UserDoc, UserGuildData,
    VerificationImplement,
};

use crate::types::Result;

/// Key-value document store used by the bot
#[async_trait]
pub trait Database: Send + Sync {
    async fn find_user(&self, member_id: &str) -> Result<Option<UserDoc>>;

    /// Insert an empty user unless one with this member ID exists
    async fn create_user(&self, member_id: &str) -> Result<()>;

    /// Upsert the global profile of a user: student ID and verification
    /// state. Guild sub-records and the ban flag are never written here, so
    /// a stale copy cannot undo changes made by other guild queues.
    async fn save_user(&self, user: &UserDoc) -> Result<()>;

    /// Partial update of one guild sub-record, creating the user if needed
    async fn save_user_guild(
        &self,
        member_id: &str,
        guild_id: &str,
        data: &UserGuildData,
    ) -> Result<()>;

    /// Partial update of the ban flag, creating the user if needed
    async fn set_banned(&self, member_id: &str, banned: bool) -> Result<()>;

    /// Partial update removing a user's data for one guild
    async fn clear_guild(&self, member_id: &str, guild_id: &str) -> Result<()>;

    /// Users that have a sub-record for the guild
    async fn users_in_guild(&self, guild_id: &str) -> Result<Vec<UserDoc>>;

    /// Number of users assigned to a course in a guild
    async fn count_course_users(&self, guild_id: &str, course_key: &str) -> Result<u64>;

    async fn find_user_by_code(&self, code: &str) -> Result<Option<UserDoc>>;

    async fn find_users_by_student_id(&self, student_id: &str) -> Result<Vec<UserDoc>>;

    /// Load the guild's storage document, creating it on first access
    async fn guild_storage(&self, guild_id: &str) -> Result<GuildStorageDoc>;

    async fn save_guild_storage(&self, storage: &GuildStorageDoc) -> Result<()>;

    /// Find a user, creating it if needed. When `guild_id` is given the
    /// user's sub-record for that guild is initialised too.
    async fn find_or_create_user(&self, member_id: &str, guild_id: Option<&str>) -> Result<UserDoc> {
        let mut user = match self.find_user(member_id).await? {
            Some(user) => user,
            None => {
                self.create_user(member_id).await?;
                self.find_user(member_id)
                    .await?
                    .unwrap_or_else(|| UserDoc::new(member_id))
            }
        };

        if let Some(guild_id) = guild_id {
            if user.guild(guild_id).is_none() {
                let data = user.guild_mut(guild_id).clone();
                self.save_user_guild(member_id, guild_id, &data).await?;
            }
        }
        Ok(user)
    }

    /// Persist the user's sub-record for one guild
    async fn save_guild_data(&self, user: &UserDoc, guild_id: &str) -> Result<()> {
        let data = user.guild(guild_id).cloned().unwrap_or_default();
        self.save_user_guild(&user.member_id, guild_id, &data).await
    }
}

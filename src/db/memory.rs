//! In-memory document store (tests and dry runs)

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::db::schemas::{GuildStorageDoc, UserDoc, UserGuildData};
use crate::db::Database;
use crate::types::Result;

/// Simple in-memory store keyed the same way as the Mongo collections
#[derive(Default)]
pub struct InMemoryDatabase {
    users: RwLock<HashMap<String, UserDoc>>,
    storage: RwLock<HashMap<String, GuildStorageDoc>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a whole user document as is, replacing any existing one
    pub async fn insert_user(&self, user: UserDoc) {
        self.users.write().await.insert(user.member_id.clone(), user);
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn find_user(&self, member_id: &str) -> Result<Option<UserDoc>> {
        Ok(self.users.read().await.get(member_id).cloned())
    }

    async fn create_user(&self, member_id: &str) -> Result<()> {
        self.users
            .write()
            .await
            .entry(member_id.to_string())
            .or_insert_with(|| {
                let mut user = UserDoc::new(member_id);
                user.metadata.touch();
                user
            });
        Ok(())
    }

    async fn save_user(&self, user: &UserDoc) -> Result<()> {
        let mut users = self.users.write().await;
        let stored = users
            .entry(user.member_id.clone())
            .or_insert_with(|| UserDoc::new(user.member_id.as_str()));
        stored.student_id = user.student_id.clone();
        stored.verification_status = user.verification_status;
        stored.verification_code = user.verification_code.clone();
        stored.metadata.touch();
        Ok(())
    }

    async fn save_user_guild(
        &self,
        member_id: &str,
        guild_id: &str,
        data: &UserGuildData,
    ) -> Result<()> {
        let mut users = self.users.write().await;
        let stored = users
            .entry(member_id.to_string())
            .or_insert_with(|| UserDoc::new(member_id));
        stored.guilds.insert(guild_id.to_string(), data.clone());
        stored.metadata.touch();
        Ok(())
    }

    async fn set_banned(&self, member_id: &str, banned: bool) -> Result<()> {
        let mut users = self.users.write().await;
        let user = users
            .entry(member_id.to_string())
            .or_insert_with(|| UserDoc::new(member_id));
        user.banned = banned;
        user.metadata.touch();
        Ok(())
    }

    async fn clear_guild(&self, member_id: &str, guild_id: &str) -> Result<()> {
        if let Some(user) = self.users.write().await.get_mut(member_id) {
            user.guilds.remove(guild_id);
            user.metadata.touch();
        }
        Ok(())
    }

    async fn users_in_guild(&self, guild_id: &str) -> Result<Vec<UserDoc>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .filter(|u| u.guilds.contains_key(guild_id))
            .cloned()
            .collect())
    }

    async fn count_course_users(&self, guild_id: &str, course_key: &str) -> Result<u64> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .filter(|u| u.assignment(guild_id, course_key).is_some())
            .count() as u64)
    }

    async fn find_user_by_code(&self, code: &str) -> Result<Option<UserDoc>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.verification_code.as_deref() == Some(code))
            .cloned())
    }

    async fn find_users_by_student_id(&self, student_id: &str) -> Result<Vec<UserDoc>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .filter(|u| u.student_id.as_deref() == Some(student_id))
            .cloned()
            .collect())
    }

    async fn guild_storage(&self, guild_id: &str) -> Result<GuildStorageDoc> {
        let mut storage = self.storage.write().await;
        Ok(storage
            .entry(guild_id.to_string())
            .or_insert_with(|| GuildStorageDoc::new(guild_id))
            .clone())
    }

    async fn save_guild_storage(&self, storage: &GuildStorageDoc) -> Result<()> {
        let mut doc = storage.clone();
        doc.metadata.touch();
        self.storage
            .write()
            .await
            .insert(doc.guild_id.clone(), doc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_or_create_initialises_guild_once() {
        let db = InMemoryDatabase::new();

        let user = db.find_or_create_user("m1", None).await.unwrap();
        assert!(user.guilds.is_empty());

        let user = db.find_or_create_user("m1", Some("g1")).await.unwrap();
        assert!(user.guild("g1").is_some());
        assert_eq!(db.users_in_guild("g1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_course_counts_and_clear_guild() {
        let db = InMemoryDatabase::new();
        let mut user = db.find_or_create_user("m1", Some("g1")).await.unwrap();
        user.add_courses("g1", &["cs-1000".to_string()]);
        db.save_guild_data(&user, "g1").await.unwrap();

        assert_eq!(db.count_course_users("g1", "cs-1000").await.unwrap(), 1);
        assert_eq!(db.count_course_users("g2", "cs-1000").await.unwrap(), 0);

        db.clear_guild("m1", "g1").await.unwrap();
        assert_eq!(db.count_course_users("g1", "cs-1000").await.unwrap(), 0);
        assert!(db.users_in_guild("g1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_copies_keep_other_guilds_and_ban() {
        let db = InMemoryDatabase::new();
        let mut in_g1 = db.find_or_create_user("m1", Some("g1")).await.unwrap();
        let mut in_g2 = db.find_or_create_user("m1", Some("g2")).await.unwrap();

        in_g1.add_courses("g1", &["cs-1000".to_string()]);
        db.save_guild_data(&in_g1, "g1").await.unwrap();
        db.set_banned("m1", true).await.unwrap();

        // Copy loaded before both writes
        in_g2.add_courses("g2", &["cs-2000".to_string()]);
        in_g2.student_id = Some("u1".into());
        db.save_guild_data(&in_g2, "g2").await.unwrap();
        db.save_user(&in_g2).await.unwrap();

        let stored = db.find_user("m1").await.unwrap().unwrap();
        assert!(stored.banned);
        assert!(stored.assignment("g1", "cs-1000").is_some());
        assert!(stored.assignment("g2", "cs-2000").is_some());
        assert_eq!(stored.student_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_create_user_keeps_existing() {
        let db = InMemoryDatabase::new();
        db.set_banned("m1", true).await.unwrap();
        db.create_user("m1").await.unwrap();
        assert!(db.find_user("m1").await.unwrap().unwrap().banned);
    }

    #[tokio::test]
    async fn test_set_banned_creates_user() {
        let db = InMemoryDatabase::new();
        db.set_banned("m9", true).await.unwrap();
        assert!(db.find_user("m9").await.unwrap().unwrap().banned);
    }
}

//! Resource Implement Store
//!
//! Maps logical entities (verification gate, majors, courses) to the
//! platform resources realising them and keeps that mapping in the guild's
//! storage document.
//!
//! Every mutating method must run inside the guild's mutation queue (see
//! [`crate::worker::GuildQueues`]); the store itself does no locking.
//!
//! ## Layout
//!
//! - `allocator`: picks or creates a container with spare capacity
//! - `rebalance`: sorts channels across containers and scales in
//! - `course`: course implements (two roles, one channel per kind)
//! - `verification`: the guild's verification role

pub mod allocator;
pub mod course;
pub mod rebalance;
pub mod verification;

use tracing::debug;

pub use allocator::category_for;
pub use rebalance::SortReport;

use crate::db::{CourseImplement, MajorImplement, VerificationImplement};
use crate::guild::GuildContext;
use crate::models::{Course, Major, SWAP_MARGIN};
use crate::types::Result;

/// Container capacity as seen by the allocator and rebalancer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityLimits {
    /// Hard platform limit of children per container
    pub max_children: usize,
    /// Slots kept free in every container for swaps
    pub swap_margin: usize,
}

impl CapacityLimits {
    pub fn new(max_children: usize) -> Self {
        Self {
            max_children,
            swap_margin: SWAP_MARGIN,
        }
    }

    /// Children a container may hold outside of a swap
    pub fn usable(&self) -> usize {
        self.max_children.saturating_sub(self.swap_margin).max(1)
    }
}

/// Logical entity an implement can be looked up or repaired by
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImplementKey {
    Verification,
    Major(Major),
    Course(Course),
}

/// Stored implement of any entity kind
#[derive(Debug, Clone, PartialEq)]
pub enum Implement {
    Verification(VerificationImplement),
    Major(MajorImplement),
    Course(CourseImplement),
}

/// Facade over the implement operations of one guild
pub struct ImplementStore<'a> {
    ctx: &'a GuildContext,
}

impl<'a> ImplementStore<'a> {
    pub fn new(ctx: &'a GuildContext) -> Self {
        Self { ctx }
    }

    pub async fn get(&self, key: &ImplementKey) -> Result<Option<Implement>> {
        let storage = self.ctx.db.guild_storage(self.ctx.guild_id()).await?;
        Ok(match key {
            ImplementKey::Verification => storage
                .verification_implement
                .map(Implement::Verification),
            ImplementKey::Major(major) => storage
                .major_implements
                .get(&major.prefix)
                .cloned()
                .map(Implement::Major),
            ImplementKey::Course(course) => storage
                .course_implement(&course.key())
                .cloned()
                .map(Implement::Course),
        })
    }

    pub async fn course(&self, course: &Course) -> Result<Option<CourseImplement>> {
        let storage = self.ctx.db.guild_storage(self.ctx.guild_id()).await?;
        Ok(storage.course_implement(&course.key()).cloned())
    }

    pub async fn get_or_create_course(&self, course: &Course) -> Result<CourseImplement> {
        let mut storage = self.ctx.db.guild_storage(self.ctx.guild_id()).await?;
        if let Some(existing) = storage.course_implement(&course.key()) {
            return Ok(existing.clone());
        }
        course::create(self.ctx, &mut storage, course).await
    }

    pub async fn delete_course(&self, course_key: &str) -> Result<bool> {
        let mut storage = self.ctx.db.guild_storage(self.ctx.guild_id()).await?;
        course::delete(self.ctx, &mut storage, course_key).await
    }

    /// Delete a course implement when nobody in the guild is assigned to it
    pub async fn delete_course_if_empty(&self, course_key: &str) -> Result<bool> {
        let mut storage = self.ctx.db.guild_storage(self.ctx.guild_id()).await?;
        if storage.course_implement(course_key).is_none() {
            return Ok(false);
        }
        let assigned = self
            .ctx
            .db
            .count_course_users(self.ctx.guild_id(), course_key)
            .await?;
        if assigned > 0 {
            debug!(course = %course_key, assigned, "Course still in use");
            return Ok(false);
        }
        course::delete(self.ctx, &mut storage, course_key).await
    }

    /// Delete every course implement nobody is assigned to any more
    pub async fn delete_empty_courses(&self) -> Result<Vec<String>> {
        let storage = self.ctx.db.guild_storage(self.ctx.guild_id()).await?;
        let keys: Vec<String> = storage
            .major_implements
            .values()
            .flat_map(|m| m.course_implements.keys().cloned())
            .collect();

        let mut deleted = Vec::new();
        for key in keys {
            if self.delete_course_if_empty(&key).await? {
                deleted.push(key);
            }
        }
        Ok(deleted)
    }

    pub async fn verification(&self) -> Result<Option<VerificationImplement>> {
        let storage = self.ctx.db.guild_storage(self.ctx.guild_id()).await?;
        Ok(storage.verification_implement)
    }

    pub async fn get_or_create_verification(&self) -> Result<VerificationImplement> {
        let mut storage = self.ctx.db.guild_storage(self.ctx.guild_id()).await?;
        verification::get_or_create(self.ctx, &mut storage).await
    }

    /// Repair whatever no longer resolves for the entity. Returns the number
    /// of resources that were recreated or dropped.
    pub async fn guarantee(&self, key: &ImplementKey) -> Result<usize> {
        let mut storage = self.ctx.db.guild_storage(self.ctx.guild_id()).await?;
        match key {
            ImplementKey::Verification => verification::guarantee(self.ctx, &mut storage).await,
            ImplementKey::Major(major) => {
                rebalance::guarantee_major(self.ctx, &mut storage, major).await
            }
            ImplementKey::Course(course) => {
                course::guarantee(self.ctx, &mut storage, course).await
            }
        }
    }

    /// Place, order and scale in the channels of a major
    pub async fn sort(&self, major: &Major) -> Result<SortReport> {
        let mut storage = self.ctx.db.guild_storage(self.ctx.guild_id()).await?;
        rebalance::sort(self.ctx, &mut storage, major).await
    }

    /// Every stored course implement paired with its course
    pub async fn stored_courses(&self) -> Result<Vec<Course>> {
        let storage = self.ctx.db.guild_storage(self.ctx.guild_id()).await?;
        Ok(storage
            .major_implements
            .iter()
            .filter_map(|(prefix, major)| {
                self.ctx.config.major(prefix).map(|m| (m.clone(), major))
            })
            .flat_map(|(major, implement)| {
                implement
                    .course_implements
                    .keys()
                    .filter_map(|key| Course::parse_key(key))
                    .map(move |(_, number)| Course::new(major.clone(), number))
                    .collect::<Vec<_>>()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guild::testing::*;
    use crate::models::ChannelKind;
    use crate::platform::Platform;

    #[test]
    fn test_usable_capacity() {
        assert_eq!(CapacityLimits::new(50).usable(), 48);
        assert_eq!(CapacityLimits::new(4).usable(), 2);
        assert_eq!(CapacityLimits::new(1).usable(), 1);
    }

    #[tokio::test]
    async fn test_get_and_delete_course() {
        let f = fixture(50);
        let store = f.ctx.implements();
        let cs = course("cs-1000");
        let key = ImplementKey::Course(cs.clone());

        assert_eq!(store.get(&key).await.unwrap(), None);
        let created = store.get_or_create_course(&cs).await.unwrap();
        assert_eq!(
            store.get(&key).await.unwrap(),
            Some(Implement::Course(created.clone()))
        );
        match store.get(&ImplementKey::Major(cs.major.clone())).await.unwrap() {
            Some(Implement::Major(major)) => {
                assert!(major.course_implements.contains_key("cs-1000"));
                assert_eq!(major.categories(ChannelKind::Chat).len(), 1);
            }
            other => panic!("unexpected major implement: {:?}", other),
        }
        assert_eq!(store.get(&ImplementKey::Verification).await.unwrap(), None);

        assert!(store.delete_course("cs-1000").await.unwrap());
        assert!(!store.delete_course("cs-1000").await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), None);
        assert!(f.platform.role(GUILD, &created.main_role_id).await.unwrap().is_none());
        assert!(f.platform.channels_named(GUILD, "cs-1000").await.is_empty());
    }
}

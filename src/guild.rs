//! Per-guild configuration and the context every guild task runs with

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{Database, UserDoc};
use crate::implement::{CapacityLimits, ImplementStore};
use crate::models::{Course, Major};
use crate::platform::Platform;
use crate::services::catalog::CourseCatalog;
use crate::types::{GuildId, Result, RoleId};

/// Static configuration of one guild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildConfig {
    pub guild_id: GuildId,
    pub majors: Vec<Major>,
    /// Role that may see every course channel
    pub moderator_role_id: Option<RoleId>,
    pub verification_enabled: bool,
}

impl GuildConfig {
    pub fn new(guild_id: impl Into<GuildId>, majors: Vec<Major>) -> Self {
        Self {
            guild_id: guild_id.into(),
            majors,
            moderator_role_id: None,
            verification_enabled: true,
        }
    }

    pub fn major(&self, prefix: &str) -> Option<&Major> {
        let prefix = prefix.to_lowercase();
        self.majors.iter().find(|m| m.prefix == prefix)
    }
}

/// Everything a queued guild task needs: configuration plus shared handles
#[derive(Clone)]
pub struct GuildContext {
    pub config: Arc<GuildConfig>,
    pub platform: Arc<dyn Platform>,
    pub db: Arc<dyn Database>,
    pub catalog: Arc<dyn CourseCatalog>,
    pub limits: CapacityLimits,
    /// Pause between the add and remove calls of one role diff
    pub step_delay: Duration,
}

impl GuildContext {
    pub fn guild_id(&self) -> &str {
        &self.config.guild_id
    }

    pub fn implements(&self) -> ImplementStore<'_> {
        ImplementStore::new(self)
    }

    /// Resolve a course key against the configured majors and the catalog.
    ///
    /// Returns `None` for unknown majors, and for numbers missing from a
    /// non-empty catalog list.
    pub async fn resolve_course(&self, course_key: &str) -> Result<Option<Course>> {
        let Some((prefix, number)) = Course::parse_key(course_key) else {
            return Ok(None);
        };
        let Some(major) = self.config.major(&prefix) else {
            return Ok(None);
        };

        let offered = self.catalog.courses(major).await?;
        if offered.is_empty() {
            return Ok(Some(Course::new(major.clone(), number)));
        }
        let key = Course::new(major.clone(), number).key();
        Ok(offered.into_iter().find(|c| c.key() == key))
    }

    /// Resolve several keys, dropping the unknown ones
    pub async fn resolve_courses(&self, course_keys: &[String]) -> Result<Vec<Course>> {
        let mut courses = Vec::new();
        for key in course_keys {
            if let Some(course) = self.resolve_course(key).await? {
                if !courses.contains(&course) {
                    courses.push(course);
                }
            }
        }
        Ok(courses)
    }

    /// Courses the role diff has to look at for a user: the catalog, the
    /// user's assignments and every course that already has an implement,
    /// restricted to configured majors.
    pub async fn known_courses(&self, user: Option<&UserDoc>) -> Result<Vec<Course>> {
        let mut known: BTreeMap<String, Course> = BTreeMap::new();

        for major in &self.config.majors {
            for course in self.catalog.courses(major).await? {
                known.insert(course.key(), course);
            }
        }

        let storage = self.db.guild_storage(self.guild_id()).await?;
        let stored_keys = storage
            .major_implements
            .values()
            .flat_map(|m| m.course_implements.keys().cloned());
        let assigned_keys = user
            .and_then(|u| u.guild(self.guild_id()))
            .map(|g| g.courses.iter().map(|c| c.course_key.clone()).collect::<Vec<_>>())
            .unwrap_or_default();

        for key in stored_keys.chain(assigned_keys) {
            if known.contains_key(&key) {
                continue;
            }
            let Some((prefix, number)) = Course::parse_key(&key) else {
                continue;
            };
            if let Some(major) = self.config.major(&prefix) {
                let course = Course::new(major.clone(), number);
                known.insert(course.key(), course);
            }
        }

        Ok(known.into_values().collect())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for guild-level tests

    use super::*;
    use crate::db::InMemoryDatabase;
    use crate::platform::InMemoryPlatform;
    use crate::services::catalog::EmptyCatalog;

    pub const GUILD: &str = "g1";

    pub struct Fixture {
        pub ctx: GuildContext,
        pub platform: Arc<InMemoryPlatform>,
        pub db: Arc<InMemoryDatabase>,
    }

    /// Guild with majors `cs` and `math`, containers of `max_children`
    pub fn fixture(max_children: usize) -> Fixture {
        fixture_with(max_children, Arc::new(EmptyCatalog))
    }

    pub fn fixture_with(max_children: usize, catalog: Arc<dyn CourseCatalog>) -> Fixture {
        let platform = Arc::new(InMemoryPlatform::new(max_children).with_bot_user("bot"));
        let db = Arc::new(InMemoryDatabase::new());
        let mut config = GuildConfig::new(GUILD, vec![Major::new("cs"), Major::new("math")]);
        config.moderator_role_id = Some("mods".to_string());

        let ctx = GuildContext {
            config: Arc::new(config),
            platform: platform.clone(),
            db: db.clone(),
            catalog,
            limits: CapacityLimits::new(max_children),
            step_delay: Duration::ZERO,
        };
        Fixture { ctx, platform, db }
    }

    pub fn course(key: &str) -> Course {
        let (prefix, number) = Course::parse_key(key).unwrap_or_default();
        Course::new(Major::new(prefix), number)
    }
}

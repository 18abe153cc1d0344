//! User document schema
//!
//! One document per platform member ID. Verification and ban state are
//! global; course assignments are kept per guild.

use bson::{doc, oid::ObjectId, Document};
use chrono::{DateTime, Utc};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::models::VerificationStatus;

/// Collection name for users
pub const USER_COLLECTION: &str = "users";

/// User document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UserDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Platform member ID
    pub member_id: String,

    /// Institution student ID, set once a code was requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,

    #[serde(default)]
    pub verification_status: VerificationStatus,

    /// One-time code, cleared when verification succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_code: Option<String>,

    /// Global ban flag, applies to every guild
    #[serde(default)]
    pub banned: bool,

    /// Guild ID -> per-guild data
    #[serde(default)]
    pub guilds: BTreeMap<String, UserGuildData>,
}

/// Per-guild part of a user
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UserGuildData {
    #[serde(default)]
    pub courses: Vec<CourseAssignment>,

    /// Used by the assignment reset policies
    pub courses_last_updated: DateTime<Utc>,
}

impl Default for UserGuildData {
    fn default() -> Self {
        Self {
            courses: Vec::new(),
            courses_last_updated: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CourseAssignment {
    pub course_key: String,
    #[serde(default)]
    pub is_ta: bool,
}

impl UserDoc {
    /// Create a new user document
    pub fn new(member_id: impl Into<String>) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            member_id: member_id.into(),
            ..Default::default()
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verification_status == VerificationStatus::Verified
    }

    pub fn guild(&self, guild_id: &str) -> Option<&UserGuildData> {
        self.guilds.get(guild_id)
    }

    /// Guild data, initialised if the user has none for this guild yet
    pub fn guild_mut(&mut self, guild_id: &str) -> &mut UserGuildData {
        self.guilds.entry(guild_id.to_string()).or_default()
    }

    pub fn assignment(&self, guild_id: &str, course_key: &str) -> Option<&CourseAssignment> {
        self.guild(guild_id)
            .and_then(|g| g.courses.iter().find(|c| c.course_key == course_key))
    }

    pub fn has_courses(&self, guild_id: &str) -> bool {
        self.guild(guild_id).map(|g| !g.courses.is_empty()).unwrap_or(false)
    }

    /// Add course assignments (as non-TA), keeping the list sorted and unique
    pub fn add_courses(&mut self, guild_id: &str, course_keys: &[String]) {
        let data = self.guild_mut(guild_id);
        for key in course_keys {
            if !data.courses.iter().any(|c| &c.course_key == key) {
                data.courses.push(CourseAssignment {
                    course_key: key.clone(),
                    is_ta: false,
                });
            }
        }
        data.courses.sort_by(|a, b| a.course_key.cmp(&b.course_key));
        data.courses_last_updated = Utc::now();
    }

    pub fn remove_courses(&mut self, guild_id: &str, course_keys: &[String]) {
        let data = self.guild_mut(guild_id);
        data.courses.retain(|c| !course_keys.contains(&c.course_key));
        data.courses_last_updated = Utc::now();
    }

    pub fn remove_all_courses(&mut self, guild_id: &str) {
        let data = self.guild_mut(guild_id);
        data.courses.clear();
        data.courses_last_updated = Utc::now();
    }

    /// Flip the TA flag of the given courses the user is already assigned to
    pub fn toggle_ta(&mut self, guild_id: &str, course_keys: &[String]) {
        let data = self.guild_mut(guild_id);
        for assignment in data
            .courses
            .iter_mut()
            .filter(|c| course_keys.contains(&c.course_key))
        {
            assignment.is_ta = !assignment.is_ta;
        }
        data.courses_last_updated = Utc::now();
    }
}

impl IntoIndexes for UserDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "member_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("member_id_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "verification_code": 1 },
                Some(
                    IndexOptions::builder()
                        .sparse(true)
                        .name("verification_code_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "student_id": 1 },
                Some(
                    IndexOptions::builder()
                        .sparse(true)
                        .name("student_id_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for UserDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_add_courses_is_sorted_union() {
        let mut user = UserDoc::new("42");
        user.add_courses("g", &keys(&["cs-2000", "cs-1000"]));
        user.add_courses("g", &keys(&["cs-1000", "math-1000"]));

        let courses: Vec<_> = user.guild("g").unwrap().courses.iter().map(|c| c.course_key.as_str()).collect();
        assert_eq!(courses, vec!["cs-1000", "cs-2000", "math-1000"]);
    }

    #[test]
    fn test_toggle_ta_only_touches_assigned() {
        let mut user = UserDoc::new("42");
        user.add_courses("g", &keys(&["cs-1000"]));
        user.toggle_ta("g", &keys(&["cs-1000", "cs-9999"]));

        assert!(user.assignment("g", "cs-1000").unwrap().is_ta);
        assert!(user.assignment("g", "cs-9999").is_none());

        user.toggle_ta("g", &keys(&["cs-1000"]));
        assert!(!user.assignment("g", "cs-1000").unwrap().is_ta);
    }

    #[test]
    fn test_remove_courses() {
        let mut user = UserDoc::new("42");
        user.add_courses("g", &keys(&["cs-1000", "cs-2000"]));
        user.remove_courses("g", &keys(&["cs-1000"]));
        assert!(user.assignment("g", "cs-1000").is_none());
        assert!(user.has_courses("g"));

        user.remove_all_courses("g");
        assert!(!user.has_courses("g"));
        assert!(user.guild("g").is_some());
    }
}

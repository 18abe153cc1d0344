//! Guild storage document schema
//!
//! Holds the implements of a guild: which platform roles, channels and
//! containers realise its majors, courses and verification gate.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::models::ChannelKind;
use crate::types::{ChannelId, RoleId};

/// Collection name for guild storage
pub const GUILD_STORAGE_COLLECTION: &str = "guild_storage";

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct GuildStorageDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub guild_id: String,

    /// Major prefix -> implement
    #[serde(default)]
    pub major_implements: BTreeMap<String, MajorImplement>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_implement: Option<VerificationImplement>,
}

impl GuildStorageDoc {
    pub fn new(guild_id: impl Into<String>) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            guild_id: guild_id.into(),
            ..Default::default()
        }
    }

    /// Find a course implement by key in any major
    pub fn course_implement(&self, course_key: &str) -> Option<&CourseImplement> {
        self.major_implements
            .values()
            .find_map(|m| m.course_implements.get(course_key))
    }
}

/// Platform realisation of a major
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MajorImplement {
    /// Ordered container IDs per channel kind
    #[serde(default)]
    pub category_ids: BTreeMap<ChannelKind, Vec<ChannelId>>,

    /// Course key -> implement
    #[serde(default)]
    pub course_implements: BTreeMap<String, CourseImplement>,
}

impl MajorImplement {
    pub fn categories(&self, kind: ChannelKind) -> &[ChannelId] {
        self.category_ids.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Platform realisation of a course
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CourseImplement {
    pub main_role_id: RoleId,
    pub ta_role_id: RoleId,
    #[serde(default)]
    pub channel_ids: BTreeMap<ChannelKind, ChannelId>,
}

impl CourseImplement {
    pub fn channel(&self, kind: ChannelKind) -> Option<&ChannelId> {
        self.channel_ids.get(&kind)
    }

    pub fn role_ids(&self) -> [&RoleId; 2] {
        [&self.main_role_id, &self.ta_role_id]
    }
}

/// Platform realisation of the verification gate
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct VerificationImplement {
    pub role_id: RoleId,
}

impl IntoIndexes for GuildStorageDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "guild_id": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("guild_id_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for GuildStorageDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrips_through_bson() {
        let mut storage = GuildStorageDoc::new("g1");
        let mut major = MajorImplement::default();
        major
            .category_ids
            .insert(ChannelKind::Chat, vec!["c1".to_string(), "c2".to_string()]);
        major.course_implements.insert(
            "cs-1000".to_string(),
            CourseImplement {
                main_role_id: "r1".to_string(),
                ta_role_id: "r2".to_string(),
                channel_ids: BTreeMap::from([(ChannelKind::Voice, "v1".to_string())]),
            },
        );
        storage.major_implements.insert("cs".to_string(), major.clone());

        let document = bson::to_document(&storage).unwrap();
        let decoded: GuildStorageDoc = bson::from_document(document).unwrap();

        assert_eq!(decoded.major_implements.get("cs"), Some(&major));
        assert_eq!(
            decoded.course_implement("cs-1000").unwrap().channel(ChannelKind::Voice),
            Some(&"v1".to_string())
        );
    }
}

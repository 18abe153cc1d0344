//! Logical entities managed by the bot
//!
//! Majors and courses exist independently of the platform resources that
//! realise them. Naming of those resources lives here so every component
//! agrees on it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical grouping of courses, identified by its lowercase prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Major {
    pub prefix: String,
}

impl Major {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim().to_lowercase(),
        }
    }

    /// Container name for one channel kind of this major
    pub fn container_name(&self, kind: ChannelKind) -> String {
        format!("{}-{}", self.prefix, kind.as_str())
    }
}

/// A course of a major. Exists even when nothing was created for it yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub major: Major,
    /// Kept as text to preserve leading zeros and letter suffixes
    pub number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Course {
    pub fn new(major: Major, number: impl Into<String>) -> Self {
        Self {
            major,
            number: number.into().trim().to_lowercase(),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Composite key `{prefix}-{number}`
    pub fn key(&self) -> String {
        format!("{}-{}", self.major.prefix, self.number)
    }

    /// Split a course key back into prefix and number
    pub fn parse_key(key: &str) -> Option<(String, String)> {
        let (prefix, number) = key.split_once('-')?;
        if prefix.is_empty() || number.is_empty() {
            return None;
        }
        Some((prefix.to_lowercase(), number.to_lowercase()))
    }

    pub fn main_role_name(&self) -> String {
        self.key()
    }

    pub fn ta_role_name(&self) -> String {
        format!("{}-ta", self.key())
    }

    pub fn channel_name(&self, _kind: ChannelKind) -> String {
        self.key()
    }

    /// Chat channel topic, if the course has a title
    pub fn topic(&self) -> Option<String> {
        self.title.as_ref().map(|t| format!(":information_source: {}", t))
    }
}

impl PartialEq for Course {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Course {}

impl fmt::Display for Course {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Channel kinds every course gets one channel of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    Chat,
    Voice,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 2] = [ChannelKind::Chat, ChannelKind::Voice];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Chat => "chat",
            ChannelKind::Voice => "voice",
        }
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(ChannelKind::Chat),
            "voice" => Ok(ChannelKind::Voice),
            other => Err(format!("unknown channel kind '{}'", other)),
        }
    }
}

// Serialized as plain strings so the kind can key BSON documents.
impl Serialize for ChannelKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChannelKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Number of channels a course implement places into containers.
///
/// Reserved in every container so the rebalancer can swap without
/// exceeding the platform's hard limit.
pub const SWAP_MARGIN: usize = ChannelKind::ALL.len();

/// Name of the role granted to verified members
pub const VERIFICATION_ROLE_NAME: &str = "verified";

/// Global verification state of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    Unverified,
    CodeSent,
    Verified,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_course_key_and_names() {
        let course = Course::new(Major::new("CS"), " 1410 ").with_title("Intro");
        assert_eq!(course.key(), "cs-1410");
        assert_eq!(course.ta_role_name(), "cs-1410-ta");
        assert_eq!(course.topic().as_deref(), Some(":information_source: Intro"));
        assert_eq!(Major::new("cs").container_name(ChannelKind::Voice), "cs-voice");
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(
            Course::parse_key("math-2270"),
            Some(("math".to_string(), "2270".to_string()))
        );
        assert_eq!(Course::parse_key("math"), None);
        assert_eq!(Course::parse_key("-1000"), None);
    }

    #[test]
    fn test_channel_kind_as_map_key() {
        let map = std::collections::BTreeMap::from([(ChannelKind::Voice, 1u32)]);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"voice":1}"#);
        let back: std::collections::BTreeMap<ChannelKind, u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_course_equality_ignores_title() {
        let a = Course::new(Major::new("cs"), "1000");
        let b = Course::new(Major::new("cs"), "1000").with_title("Anything");
        assert_eq!(a, b);
    }
}

//! Chat platform seam
//!
//! The core only needs roles, channels (including containers, i.e.
//! categories), members and a handful of mutations on them. [`Platform`]
//! captures exactly that surface.
//!
//! - [`DiscordHttp`]: REST client used in production
//! - [`InMemoryPlatform`]: full simulation used by tests
//! - [`Paced`]: decorator inserting the fixed inter-call delay before every
//!   mutating call

pub mod http;
pub mod memory;
pub mod paced;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::BitOr;

pub use http::{DiscordHttp, DiscordHttpConfig};
pub use memory::InMemoryPlatform;
pub use paced::Paced;

use crate::models::ChannelKind;
use crate::types::{ChannelId, MemberId, Result, RoleId};

/// Permission bit set, using the platform's bit positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Permissions(pub u64);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const CREATE_INSTANT_INVITE: Permissions = Permissions(1 << 0);
    pub const PRIORITY_SPEAKER: Permissions = Permissions(1 << 8);
    pub const STREAM: Permissions = Permissions(1 << 9);
    pub const VIEW_CHANNEL: Permissions = Permissions(1 << 10);
    pub const MANAGE_MESSAGES: Permissions = Permissions(1 << 13);
    pub const SPEAK: Permissions = Permissions(1 << 21);
    pub const MUTE_MEMBERS: Permissions = Permissions(1 << 22);
    pub const DEAFEN_MEMBERS: Permissions = Permissions(1 << 23);

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn contains(&self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Self) -> Self::Output {
        Permissions(self.0 | rhs.0)
    }
}

/// Permission overwrite of a channel for one role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overwrite {
    pub role_id: RoleId,
    pub allow: Permissions,
    pub deny: Permissions,
}

impl Overwrite {
    pub fn allow(role_id: impl Into<RoleId>, allow: Permissions) -> Self {
        Self {
            role_id: role_id.into(),
            allow,
            deny: Permissions::NONE,
        }
    }

    pub fn deny(role_id: impl Into<RoleId>, deny: Permissions) -> Self {
        Self {
            role_id: role_id.into(),
            allow: Permissions::NONE,
            deny,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// A container grouping other channels
    Category,
    Text,
    Voice,
    /// Any channel type the bot does not manage
    Other(u8),
}

impl From<ChannelKind> for ChannelType {
    fn from(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Chat => ChannelType::Text,
            ChannelKind::Voice => ChannelType::Voice,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleInfo {
    pub id: RoleId,
    pub name: String,
    pub position: i64,
    pub hoist: bool,
    pub mentionable: bool,
}

/// Parameters for role creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSpec {
    pub name: String,
    pub hoist: bool,
    pub mentionable: bool,
    pub color: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    pub kind: ChannelType,
    pub parent_id: Option<ChannelId>,
    pub position: i64,
    pub overwrites: Vec<Overwrite>,
}

/// Parameters for channel creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub kind: ChannelType,
    pub parent_id: Option<ChannelId>,
    pub topic: Option<String>,
    pub overwrites: Vec<Overwrite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: MemberId,
    pub roles: Vec<RoleId>,
    pub bot: bool,
}

impl MemberInfo {
    pub fn has_role(&self, role_id: &str) -> bool {
        self.roles.iter().any(|r| r == role_id)
    }
}

/// The `@everyone` role shares its ID with the guild
pub fn everyone_role(guild_id: &str) -> RoleId {
    guild_id.to_string()
}

/// Children of a container, ordered by position then ID
pub fn children_of<'a>(channels: &'a [ChannelInfo], category_id: &str) -> Vec<&'a ChannelInfo> {
    let mut children: Vec<&ChannelInfo> = channels
        .iter()
        .filter(|c| c.parent_id.as_deref() == Some(category_id))
        .collect();
    children.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
    children
}

/// Operations the core performs against the chat platform.
///
/// Lookups of a single object return `Ok(None)` when the ID no longer
/// resolves; mutations of a missing object return `BotError::NotFound`.
#[async_trait]
pub trait Platform: Send + Sync {
    /// ID of the bot's own account, skipped when walking members
    fn bot_user_id(&self) -> Option<&str>;

    async fn roles(&self, guild_id: &str) -> Result<Vec<RoleInfo>>;

    async fn role(&self, guild_id: &str, role_id: &str) -> Result<Option<RoleInfo>> {
        Ok(self
            .roles(guild_id)
            .await?
            .into_iter()
            .find(|r| r.id == role_id))
    }

    async fn create_role(&self, guild_id: &str, spec: &RoleSpec) -> Result<RoleId>;

    async fn delete_role(&self, guild_id: &str, role_id: &str) -> Result<()>;

    async fn channels(&self, guild_id: &str) -> Result<Vec<ChannelInfo>>;

    async fn channel(&self, guild_id: &str, channel_id: &str) -> Result<Option<ChannelInfo>> {
        Ok(self
            .channels(guild_id)
            .await?
            .into_iter()
            .find(|c| c.id == channel_id))
    }

    async fn create_channel(&self, guild_id: &str, spec: &ChannelSpec) -> Result<ChannelId>;

    async fn delete_channel(&self, guild_id: &str, channel_id: &str) -> Result<()>;

    /// Move a channel into another container
    async fn set_channel_parent(&self, guild_id: &str, channel_id: &str, parent_id: &str)
        -> Result<()>;

    /// Bulk reorder of channels
    async fn set_channel_positions(&self, guild_id: &str, positions: &[(ChannelId, i64)])
        -> Result<()>;

    /// Replace all permission overwrites of a channel
    async fn set_channel_overwrites(
        &self,
        guild_id: &str,
        channel_id: &str,
        overwrites: &[Overwrite],
    ) -> Result<()>;

    async fn members(&self, guild_id: &str) -> Result<Vec<MemberInfo>>;

    async fn member(&self, guild_id: &str, member_id: &str) -> Result<Option<MemberInfo>>;

    async fn add_member_roles(
        &self,
        guild_id: &str,
        member_id: &str,
        role_ids: &[RoleId],
        reason: &str,
    ) -> Result<()>;

    async fn remove_member_roles(
        &self,
        guild_id: &str,
        member_id: &str,
        role_ids: &[RoleId],
        reason: &str,
    ) -> Result<()>;

    async fn kick_member(&self, guild_id: &str, member_id: &str, reason: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_combine() {
        let perms = Permissions::VIEW_CHANNEL | Permissions::MANAGE_MESSAGES;
        assert!(perms.contains(Permissions::VIEW_CHANNEL));
        assert!(!perms.contains(Permissions::SPEAK));
        assert_eq!(perms.bits(), (1 << 10) | (1 << 13));
    }

    #[test]
    fn test_children_of_orders_by_position() {
        let channel = |id: &str, parent: Option<&str>, position: i64| ChannelInfo {
            id: id.to_string(),
            name: id.to_string(),
            kind: ChannelType::Text,
            parent_id: parent.map(str::to_string),
            position,
            overwrites: Vec::new(),
        };
        let channels = vec![
            channel("a", Some("cat"), 2),
            channel("b", Some("cat"), 0),
            channel("c", Some("other"), 1),
            channel("d", None, 0),
        ];

        let ids: Vec<_> = children_of(&channels, "cat").iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}

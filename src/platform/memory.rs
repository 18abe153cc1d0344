//! In-memory platform simulation
//!
//! Behaves like the real platform where the core depends on it: containers
//! refuse children beyond the hard capacity, deleting a container orphans
//! its children, deleting a role strips it from members. Every mutating call
//! is counted so tests can assert how much work an operation did.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::{
    children_of, ChannelInfo, ChannelSpec, ChannelType, MemberInfo, Overwrite, Platform,
    RoleInfo, RoleSpec,
};
use crate::types::{BotError, ChannelId, Result, RoleId};

#[derive(Default)]
struct GuildState {
    roles: BTreeMap<String, RoleInfo>,
    channels: BTreeMap<String, ChannelInfo>,
    members: BTreeMap<String, MemberInfo>,
}

impl GuildState {
    fn child_count(&self, category_id: &str) -> usize {
        self.channels
            .values()
            .filter(|c| c.parent_id.as_deref() == Some(category_id))
            .count()
    }

    fn max_child_count(&self) -> usize {
        self.channels
            .values()
            .filter(|c| c.kind == ChannelType::Category)
            .map(|c| self.child_count(&c.id))
            .max()
            .unwrap_or(0)
    }

    fn next_position(&self, parent_id: Option<&str>) -> i64 {
        self.channels
            .values()
            .filter(|c| c.parent_id.as_deref() == parent_id)
            .map(|c| c.position + 1)
            .max()
            .unwrap_or(0)
    }

    fn check_category(&self, category_id: &str) -> Result<()> {
        match self.channels.get(category_id) {
            Some(c) if c.kind == ChannelType::Category => Ok(()),
            Some(_) => Err(BotError::Platform(format!(
                "channel {} is not a category",
                category_id
            ))),
            None => Err(BotError::NotFound(format!("category {}", category_id))),
        }
    }
}

/// Simulated platform shared by all guilds of a test
pub struct InMemoryPlatform {
    bot_user_id: Option<String>,
    max_children: usize,
    max_channels: Option<usize>,
    state: Mutex<HashMap<String, GuildState>>,
    next_id: AtomicU64,
    mutations: AtomicUsize,
    peak_children: AtomicUsize,
    op_counts: Mutex<HashMap<&'static str, usize>>,
}

impl InMemoryPlatform {
    /// Platform whose containers hold at most `max_children` channels
    pub fn new(max_children: usize) -> Self {
        Self {
            bot_user_id: None,
            max_children,
            max_channels: None,
            state: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1000),
            mutations: AtomicUsize::new(0),
            peak_children: AtomicUsize::new(0),
            op_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Limit the total number of channels per guild
    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = Some(max_channels);
        self
    }

    pub fn with_bot_user(mut self, bot_user_id: impl Into<String>) -> Self {
        self.bot_user_id = Some(bot_user_id.into());
        self
    }

    fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn record(&self, op: &'static str) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
        *self.op_counts.lock().await.entry(op).or_insert(0) += 1;
    }

    fn observe(&self, guild: &GuildState) {
        self.peak_children
            .fetch_max(guild.max_child_count(), Ordering::Relaxed);
    }

    /// Total mutating calls since creation or the last reset
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Mutating calls of one kind, e.g. `"create_role"`
    pub async fn op_count(&self, op: &str) -> usize {
        self.op_counts.lock().await.get(op).copied().unwrap_or(0)
    }

    pub async fn reset_counts(&self) {
        self.mutations.store(0, Ordering::Relaxed);
        self.op_counts.lock().await.clear();
    }

    /// Largest child count any container ever reached
    pub fn peak_children(&self) -> usize {
        self.peak_children.load(Ordering::Relaxed)
    }

    pub async fn add_member(&self, guild_id: &str, member_id: &str, roles: &[&str]) {
        let mut state = self.state.lock().await;
        state.entry(guild_id.to_string()).or_default().members.insert(
            member_id.to_string(),
            MemberInfo {
                id: member_id.to_string(),
                roles: roles.iter().map(|r| r.to_string()).collect(),
                bot: Some(member_id) == self.bot_user_id.as_deref(),
            },
        );
    }

    /// Member leaves without the bot being told
    pub async fn remove_member(&self, guild_id: &str, member_id: &str) {
        if let Some(guild) = self.state.lock().await.get_mut(guild_id) {
            guild.members.remove(member_id);
        }
    }

    pub async fn member_roles(&self, guild_id: &str, member_id: &str) -> Vec<RoleId> {
        let state = self.state.lock().await;
        state
            .get(guild_id)
            .and_then(|g| g.members.get(member_id))
            .map(|m| m.roles.clone())
            .unwrap_or_default()
    }

    /// A moderator deletes a role by hand (not counted as a bot mutation)
    pub async fn delete_role_externally(&self, guild_id: &str, role_id: &str) {
        if let Some(guild) = self.state.lock().await.get_mut(guild_id) {
            remove_role(guild, role_id);
        }
    }

    /// A moderator deletes a channel by hand (not counted as a bot mutation)
    pub async fn delete_channel_externally(&self, guild_id: &str, channel_id: &str) {
        if let Some(guild) = self.state.lock().await.get_mut(guild_id) {
            remove_channel(guild, channel_id);
        }
    }

    /// Names of a container's children in display order
    pub async fn child_names(&self, guild_id: &str, category_id: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let Some(guild) = state.get(guild_id) else {
            return Vec::new();
        };
        let channels: Vec<ChannelInfo> = guild.channels.values().cloned().collect();
        children_of(&channels, category_id)
            .into_iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub async fn role_named(&self, guild_id: &str, name: &str) -> Vec<RoleInfo> {
        let state = self.state.lock().await;
        state
            .get(guild_id)
            .map(|g| g.roles.values().filter(|r| r.name == name).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn channels_named(&self, guild_id: &str, name: &str) -> Vec<ChannelInfo> {
        let state = self.state.lock().await;
        state
            .get(guild_id)
            .map(|g| g.channels.values().filter(|c| c.name == name).cloned().collect())
            .unwrap_or_default()
    }
}

fn remove_role(guild: &mut GuildState, role_id: &str) -> bool {
    let existed = guild.roles.remove(role_id).is_some();
    for member in guild.members.values_mut() {
        member.roles.retain(|r| r != role_id);
    }
    existed
}

fn remove_channel(guild: &mut GuildState, channel_id: &str) -> bool {
    let existed = guild.channels.remove(channel_id).is_some();
    for child in guild.channels.values_mut() {
        if child.parent_id.as_deref() == Some(channel_id) {
            child.parent_id = None;
        }
    }
    existed
}

#[async_trait]
impl Platform for InMemoryPlatform {
    fn bot_user_id(&self) -> Option<&str> {
        self.bot_user_id.as_deref()
    }

    async fn roles(&self, guild_id: &str) -> Result<Vec<RoleInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .get(guild_id)
            .map(|g| g.roles.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn role(&self, guild_id: &str, role_id: &str) -> Result<Option<RoleInfo>> {
        let state = self.state.lock().await;
        Ok(state.get(guild_id).and_then(|g| g.roles.get(role_id).cloned()))
    }

    async fn create_role(&self, guild_id: &str, spec: &RoleSpec) -> Result<RoleId> {
        self.record("create_role").await;
        let id = self.next_id();
        let mut state = self.state.lock().await;
        let guild = state.entry(guild_id.to_string()).or_default();
        let position = guild.roles.len() as i64 + 1;
        guild.roles.insert(
            id.clone(),
            RoleInfo {
                id: id.clone(),
                name: spec.name.clone(),
                position,
                hoist: spec.hoist,
                mentionable: spec.mentionable,
            },
        );
        Ok(id)
    }

    async fn delete_role(&self, guild_id: &str, role_id: &str) -> Result<()> {
        self.record("delete_role").await;
        let mut state = self.state.lock().await;
        let guild = state.entry(guild_id.to_string()).or_default();
        if remove_role(guild, role_id) {
            Ok(())
        } else {
            Err(BotError::NotFound(format!("role {}", role_id)))
        }
    }

    async fn channels(&self, guild_id: &str) -> Result<Vec<ChannelInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .get(guild_id)
            .map(|g| g.channels.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn channel(&self, guild_id: &str, channel_id: &str) -> Result<Option<ChannelInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .get(guild_id)
            .and_then(|g| g.channels.get(channel_id).cloned()))
    }

    async fn create_channel(&self, guild_id: &str, spec: &ChannelSpec) -> Result<ChannelId> {
        self.record("create_channel").await;
        let mut state = self.state.lock().await;
        let guild = state.entry(guild_id.to_string()).or_default();

        if let Some(max) = self.max_channels {
            if guild.channels.len() >= max {
                return Err(BotError::Capacity(format!(
                    "guild {} already has {} channels",
                    guild_id, max
                )));
            }
        }
        if let Some(parent) = spec.parent_id.as_deref() {
            guild.check_category(parent)?;
            if guild.child_count(parent) >= self.max_children {
                return Err(BotError::Capacity(format!("category {} is full", parent)));
            }
        }

        let id = self.next_id();
        let position = guild.next_position(spec.parent_id.as_deref());
        guild.channels.insert(
            id.clone(),
            ChannelInfo {
                id: id.clone(),
                name: spec.name.clone(),
                kind: spec.kind,
                parent_id: spec.parent_id.clone(),
                position,
                overwrites: spec.overwrites.clone(),
            },
        );
        self.observe(guild);
        Ok(id)
    }

    async fn delete_channel(&self, guild_id: &str, channel_id: &str) -> Result<()> {
        self.record("delete_channel").await;
        let mut state = self.state.lock().await;
        let guild = state.entry(guild_id.to_string()).or_default();
        if remove_channel(guild, channel_id) {
            Ok(())
        } else {
            Err(BotError::NotFound(format!("channel {}", channel_id)))
        }
    }

    async fn set_channel_parent(
        &self,
        guild_id: &str,
        channel_id: &str,
        parent_id: &str,
    ) -> Result<()> {
        self.record("set_channel_parent").await;
        let mut state = self.state.lock().await;
        let guild = state.entry(guild_id.to_string()).or_default();
        guild.check_category(parent_id)?;

        let current_parent = guild
            .channels
            .get(channel_id)
            .ok_or_else(|| BotError::NotFound(format!("channel {}", channel_id)))?
            .parent_id
            .clone();
        if current_parent.as_deref() == Some(parent_id) {
            return Ok(());
        }
        if guild.child_count(parent_id) >= self.max_children {
            return Err(BotError::Capacity(format!("category {} is full", parent_id)));
        }

        let position = guild.next_position(Some(parent_id));
        if let Some(channel) = guild.channels.get_mut(channel_id) {
            channel.parent_id = Some(parent_id.to_string());
            channel.position = position;
        }
        self.observe(guild);
        Ok(())
    }

    async fn set_channel_positions(
        &self,
        guild_id: &str,
        positions: &[(ChannelId, i64)],
    ) -> Result<()> {
        self.record("set_channel_positions").await;
        let mut state = self.state.lock().await;
        let guild = state.entry(guild_id.to_string()).or_default();
        for (id, position) in positions {
            match guild.channels.get_mut(id) {
                Some(channel) => channel.position = *position,
                None => return Err(BotError::NotFound(format!("channel {}", id))),
            }
        }
        Ok(())
    }

    async fn set_channel_overwrites(
        &self,
        guild_id: &str,
        channel_id: &str,
        overwrites: &[Overwrite],
    ) -> Result<()> {
        self.record("set_channel_overwrites").await;
        let mut state = self.state.lock().await;
        let guild = state.entry(guild_id.to_string()).or_default();
        let channel = guild
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| BotError::NotFound(format!("channel {}", channel_id)))?;
        channel.overwrites = overwrites.to_vec();
        Ok(())
    }

    async fn members(&self, guild_id: &str) -> Result<Vec<MemberInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .get(guild_id)
            .map(|g| g.members.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn member(&self, guild_id: &str, member_id: &str) -> Result<Option<MemberInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .get(guild_id)
            .and_then(|g| g.members.get(member_id).cloned()))
    }

    async fn add_member_roles(
        &self,
        guild_id: &str,
        member_id: &str,
        role_ids: &[RoleId],
        _reason: &str,
    ) -> Result<()> {
        self.record("add_member_roles").await;
        let mut state = self.state.lock().await;
        let guild = state.entry(guild_id.to_string()).or_default();
        for role_id in role_ids {
            if !guild.roles.contains_key(role_id) {
                return Err(BotError::NotFound(format!("role {}", role_id)));
            }
        }
        let member = guild
            .members
            .get_mut(member_id)
            .ok_or_else(|| BotError::NotFound(format!("member {}", member_id)))?;
        for role_id in role_ids {
            if !member.roles.contains(role_id) {
                member.roles.push(role_id.clone());
            }
        }
        Ok(())
    }

    async fn remove_member_roles(
        &self,
        guild_id: &str,
        member_id: &str,
        role_ids: &[RoleId],
        _reason: &str,
    ) -> Result<()> {
        self.record("remove_member_roles").await;
        let mut state = self.state.lock().await;
        let guild = state.entry(guild_id.to_string()).or_default();
        let member = guild
            .members
            .get_mut(member_id)
            .ok_or_else(|| BotError::NotFound(format!("member {}", member_id)))?;
        member.roles.retain(|r| !role_ids.contains(r));
        Ok(())
    }

    async fn kick_member(&self, guild_id: &str, member_id: &str, _reason: &str) -> Result<()> {
        self.record("kick_member").await;
        let mut state = self.state.lock().await;
        let guild = state.entry(guild_id.to_string()).or_default();
        guild
            .members
            .remove(member_id)
            .map(|_| ())
            .ok_or_else(|| BotError::NotFound(format!("member {}", member_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category(name: &str) -> ChannelSpec {
        ChannelSpec {
            name: name.to_string(),
            kind: ChannelType::Category,
            parent_id: None,
            topic: None,
            overwrites: Vec::new(),
        }
    }

    fn text(name: &str, parent: &str) -> ChannelSpec {
        ChannelSpec {
            name: name.to_string(),
            kind: ChannelType::Text,
            parent_id: Some(parent.to_string()),
            topic: None,
            overwrites: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_container_capacity_is_enforced() {
        let platform = InMemoryPlatform::new(2);
        let cat = platform.create_channel("g", &category("cs-chat")).await.unwrap();
        let other = platform.create_channel("g", &category("cs-chat")).await.unwrap();

        let a = platform.create_channel("g", &text("a", &cat)).await.unwrap();
        platform.create_channel("g", &text("b", &cat)).await.unwrap();
        let err = platform.create_channel("g", &text("c", &cat)).await.unwrap_err();
        assert!(matches!(err, BotError::Capacity(_)));

        let c = platform.create_channel("g", &text("c", &other)).await.unwrap();
        assert!(platform.set_channel_parent("g", &c, &cat).await.is_err());
        platform.set_channel_parent("g", &a, &other).await.unwrap();
        assert_eq!(platform.child_names("g", &other).await, vec!["c", "a"]);
        assert_eq!(platform.peak_children(), 2);
    }

    #[tokio::test]
    async fn test_deleting_category_orphans_children() {
        let platform = InMemoryPlatform::new(10);
        let cat = platform.create_channel("g", &category("cs-chat")).await.unwrap();
        let child = platform.create_channel("g", &text("a", &cat)).await.unwrap();

        platform.delete_channel_externally("g", &cat).await;
        let channel = platform.channel("g", &child).await.unwrap().unwrap();
        assert_eq!(channel.parent_id, None);
    }

    #[tokio::test]
    async fn test_role_deletion_strips_members() {
        let platform = InMemoryPlatform::new(10);
        let role = platform
            .create_role(
                "g",
                &RoleSpec {
                    name: "cs-1000".to_string(),
                    hoist: false,
                    mentionable: true,
                    color: 0,
                },
            )
            .await
            .unwrap();
        platform.add_member("g", "m1", &[role.as_str()]).await;
        assert_eq!(platform.member_roles("g", "m1").await, vec![role.clone()]);

        platform.delete_role("g", &role).await.unwrap();
        assert!(platform.member_roles("g", "m1").await.is_empty());
        assert_eq!(platform.mutation_count(), 2);
        assert_eq!(platform.op_count("delete_role").await, 1);
    }
}

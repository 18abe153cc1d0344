//! Fixed-delay pacing of mutating platform calls

use async_trait::async_trait;
use std::time::Duration;

use super::{ChannelInfo, ChannelSpec, MemberInfo, Overwrite, Platform, RoleInfo, RoleSpec};
use crate::types::{ChannelId, Result, RoleId};

/// Wraps a [`Platform`] and sleeps `delay` before every mutating call.
///
/// Reads pass straight through. The delay spaces the calls of one caller;
/// calls from different guild queues each wait on their own and may land
/// in the same window.
pub struct Paced<P> {
    inner: P,
    delay: Duration,
}

impl<P: Platform> Paced<P> {
    pub fn new(inner: P, delay: Duration) -> Self {
        Self { inner, delay }
    }

    async fn pace(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl<P: Platform> Platform for Paced<P> {
    fn bot_user_id(&self) -> Option<&str> {
        self.inner.bot_user_id()
    }

    async fn roles(&self, guild_id: &str) -> Result<Vec<RoleInfo>> {
        self.inner.roles(guild_id).await
    }

    async fn role(&self, guild_id: &str, role_id: &str) -> Result<Option<RoleInfo>> {
        self.inner.role(guild_id, role_id).await
    }

    async fn create_role(&self, guild_id: &str, spec: &RoleSpec) -> Result<RoleId> {
        self.pace().await;
        self.inner.create_role(guild_id, spec).await
    }

    async fn delete_role(&self, guild_id: &str, role_id: &str) -> Result<()> {
        self.pace().await;
        self.inner.delete_role(guild_id, role_id).await
    }

    async fn channels(&self, guild_id: &str) -> Result<Vec<ChannelInfo>> {
        self.inner.channels(guild_id).await
    }

    async fn channel(&self, guild_id: &str, channel_id: &str) -> Result<Option<ChannelInfo>> {
        self.inner.channel(guild_id, channel_id).await
    }

    async fn create_channel(&self, guild_id: &str, spec: &ChannelSpec) -> Result<ChannelId> {
        self.pace().await;
        self.inner.create_channel(guild_id, spec).await
    }

    async fn delete_channel(&self, guild_id: &str, channel_id: &str) -> Result<()> {
        self.pace().await;
        self.inner.delete_channel(guild_id, channel_id).await
    }

    async fn set_channel_parent(
        &self,
        guild_id: &str,
        channel_id: &str,
        parent_id: &str,
    ) -> Result<()> {
        self.pace().await;
        self.inner
            .set_channel_parent(guild_id, channel_id, parent_id)
            .await
    }

    async fn set_channel_positions(
        &self,
        guild_id: &str,
        positions: &[(ChannelId, i64)],
    ) -> Result<()> {
        self.pace().await;
        self.inner.set_channel_positions(guild_id, positions).await
    }

    async fn set_channel_overwrites(
        &self,
        guild_id: &str,
        channel_id: &str,
        overwrites: &[Overwrite],
    ) -> Result<()> {
        self.pace().await;
        self.inner
            .set_channel_overwrites(guild_id, channel_id, overwrites)
            .await
    }

    async fn members(&self, guild_id: &str) -> Result<Vec<MemberInfo>> {
        self.inner.members(guild_id).await
    }

    async fn member(&self, guild_id: &str, member_id: &str) -> Result<Option<MemberInfo>> {
        self.inner.member(guild_id, member_id).await
    }

    async fn add_member_roles(
        &self,
        guild_id: &str,
        member_id: &str,
        role_ids: &[RoleId],
        reason: &str,
    ) -> Result<()> {
        self.pace().await;
        self.inner
            .add_member_roles(guild_id, member_id, role_ids, reason)
            .await
    }

    async fn remove_member_roles(
        &self,
        guild_id: &str,
        member_id: &str,
        role_ids: &[RoleId],
        reason: &str,
    ) -> Result<()> {
        self.pace().await;
        self.inner
            .remove_member_roles(guild_id, member_id, role_ids, reason)
            .await
    }

    async fn kick_member(&self, guild_id: &str, member_id: &str, reason: &str) -> Result<()> {
        self.pace().await;
        self.inner.kick_member(guild_id, member_id, reason).await
    }
}

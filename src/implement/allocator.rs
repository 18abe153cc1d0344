//! Capacity Allocator
//!
//! Finds a container of a major with room for one more channel of a kind,
//! creating (scaling out) a new container when all of them are full.

use tracing::info;

use crate::db::GuildStorageDoc;
use crate::guild::GuildContext;
use crate::models::{ChannelKind, Major};
use crate::platform::{
    everyone_role, ChannelInfo, ChannelSpec, ChannelType, Overwrite, Permissions,
};
use crate::types::{ChannelId, Result};

/// Container IDs of a major for one kind that still resolve to a category
pub fn live_categories(
    storage: &GuildStorageDoc,
    major: &Major,
    kind: ChannelKind,
    channels: &[ChannelInfo],
) -> Vec<ChannelId> {
    storage
        .major_implements
        .get(&major.prefix)
        .map(|m| m.categories(kind))
        .unwrap_or(&[])
        .iter()
        .filter(|id| {
            channels
                .iter()
                .any(|c| &c.id == *id && c.kind == ChannelType::Category)
        })
        .cloned()
        .collect()
}

pub fn child_count(channels: &[ChannelInfo], category_id: &str) -> usize {
    channels
        .iter()
        .filter(|c| c.parent_id.as_deref() == Some(category_id))
        .count()
}

/// Return a container of `major` for `kind` holding fewer than the usable
/// capacity, creating one if needed. The new container is persisted before
/// this returns.
pub async fn category_for(
    ctx: &GuildContext,
    storage: &mut GuildStorageDoc,
    major: &Major,
    kind: ChannelKind,
) -> Result<ChannelId> {
    let channels = ctx.platform.channels(ctx.guild_id()).await?;
    let usable = ctx.limits.usable();

    if let Some(id) = live_categories(storage, major, kind, &channels)
        .into_iter()
        .find(|id| child_count(&channels, id) < usable)
    {
        return Ok(id);
    }

    create_category(ctx, storage, major, kind).await
}

/// Append a new container to the major's list for `kind`
pub async fn create_category(
    ctx: &GuildContext,
    storage: &mut GuildStorageDoc,
    major: &Major,
    kind: ChannelKind,
) -> Result<ChannelId> {
    let spec = ChannelSpec {
        name: major.container_name(kind),
        kind: ChannelType::Category,
        parent_id: None,
        topic: None,
        overwrites: vec![Overwrite::deny(
            everyone_role(ctx.guild_id()),
            Permissions::VIEW_CHANNEL,
        )],
    };
    let id = ctx.platform.create_channel(ctx.guild_id(), &spec).await?;

    let list = storage
        .major_implements
        .entry(major.prefix.clone())
        .or_default()
        .category_ids
        .entry(kind)
        .or_default();
    list.push(id.clone());
    let index = list.len() - 1;
    ctx.db.save_guild_storage(storage).await?;

    info!(
        guild_id = %ctx.guild_id(),
        major = %major.prefix,
        kind = kind.as_str(),
        index,
        category_id = %id,
        "Scaled out container"
    );
    Ok(id)
}

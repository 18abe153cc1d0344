//! Course implements: a main role, a TA role and one channel per kind

use std::collections::BTreeMap;
use tracing::{info, warn};

use super::allocator::category_for;
use crate::db::{CourseImplement, GuildStorageDoc};
use crate::guild::GuildContext;
use crate::models::{ChannelKind, Course};
use crate::platform::{everyone_role, ChannelSpec, Overwrite, Permissions, RoleSpec};
use crate::types::{ChannelId, Result, RoleId};

const TA_ROLE_COLOR: u32 = 0x2ECC71;

fn main_role_spec(course: &Course) -> RoleSpec {
    RoleSpec {
        name: course.main_role_name(),
        hoist: false,
        mentionable: true,
        color: 0,
    }
}

fn ta_role_spec(course: &Course) -> RoleSpec {
    RoleSpec {
        name: course.ta_role_name(),
        hoist: true,
        mentionable: true,
        color: TA_ROLE_COLOR,
    }
}

/// Permission overwrites of a course channel
pub fn channel_overwrites(
    guild_id: &str,
    kind: ChannelKind,
    main_role_id: &str,
    ta_role_id: &str,
    moderator_role_id: Option<&str>,
) -> Vec<Overwrite> {
    let mut overwrites = match kind {
        ChannelKind::Chat => vec![
            Overwrite::deny(
                everyone_role(guild_id),
                Permissions::VIEW_CHANNEL | Permissions::CREATE_INSTANT_INVITE,
            ),
            Overwrite::allow(main_role_id, Permissions::VIEW_CHANNEL),
            Overwrite::allow(
                ta_role_id,
                Permissions::VIEW_CHANNEL | Permissions::MANAGE_MESSAGES,
            ),
        ],
        ChannelKind::Voice => vec![
            Overwrite {
                role_id: everyone_role(guild_id),
                allow: Permissions::SPEAK | Permissions::STREAM,
                deny: Permissions::VIEW_CHANNEL,
            },
            Overwrite::allow(main_role_id, Permissions::VIEW_CHANNEL),
            Overwrite::allow(
                ta_role_id,
                Permissions::VIEW_CHANNEL
                    | Permissions::MUTE_MEMBERS
                    | Permissions::DEAFEN_MEMBERS
                    | Permissions::PRIORITY_SPEAKER,
            ),
        ],
    };
    if let Some(moderator) = moderator_role_id {
        overwrites.push(Overwrite::allow(moderator, Permissions::VIEW_CHANNEL));
    }
    overwrites
}

fn overwrites_for(ctx: &GuildContext, kind: ChannelKind, main: &str, ta: &str) -> Vec<Overwrite> {
    channel_overwrites(
        ctx.guild_id(),
        kind,
        main,
        ta,
        ctx.config.moderator_role_id.as_deref(),
    )
}

async fn create_channel(
    ctx: &GuildContext,
    storage: &mut GuildStorageDoc,
    course: &Course,
    kind: ChannelKind,
    main: &str,
    ta: &str,
) -> Result<ChannelId> {
    let parent = category_for(ctx, storage, &course.major, kind).await?;
    let spec = ChannelSpec {
        name: course.channel_name(kind),
        kind: kind.into(),
        parent_id: Some(parent),
        topic: match kind {
            ChannelKind::Chat => course.topic(),
            ChannelKind::Voice => None,
        },
        overwrites: overwrites_for(ctx, kind, main, ta),
    };
    ctx.platform.create_channel(ctx.guild_id(), &spec).await
}

/// Resources created so far by a failing creation, removed best-effort
#[derive(Default)]
struct Created {
    roles: Vec<RoleId>,
    channels: Vec<ChannelId>,
}

impl Created {
    async fn rollback(self, ctx: &GuildContext) {
        for id in self.channels {
            if let Err(e) = ctx.platform.delete_channel(ctx.guild_id(), &id).await {
                warn!(guild_id = %ctx.guild_id(), channel_id = %id, error = %e, "Rollback of channel failed");
            }
        }
        for id in self.roles {
            if let Err(e) = ctx.platform.delete_role(ctx.guild_id(), &id).await {
                warn!(guild_id = %ctx.guild_id(), role_id = %id, error = %e, "Rollback of role failed");
            }
        }
    }
}

async fn create_resources(
    ctx: &GuildContext,
    storage: &mut GuildStorageDoc,
    course: &Course,
    created: &mut Created,
) -> Result<CourseImplement> {
    let main_role_id = ctx
        .platform
        .create_role(ctx.guild_id(), &main_role_spec(course))
        .await?;
    created.roles.push(main_role_id.clone());

    let ta_role_id = ctx
        .platform
        .create_role(ctx.guild_id(), &ta_role_spec(course))
        .await?;
    created.roles.push(ta_role_id.clone());

    let mut channel_ids = BTreeMap::new();
    for kind in ChannelKind::ALL {
        let id = create_channel(ctx, storage, course, kind, &main_role_id, &ta_role_id).await?;
        created.channels.push(id.clone());
        channel_ids.insert(kind, id);
    }

    Ok(CourseImplement {
        main_role_id,
        ta_role_id,
        channel_ids,
    })
}

/// Create and persist the implement of a course.
///
/// On failure the resources created so far are deleted again; containers
/// created along the way stay registered and are scaled in by the next sort.
pub async fn create(
    ctx: &GuildContext,
    storage: &mut GuildStorageDoc,
    course: &Course,
) -> Result<CourseImplement> {
    let mut created = Created::default();
    let implement = match create_resources(ctx, storage, course, &mut created).await {
        Ok(implement) => implement,
        Err(e) => {
            warn!(guild_id = %ctx.guild_id(), course = %course, error = %e, "Course creation failed, rolling back");
            created.rollback(ctx).await;
            return Err(e);
        }
    };

    storage
        .major_implements
        .entry(course.major.prefix.clone())
        .or_default()
        .course_implements
        .insert(course.key(), implement.clone());
    ctx.db.save_guild_storage(storage).await?;

    info!(guild_id = %ctx.guild_id(), course = %course, "Created course implement");
    Ok(implement)
}

fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Delete the platform resources of a course, then its stored mapping
pub async fn delete(
    ctx: &GuildContext,
    storage: &mut GuildStorageDoc,
    course_key: &str,
) -> Result<bool> {
    let Some((prefix, implement)) = storage.major_implements.iter().find_map(|(prefix, m)| {
        m.course_implements
            .get(course_key)
            .map(|i| (prefix.clone(), i.clone()))
    }) else {
        return Ok(false);
    };

    for channel_id in implement.channel_ids.values() {
        ignore_missing(ctx.platform.delete_channel(ctx.guild_id(), channel_id).await)?;
    }
    for role_id in implement.role_ids() {
        ignore_missing(ctx.platform.delete_role(ctx.guild_id(), role_id).await)?;
    }

    if let Some(major) = storage.major_implements.get_mut(&prefix) {
        major.course_implements.remove(course_key);
    }
    ctx.db.save_guild_storage(storage).await?;

    info!(guild_id = %ctx.guild_id(), course = %course_key, "Deleted course implement");
    Ok(true)
}

/// Recreate whatever part of a course implement no longer resolves.
///
/// Channels are given fresh overwrites when one of the roles was replaced.
/// Returns the number of recreated resources; a course without an
/// implement is left alone.
pub async fn guarantee(
    ctx: &GuildContext,
    storage: &mut GuildStorageDoc,
    course: &Course,
) -> Result<usize> {
    let key = course.key();
    let Some(mut implement) = storage.course_implement(&key).cloned() else {
        return Ok(0);
    };

    let roles = ctx.platform.roles(ctx.guild_id()).await?;
    let resolves = |id: &str| roles.iter().any(|r| r.id == id);
    let mut repaired = 0;

    let main_missing = !resolves(&implement.main_role_id);
    let ta_missing = !resolves(&implement.ta_role_id);
    if main_missing {
        implement.main_role_id = ctx
            .platform
            .create_role(ctx.guild_id(), &main_role_spec(course))
            .await?;
        repaired += 1;
    }
    if ta_missing {
        implement.ta_role_id = ctx
            .platform
            .create_role(ctx.guild_id(), &ta_role_spec(course))
            .await?;
        repaired += 1;
    }
    let roles_replaced = main_missing || ta_missing;

    let channels = ctx.platform.channels(ctx.guild_id()).await?;
    for kind in ChannelKind::ALL {
        let live = implement
            .channel(kind)
            .filter(|id| channels.iter().any(|c| &&c.id == id))
            .cloned();

        match live {
            Some(id) if roles_replaced => {
                let overwrites =
                    overwrites_for(ctx, kind, &implement.main_role_id, &implement.ta_role_id);
                ctx.platform
                    .set_channel_overwrites(ctx.guild_id(), &id, &overwrites)
                    .await?;
            }
            Some(_) => {}
            None => {
                let id = create_channel(
                    ctx,
                    storage,
                    course,
                    kind,
                    &implement.main_role_id,
                    &implement.ta_role_id,
                )
                .await?;
                implement.channel_ids.insert(kind, id);
                repaired += 1;
            }
        }
    }

    if repaired > 0 {
        storage
            .major_implements
            .entry(course.major.prefix.clone())
            .or_default()
            .course_implements
            .insert(key, implement);
        ctx.db.save_guild_storage(storage).await?;
        info!(guild_id = %ctx.guild_id(), course = %course, repaired, "Repaired course implement");
    }
    Ok(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::guild::testing::*;
    use crate::platform::{InMemoryPlatform, Platform};
    use std::sync::Arc;

    #[test]
    fn test_voice_overwrites() {
        let overwrites = channel_overwrites("g", ChannelKind::Voice, "main", "ta", Some("mods"));
        assert_eq!(overwrites.len(), 4);
        assert!(overwrites[0].allow.contains(Permissions::SPEAK | Permissions::STREAM));
        assert!(overwrites[0].deny.contains(Permissions::VIEW_CHANNEL));
        assert!(overwrites[2].allow.contains(Permissions::PRIORITY_SPEAKER));
        assert_eq!(overwrites[3].role_id, "mods");
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let f = fixture(50);
        let mut storage = f.db.guild_storage(GUILD).await.unwrap();
        let course = course("cs-1000").with_title("Intro");

        let implement = create(&f.ctx, &mut storage, &course).await.unwrap();
        assert_eq!(f.platform.role_named(GUILD, "cs-1000-ta").await.len(), 1);
        let chat = f
            .platform
            .channel(GUILD, implement.channel(ChannelKind::Chat).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chat.name, "cs-1000");
        assert_eq!(chat.overwrites.len(), 4);

        let stored = f.db.guild_storage(GUILD).await.unwrap();
        assert_eq!(stored.course_implement("cs-1000"), Some(&implement));

        assert!(delete(&f.ctx, &mut storage, "cs-1000").await.unwrap());
        assert!(f.platform.role_named(GUILD, "cs-1000").await.is_empty());
        assert!(f.platform.channels_named(GUILD, "cs-1000").await.is_empty());
        assert!(f.db.guild_storage(GUILD).await.unwrap().course_implement("cs-1000").is_none());
        assert!(!delete(&f.ctx, &mut storage, "cs-1000").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_create_rolls_back() {
        let mut f = fixture(50);
        // Room for the chat container only
        let platform = Arc::new(InMemoryPlatform::new(50).with_max_channels(1));
        f.ctx.platform = platform.clone();
        let mut storage = f.db.guild_storage(GUILD).await.unwrap();

        assert!(create(&f.ctx, &mut storage, &course("cs-1000")).await.is_err());
        assert!(platform.roles(GUILD).await.unwrap().is_empty());
        assert!(platform.channels_named(GUILD, "cs-1000").await.is_empty());
        assert!(f.db.guild_storage(GUILD).await.unwrap().course_implement("cs-1000").is_none());
    }

    #[tokio::test]
    async fn test_guarantee_recreates_only_missing() {
        let f = fixture(50);
        let mut storage = f.db.guild_storage(GUILD).await.unwrap();
        let course = course("cs-1000");
        let before = create(&f.ctx, &mut storage, &course).await.unwrap();

        f.platform.reset_counts().await;
        assert_eq!(guarantee(&f.ctx, &mut storage, &course).await.unwrap(), 0);
        assert_eq!(f.platform.mutation_count(), 0);

        f.platform.delete_role_externally(GUILD, &before.ta_role_id).await;
        f.platform
            .delete_channel_externally(GUILD, before.channel(ChannelKind::Voice).unwrap())
            .await;

        assert_eq!(guarantee(&f.ctx, &mut storage, &course).await.unwrap(), 2);
        let after = f.db.guild_storage(GUILD).await.unwrap().course_implement("cs-1000").cloned().unwrap();
        assert_eq!(after.main_role_id, before.main_role_id);
        assert_ne!(after.ta_role_id, before.ta_role_id);
        assert_eq!(after.channel(ChannelKind::Chat), before.channel(ChannelKind::Chat));

        // Surviving chat channel now references the new TA role
        let chat = f
            .platform
            .channel(GUILD, after.channel(ChannelKind::Chat).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(chat.overwrites.iter().any(|o| o.role_id == after.ta_role_id));
    }
}

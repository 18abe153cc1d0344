//! Rebalancer
//!
//! Keeps the channels of a major packed left to right across its containers
//! in course-key order:
//!
//! 1. rank every course channel of a kind by course key; its target
//!    container is `rank / usable capacity` (scaling out when short)
//! 2. move misplaced channels, swapping with a misplaced channel of a full
//!    target so no container ever exceeds the hard limit
//! 3. order each container's children by name
//! 4. delete empty overflow containers (scale-in); the first container of a
//!    kind is never deleted
//!
//! Every step only issues calls when something is out of place, so sorting
//! a sorted major is free.

use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::allocator::{child_count, create_category, live_categories};
use crate::db::GuildStorageDoc;
use crate::guild::GuildContext;
use crate::models::{ChannelKind, Major};
use crate::platform::{children_of, ChannelInfo, ChannelType};
use crate::types::{ChannelId, Result};

/// Platform calls made by one sort
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SortReport {
    pub moved: usize,
    pub swapped: usize,
    pub reordered: usize,
    pub created: usize,
    pub removed: usize,
}

impl SortReport {
    /// Channels that changed container
    pub fn migrations(&self) -> usize {
        self.moved + self.swapped * 2
    }

    pub fn is_noop(&self) -> bool {
        *self == SortReport::default()
    }
}

/// Local view of which container holds which channel, updated as moves
/// are made so a sort needs a single channel listing up front.
struct Placement {
    parent: HashMap<ChannelId, Option<ChannelId>>,
    position: HashMap<ChannelId, i64>,
    count: HashMap<ChannelId, usize>,
}

impl Placement {
    fn new(channels: &[ChannelInfo]) -> Self {
        let mut placement = Placement {
            parent: HashMap::new(),
            position: HashMap::new(),
            count: HashMap::new(),
        };
        for channel in channels {
            placement
                .parent
                .insert(channel.id.clone(), channel.parent_id.clone());
            placement.position.insert(channel.id.clone(), channel.position);
            if let Some(parent) = &channel.parent_id {
                *placement.count.entry(parent.clone()).or_insert(0) += 1;
            }
        }
        placement
    }

    fn parent_of(&self, channel_id: &str) -> Option<&ChannelId> {
        self.parent.get(channel_id).and_then(Option::as_ref)
    }

    fn count(&self, category_id: &str) -> usize {
        self.count.get(category_id).copied().unwrap_or(0)
    }

    fn children<'a>(&'a self, category_id: &'a str) -> impl Iterator<Item = &'a ChannelId> + 'a {
        self.parent
            .iter()
            .filter(move |(_, parent)| parent.as_deref() == Some(category_id))
            .map(|(id, _)| id)
    }

    fn move_to(&mut self, channel_id: &str, category_id: &str) {
        if let Some(old) = self.parent_of(channel_id).cloned() {
            if let Some(count) = self.count.get_mut(&old) {
                *count = count.saturating_sub(1);
            }
        }
        let position = self
            .children(category_id)
            .filter_map(|id| self.position.get(id))
            .map(|p| p + 1)
            .max()
            .unwrap_or(0);
        self.parent
            .insert(channel_id.to_string(), Some(category_id.to_string()));
        self.position.insert(channel_id.to_string(), position);
        *self.count.entry(category_id.to_string()).or_insert(0) += 1;
    }
}

async fn move_channel(
    ctx: &GuildContext,
    placement: &mut Placement,
    channel_id: &str,
    category_id: &str,
) -> Result<()> {
    ctx.platform
        .set_channel_parent(ctx.guild_id(), channel_id, category_id)
        .await?;
    placement.move_to(channel_id, category_id);
    debug!(guild_id = %ctx.guild_id(), channel_id = %channel_id, category_id = %category_id, "Moved channel");
    Ok(())
}

/// Sort every channel kind of a major
pub async fn sort(
    ctx: &GuildContext,
    storage: &mut GuildStorageDoc,
    major: &Major,
) -> Result<SortReport> {
    let mut report = SortReport::default();
    for kind in ChannelKind::ALL {
        sort_kind(ctx, storage, major, kind, &mut report).await?;
    }

    if !report.is_noop() {
        info!(
            guild_id = %ctx.guild_id(),
            major = %major.prefix,
            moved = report.moved,
            swapped = report.swapped,
            reordered = report.reordered,
            created = report.created,
            removed = report.removed,
            "Sorted major"
        );
    }
    Ok(report)
}

async fn sort_kind(
    ctx: &GuildContext,
    storage: &mut GuildStorageDoc,
    major: &Major,
    kind: ChannelKind,
    report: &mut SortReport,
) -> Result<()> {
    let usable = ctx.limits.usable();
    let channels = ctx.platform.channels(ctx.guild_id()).await?;

    // Course implements are keyed by course key, so this is canonical order
    let ranked: Vec<ChannelId> = storage
        .major_implements
        .get(&major.prefix)
        .map(|m| {
            m.course_implements
                .values()
                .filter_map(|i| i.channel(kind))
                .filter(|id| channels.iter().any(|c| &&c.id == id))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let mut categories = live_categories(storage, major, kind, &channels);
    let needed = ranked.len().div_ceil(usable);
    while categories.len() < needed {
        categories.push(create_category(ctx, storage, major, kind).await?);
        report.created += 1;
    }

    let targets: HashMap<ChannelId, ChannelId> = ranked
        .iter()
        .enumerate()
        .map(|(rank, id)| (id.clone(), categories[rank / usable].clone()))
        .collect();

    let mut placement = Placement::new(&channels);
    place(ctx, &ranked, &targets, &mut placement, report).await?;

    let channels = ctx.platform.channels(ctx.guild_id()).await?;
    for category in &categories {
        if reorder(ctx, &channels, category).await? {
            report.reordered += 1;
        }
    }
    report.removed += scale_in(ctx, storage, major, kind, &categories, &channels).await?;
    Ok(())
}

async fn place(
    ctx: &GuildContext,
    ranked: &[ChannelId],
    targets: &HashMap<ChannelId, ChannelId>,
    placement: &mut Placement,
    report: &mut SortReport,
) -> Result<()> {
    let usable = ctx.limits.usable();
    let max = ctx.limits.max_children;
    let misplaced = |placement: &Placement, id: &str| {
        targets
            .get(id)
            .is_some_and(|target| placement.parent_of(id) != Some(target))
    };
    let mut stuck: HashSet<ChannelId> = HashSet::new();

    // Each pass either settles a channel for good or marks it stuck
    while let Some(channel) = ranked
        .iter()
        .find(|id| !stuck.contains(*id) && misplaced(&*placement, id.as_str()))
        .cloned()
    {
        let target = &targets[&channel];
        if placement.count(target) < usable {
            move_channel(ctx, placement, &channel, target).await?;
            report.moved += 1;
            continue;
        }

        let victim = placement
            .children(target)
            .filter(|id| misplaced(&*placement, id.as_str()))
            .max_by_key(|id| placement.position.get(*id).copied().unwrap_or(0))
            .cloned();

        match victim {
            Some(victim) if placement.count(target) < max => {
                let source = placement
                    .parent_of(&channel)
                    .cloned()
                    .unwrap_or_else(|| targets[&victim].clone());
                move_channel(ctx, placement, &channel, target).await?;
                if placement.count(&source) < max {
                    move_channel(ctx, placement, &victim, &source).await?;
                    report.swapped += 1;
                } else {
                    report.moved += 1;
                    warn!(guild_id = %ctx.guild_id(), channel_id = %victim, "No room to swap channel out");
                }
            }
            None if placement.count(target) < max => {
                move_channel(ctx, placement, &channel, target).await?;
                report.moved += 1;
            }
            _ => {
                warn!(
                    guild_id = %ctx.guild_id(),
                    channel_id = %channel,
                    category_id = %target,
                    "Target container is full, leaving channel in place"
                );
                stuck.insert(channel);
            }
        }
    }
    Ok(())
}

/// Order a container's children by name. Returns whether a call was made.
async fn reorder(ctx: &GuildContext, channels: &[ChannelInfo], category_id: &str) -> Result<bool> {
    let current = children_of(channels, category_id);
    let mut desired = current.clone();
    desired.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    if current.iter().map(|c| &c.id).eq(desired.iter().map(|c| &c.id)) {
        return Ok(false);
    }

    let positions: Vec<(ChannelId, i64)> = desired
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.clone(), i as i64))
        .collect();
    ctx.platform
        .set_channel_positions(ctx.guild_id(), &positions)
        .await?;
    Ok(true)
}

/// Delete empty containers past the first one and drop them from storage
async fn scale_in(
    ctx: &GuildContext,
    storage: &mut GuildStorageDoc,
    major: &Major,
    kind: ChannelKind,
    categories: &[ChannelId],
    channels: &[ChannelInfo],
) -> Result<usize> {
    let empty: Vec<&ChannelId> = categories
        .iter()
        .skip(1)
        .filter(|id| child_count(channels, id) == 0)
        .collect();
    if empty.is_empty() {
        return Ok(0);
    }

    for id in &empty {
        match ctx.platform.delete_channel(ctx.guild_id(), id).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
    }
    if let Some(list) = storage
        .major_implements
        .get_mut(&major.prefix)
        .and_then(|m| m.category_ids.get_mut(&kind))
    {
        list.retain(|id| !empty.contains(&id));
    }
    ctx.db.save_guild_storage(storage).await?;

    info!(
        guild_id = %ctx.guild_id(),
        major = %major.prefix,
        kind = kind.as_str(),
        removed = empty.len(),
        "Scaled in containers"
    );
    Ok(empty.len())
}

/// Drop stored container IDs that no longer resolve to a category
pub async fn guarantee_major(
    ctx: &GuildContext,
    storage: &mut GuildStorageDoc,
    major: &Major,
) -> Result<usize> {
    let channels = ctx.platform.channels(ctx.guild_id()).await?;
    let Some(implement) = storage.major_implements.get_mut(&major.prefix) else {
        return Ok(0);
    };

    let mut dropped = 0;
    for list in implement.category_ids.values_mut() {
        let before = list.len();
        list.retain(|id| {
            channels
                .iter()
                .any(|c| &c.id == id && c.kind == ChannelType::Category)
        });
        dropped += before - list.len();
    }

    if dropped > 0 {
        ctx.db.save_guild_storage(storage).await?;
        info!(guild_id = %ctx.guild_id(), major = %major.prefix, dropped, "Dropped dangling containers");
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::guild::testing::*;
    use crate::implement::course;

    /// Containers of `max_children = 4` hold two course channels outside swaps
    async fn setup(keys: &[&str]) -> (Fixture, GuildStorageDoc) {
        let f = fixture(4);
        let mut storage = f.db.guild_storage(GUILD).await.unwrap();
        for key in keys {
            course::create(&f.ctx, &mut storage, &course(key)).await.unwrap();
        }
        (f, storage)
    }

    async fn container_names(f: &Fixture, kind: ChannelKind) -> Vec<Vec<String>> {
        major_container_names(f, "cs", kind).await
    }

    async fn major_container_names(f: &Fixture, prefix: &str, kind: ChannelKind) -> Vec<Vec<String>> {
        let storage = f.db.guild_storage(GUILD).await.unwrap();
        let mut names = Vec::new();
        for id in storage.major_implements[prefix].categories(kind) {
            names.push(f.platform.child_names(GUILD, id).await);
        }
        names
    }

    #[tokio::test]
    async fn test_sort_fills_left_to_right() {
        let (f, mut storage) = setup(&["cs-3000", "cs-1000", "cs-2000"]).await;
        assert_eq!(
            container_names(&f, ChannelKind::Chat).await,
            vec![vec!["cs-3000", "cs-1000"], vec!["cs-2000"]]
        );

        let report = sort(&f.ctx, &mut storage, &Major::new("cs")).await.unwrap();
        assert_eq!(report.swapped, 2);

        for kind in ChannelKind::ALL {
            assert_eq!(
                container_names(&f, kind).await,
                vec![vec!["cs-1000", "cs-2000"], vec!["cs-3000"]]
            );
        }
        assert!(f.platform.peak_children() <= 4);
    }

    #[tokio::test]
    async fn test_second_sort_is_free() {
        let (f, mut storage) = setup(&["cs-3000", "cs-1000", "cs-2000"]).await;
        sort(&f.ctx, &mut storage, &Major::new("cs")).await.unwrap();

        f.platform.reset_counts().await;
        let report = sort(&f.ctx, &mut storage, &Major::new("cs")).await.unwrap();
        assert!(report.is_noop());
        assert_eq!(report.migrations(), 0);
        assert_eq!(f.platform.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_majors_sort_independently_and_stay_stable() {
        let (f, mut storage) = setup(&["math-1000", "cs-2000", "cs-1000"]).await;
        let (cs, math) = (Major::new("cs"), Major::new("math"));

        sort(&f.ctx, &mut storage, &cs).await.unwrap();
        sort(&f.ctx, &mut storage, &math).await.unwrap();
        for kind in ChannelKind::ALL {
            assert_eq!(
                major_container_names(&f, "cs", kind).await,
                vec![vec!["cs-1000", "cs-2000"]]
            );
            assert_eq!(
                major_container_names(&f, "math", kind).await,
                vec![vec!["math-1000"]]
            );
        }

        f.platform.reset_counts().await;
        for major in [&cs, &math] {
            let report = sort(&f.ctx, &mut storage, major).await.unwrap();
            assert_eq!(report.migrations(), 0);
            assert!(report.is_noop());
        }
        assert_eq!(f.platform.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_sort_orders_within_container() {
        let f = fixture(50);
        let mut storage = f.db.guild_storage(GUILD).await.unwrap();
        for key in ["cs-2000", "cs-1000"] {
            course::create(&f.ctx, &mut storage, &course(key)).await.unwrap();
        }

        let report = sort(&f.ctx, &mut storage, &Major::new("cs")).await.unwrap();
        assert_eq!(report.migrations(), 0);
        assert_eq!(report.reordered, 2);
        assert_eq!(
            container_names(&f, ChannelKind::Voice).await,
            vec![vec!["cs-1000", "cs-2000"]]
        );
    }

    #[tokio::test]
    async fn test_scale_in_removes_empty_overflow() {
        let (f, mut storage) = setup(&["cs-1000", "cs-2000", "cs-3000"]).await;
        course::delete(&f.ctx, &mut storage, "cs-3000").await.unwrap();

        let report = sort(&f.ctx, &mut storage, &Major::new("cs")).await.unwrap();
        assert_eq!(report.removed, 2);
        let stored = f.db.guild_storage(GUILD).await.unwrap();
        assert_eq!(stored.major_implements["cs"].categories(ChannelKind::Chat).len(), 1);

        // The first container stays even when empty
        course::delete(&f.ctx, &mut storage, "cs-1000").await.unwrap();
        course::delete(&f.ctx, &mut storage, "cs-2000").await.unwrap();
        sort(&f.ctx, &mut storage, &Major::new("cs")).await.unwrap();
        let stored = f.db.guild_storage(GUILD).await.unwrap();
        assert_eq!(stored.major_implements["cs"].categories(ChannelKind::Voice).len(), 1);
    }

    #[tokio::test]
    async fn test_lost_container_is_pruned_and_replaced() {
        let (f, mut storage) = setup(&["cs-1000", "cs-2000", "cs-3000"]).await;
        let lost = storage.major_implements["cs"].categories(ChannelKind::Chat)[1].clone();
        f.platform.delete_channel_externally(GUILD, &lost).await;

        let major = Major::new("cs");
        assert_eq!(guarantee_major(&f.ctx, &mut storage, &major).await.unwrap(), 1);
        assert_eq!(guarantee_major(&f.ctx, &mut storage, &major).await.unwrap(), 0);

        let report = sort(&f.ctx, &mut storage, &major).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(
            container_names(&f, ChannelKind::Chat).await,
            vec![vec!["cs-1000", "cs-2000"], vec!["cs-3000"]]
        );
    }
}

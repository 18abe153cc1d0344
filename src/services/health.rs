//! Reconciler (health assurance)
//!
//! Walks everything the bot manages in a guild and repairs drift between
//! the store and the platform. Each step is queued as its own task on the
//! guild's queue, so member actions arriving meanwhile interleave between
//! steps instead of racing with them. Every step is idempotent; a second
//! run right after the first issues no platform mutations.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ban, member_update};
use crate::guild::GuildContext;
use crate::implement::{ImplementKey, SortReport};
use crate::types::{MemberId, Result};
use crate::worker::{GuildQueues, TaskLabel};

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub run_id: Uuid,
    /// Verification resources recreated
    pub verification_repaired: usize,
    /// Container IDs dropped and course resources recreated
    pub implements_repaired: usize,
    pub members_synced: usize,
    pub members_kicked: usize,
    pub departed_cleared: usize,
    pub sort: SortReport,
    /// Steps or member tasks that failed (already logged)
    pub failures: usize,
}

impl ReconciliationReport {
    /// Whether the pass found anything to fix
    pub fn is_clean(&self) -> bool {
        self.verification_repaired == 0
            && self.implements_repaired == 0
            && self.members_kicked == 0
            && self.departed_cleared == 0
            && self.sort.is_noop()
            && self.failures == 0
    }
}

pub struct Reconciler {
    ctx: GuildContext,
    queues: Arc<GuildQueues>,
}

impl Reconciler {
    pub fn new(ctx: GuildContext, queues: Arc<GuildQueues>) -> Self {
        Self { ctx, queues }
    }

    /// Run all steps in order, waiting for each before queueing the next
    pub async fn run(&self) -> ReconciliationReport {
        let mut report = ReconciliationReport {
            run_id: Uuid::new_v4(),
            ..Default::default()
        };
        info!(guild_id = %self.ctx.guild_id(), run_id = %report.run_id, "Reconciliation started");

        match self.guarantee_verification().await {
            Ok(repaired) => report.verification_repaired = repaired,
            Err(_) => report.failures += 1,
        }
        match self.guarantee_implements().await {
            Ok(repaired) => report.implements_repaired = repaired,
            Err(_) => report.failures += 1,
        }
        match self.sync_members().await {
            Ok((present, synced, kicked, failures)) => {
                report.members_synced = synced;
                report.members_kicked = kicked;
                report.failures += failures;
                match self.clear_departed(present).await {
                    Ok(cleared) => report.departed_cleared = cleared,
                    Err(_) => report.failures += 1,
                }
            }
            Err(_) => report.failures += 2,
        }
        match self.sort_majors().await {
            Ok(sort) => report.sort = sort,
            Err(_) => report.failures += 1,
        }

        info!(
            guild_id = %self.ctx.guild_id(),
            run_id = %report.run_id,
            verification_repaired = report.verification_repaired,
            implements_repaired = report.implements_repaired,
            members_synced = report.members_synced,
            members_kicked = report.members_kicked,
            departed_cleared = report.departed_cleared,
            migrations = report.sort.migrations(),
            failures = report.failures,
            "Reconciliation finished"
        );
        report
    }

    /// (a) verification role
    async fn guarantee_verification(&self) -> Result<usize> {
        let ctx = self.ctx.clone();
        self.queues
            .enqueue(self.ctx.guild_id(), "guarantee_verification", async move {
                ctx.implements().guarantee(&ImplementKey::Verification).await
            })
            .await
    }

    /// (b) containers of every major, then every stored course implement
    async fn guarantee_implements(&self) -> Result<usize> {
        let ctx = self.ctx.clone();
        self.queues
            .enqueue(self.ctx.guild_id(), "guarantee_implements", async move {
                let implements = ctx.implements();
                let mut repaired = 0;
                for major in &ctx.config.majors {
                    repaired += implements
                        .guarantee(&ImplementKey::Major(major.clone()))
                        .await?;
                }
                for course in implements.stored_courses().await? {
                    repaired += implements.guarantee(&ImplementKey::Course(course)).await?;
                }
                Ok(repaired)
            })
            .await
    }

    /// (c) one task per member: user record, ban enforcement, role sync.
    /// Returns the present member IDs and the synced, kicked and failed
    /// counts.
    async fn sync_members(&self) -> Result<(Vec<MemberId>, usize, usize, usize)> {
        let members = self.ctx.platform.members(self.ctx.guild_id()).await?;
        let bot_id = self.ctx.platform.bot_user_id().map(str::to_string);
        let present: Vec<MemberId> = members.iter().map(|m| m.id.clone()).collect();

        let handles: Vec<_> = members
            .into_iter()
            .filter(|m| !m.bot && Some(&m.id) != bot_id.as_ref())
            .map(|member| {
                let ctx = self.ctx.clone();
                let member_id = member.id.clone();
                self.queues.enqueue(
                    self.ctx.guild_id(),
                    TaskLabel::member("reconcile_member", member.id),
                    async move {
                        ctx.db
                            .find_or_create_user(&member_id, Some(ctx.guild_id()))
                            .await?;
                        if ban::kick_if_banned(&ctx, &member_id).await? {
                            return Ok(true);
                        }
                        member_update::sync_member(&ctx, &member_id).await?;
                        Ok(false)
                    },
                )
            })
            .collect();

        let (mut synced, mut kicked, mut failures) = (0, 0, 0);
        for result in join_all(handles).await {
            match result {
                Ok(true) => kicked += 1,
                Ok(false) => synced += 1,
                Err(_) => failures += 1,
            }
        }
        Ok((present, synced, kicked, failures))
    }

    /// (d) forget users whose guild record outlived their membership
    async fn clear_departed(&self, present: Vec<MemberId>) -> Result<usize> {
        let ctx = self.ctx.clone();
        self.queues
            .enqueue(self.ctx.guild_id(), "clear_departed", async move {
                let departed: Vec<MemberId> = ctx
                    .db
                    .users_in_guild(ctx.guild_id())
                    .await?
                    .into_iter()
                    .map(|u| u.member_id)
                    .filter(|id| !present.contains(id))
                    .collect();
                if departed.is_empty() {
                    return Ok(0);
                }
                warn!(guild_id = %ctx.guild_id(), count = departed.len(), "Members left without notice");
                member_update::leave_guild_many(&ctx, &departed).await?;
                Ok(departed.len())
            })
            .await
    }

    /// (e) delete unused course implements, sort and scale in every major
    async fn sort_majors(&self) -> Result<SortReport> {
        let ctx = self.ctx.clone();
        self.queues
            .enqueue(self.ctx.guild_id(), "sort_majors", async move {
                let implements = ctx.implements();
                implements.delete_empty_courses().await?;
                let mut total = SortReport::default();
                for major in &ctx.config.majors {
                    let report = implements.sort(major).await?;
                    total.moved += report.moved;
                    total.swapped += report.swapped;
                    total.reordered += report.reordered;
                    total.created += report.created;
                    total.removed += report.removed;
                }
                Ok(total)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, UserDoc};
    use crate::guild::testing::*;
    use crate::models::{ChannelKind, VerificationStatus};
    use crate::platform::Platform;
    use std::time::Duration;

    async fn seeded() -> (Fixture, Reconciler) {
        let f = fixture(4);
        for (id, courses) in [
            ("m1", vec!["cs-3000", "cs-1000"]),
            ("m2", vec!["cs-2000"]),
            ("m3", vec!["math-1000"]),
        ] {
            f.platform.add_member(GUILD, id, &[]).await;
            let mut user = UserDoc::new(id);
            user.verification_status = VerificationStatus::Verified;
            let keys: Vec<String> = courses.iter().map(|c| c.to_string()).collect();
            user.add_courses(GUILD, &keys);
            f.db.insert_user(user).await;
        }
        f.platform.add_member(GUILD, "bot", &[]).await;

        let queues = Arc::new(GuildQueues::new(Duration::ZERO));
        let reconciler = Reconciler::new(f.ctx.clone(), queues);
        (f, reconciler)
    }

    #[tokio::test]
    async fn test_reconciliation_converges_and_repeats_free() {
        let (f, reconciler) = seeded().await;

        let first = reconciler.run().await;
        assert_eq!(first.failures, 0);
        assert_eq!(first.verification_repaired, 1);
        assert_eq!(first.members_synced, 3);

        let storage = f.db.guild_storage(GUILD).await.unwrap();
        let implement = storage.course_implement("cs-2000").unwrap();
        assert!(f.platform.member_roles(GUILD, "m2").await.contains(&implement.main_role_id));
        assert!(f.platform.member_roles(GUILD, "bot").await.is_empty());
        assert!(f.platform.peak_children() <= 4);

        f.platform.reset_counts().await;
        let second = reconciler.run().await;
        assert!(second.is_clean(), "{:?}", second);
        assert_eq!(f.platform.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_reconciliation_repairs_drift() {
        let (f, reconciler) = seeded().await;
        reconciler.run().await;

        let storage = f.db.guild_storage(GUILD).await.unwrap();
        let implement = storage.course_implement("cs-1000").cloned().unwrap();
        f.platform.delete_role_externally(GUILD, &implement.main_role_id).await;
        f.platform
            .delete_channel_externally(GUILD, implement.channel(ChannelKind::Chat).unwrap())
            .await;
        f.platform.remove_member(GUILD, "m3").await;

        let report = reconciler.run().await;
        assert_eq!(report.failures, 0);
        assert_eq!(report.implements_repaired, 2);
        assert_eq!(report.departed_cleared, 1);

        let storage = f.db.guild_storage(GUILD).await.unwrap();
        let repaired = storage.course_implement("cs-1000").unwrap();
        assert!(f.platform.role(GUILD, &repaired.main_role_id).await.unwrap().is_some());
        assert!(f.platform.member_roles(GUILD, "m1").await.contains(&repaired.main_role_id));
        // m3 was the only math member
        assert!(storage.course_implement("math-1000").is_none());

        f.platform.reset_counts().await;
        assert!(reconciler.run().await.is_clean());
        assert_eq!(f.platform.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_reconciliation_kicks_banned() {
        let (f, reconciler) = seeded().await;
        f.db.set_banned("m2", true).await.unwrap();

        let report = reconciler.run().await;
        assert_eq!(report.members_kicked, 1);
        assert!(f.platform.member(GUILD, "m2").await.unwrap().is_none());
        assert!(f.db.guild_storage(GUILD).await.unwrap().course_implement("cs-2000").is_none());
    }
}

//! Collaborator interface of the engine
//!
//! Command handlers, the verification web flow and platform event listeners
//! call into [`StudyBot`]. Guild-scoped work is queued on the guild's
//! mutation queue; the returned [`TaskHandle`] resolves once it ran.

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::db::Database;
use crate::guild::{GuildConfig, GuildContext};
use crate::implement::CapacityLimits;
use crate::models::VerificationStatus;
use crate::platform::Platform;
use crate::services::{
    ban, member_update, reset, AssignmentChange, CourseCatalog, ReconciliationReport,
    Reconciler, RoleDiff, Semester, VerifyOutcome,
};
use crate::types::{BotError, GuildId, MemberId, Result};
use crate::worker::{GuildQueues, TaskHandle, TaskLabel};

/// Engine-wide settings
#[derive(Debug, Clone)]
pub struct BotOptions {
    /// Hard platform limit of children per container
    pub max_children: usize,
    /// Fixed pause between queue steps and between role add/remove calls
    pub rate_limit: Duration,
    pub reset_grace_days: i64,
}

impl Default for BotOptions {
    fn default() -> Self {
        Self {
            max_children: 50,
            rate_limit: Duration::from_millis(1000),
            reset_grace_days: 30,
        }
    }
}

pub struct StudyBot {
    guilds: HashMap<GuildId, GuildContext>,
    queues: Arc<GuildQueues>,
    platform: Arc<dyn Platform>,
    db: Arc<dyn Database>,
    options: BotOptions,
}

impl StudyBot {
    pub fn new(
        platform: Arc<dyn Platform>,
        db: Arc<dyn Database>,
        catalog: Arc<dyn CourseCatalog>,
        configs: Vec<GuildConfig>,
        options: BotOptions,
    ) -> Self {
        let limits = CapacityLimits::new(options.max_children);
        let guilds = configs
            .into_iter()
            .map(|config| {
                let ctx = GuildContext {
                    config: Arc::new(config),
                    platform: platform.clone(),
                    db: db.clone(),
                    catalog: catalog.clone(),
                    limits,
                    step_delay: options.rate_limit,
                };
                (ctx.config.guild_id.clone(), ctx)
            })
            .collect();

        Self {
            guilds,
            queues: Arc::new(GuildQueues::new(options.rate_limit)),
            platform,
            db,
            options,
        }
    }

    pub fn guild(&self, guild_id: &str) -> Result<&GuildContext> {
        self.guilds
            .get(guild_id)
            .ok_or_else(|| BotError::Config(format!("guild {} is not configured", guild_id)))
    }

    pub fn guild_ids(&self) -> impl Iterator<Item = &GuildId> {
        self.guilds.keys()
    }

    /// Queue `task` on the guild's queue with an owned context
    fn queue<T, F, Fut>(&self, guild_id: &str, label: TaskLabel, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(GuildContext) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        match self.guild(guild_id) {
            Ok(ctx) => self.queues.enqueue(guild_id, label, task(ctx.clone())),
            Err(e) => TaskHandle::failed(e),
        }
    }

    // ========================================================================
    // Member events
    // ========================================================================

    /// A member joined, left or toggled TA status for courses. Resolves with
    /// the course keys that were affected.
    pub fn on_course_assignment_changed(
        &self,
        guild_id: &str,
        member_id: &str,
        courses: Vec<String>,
        change: AssignmentChange,
    ) -> TaskHandle<Vec<String>> {
        let member_id = member_id.to_string();
        self.queue(
            guild_id,
            TaskLabel::member("course_assignment", member_id.clone()),
            move |ctx| async move {
                member_update::change_courses(&ctx, &member_id, &courses, change).await
            },
        )
    }

    /// Drop every course assignment of a member
    pub fn on_unassign_all(&self, guild_id: &str, member_id: &str) -> TaskHandle<()> {
        let member_id = member_id.to_string();
        self.queue(
            guild_id,
            TaskLabel::member("unassign_all", member_id.clone()),
            move |ctx| async move { member_update::unassign_all(&ctx, &member_id).await },
        )
    }

    /// The member's global verification state changed; resync their roles
    pub fn on_verification_changed(
        &self,
        guild_id: &str,
        member_id: &str,
    ) -> TaskHandle<Option<RoleDiff>> {
        let member_id = member_id.to_string();
        self.queue(
            guild_id,
            TaskLabel::member("verification_changed", member_id.clone()),
            move |ctx| async move { member_update::sync_member(&ctx, &member_id).await },
        )
    }

    pub fn on_member_left(&self, guild_id: &str, member_id: &str) -> TaskHandle<()> {
        let member_id = member_id.to_string();
        self.queue(
            guild_id,
            TaskLabel::member("member_left", member_id.clone()),
            move |ctx| async move { member_update::leave_guild(&ctx, &member_id).await },
        )
    }

    /// Resolves with `true` when the member was kicked for being banned
    pub fn on_member_joined(&self, guild_id: &str, member_id: &str) -> TaskHandle<bool> {
        let member_id = member_id.to_string();
        self.queue(
            guild_id,
            TaskLabel::member("member_joined", member_id.clone()),
            move |ctx| async move {
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
    }

    // ========================================================================
    // Reconciliation and resets
    // ========================================================================

    pub async fn run_reconciliation(&self, guild_id: &str) -> Result<ReconciliationReport> {
        let ctx = self.guild(guild_id)?.clone();
        Ok(Reconciler::new(ctx, self.queues.clone()).run().await)
    }

    /// Reconcile every configured guild concurrently
    pub async fn run_reconciliation_all(&self) -> Vec<ReconciliationReport> {
        join_all(
            self.guilds
                .values()
                .map(|ctx| Reconciler::new(ctx.clone(), self.queues.clone()))
                .map(|reconciler| async move { reconciler.run().await }),
        )
        .await
    }

    /// Reset stale course assignments; resolves with the number of members
    pub fn reset_assignments(&self, guild_id: &str) -> TaskHandle<usize> {
        let grace_days = self.options.reset_grace_days;
        self.queue(guild_id, TaskLabel::new("reset_assignments"), move |ctx| async move {
            reset::reset_assignments(&ctx, grace_days, Utc::now()).await
        })
    }

    /// Queue the semester check in every guild
    pub async fn check_semester_reset(&self) -> Vec<Result<Option<(Semester, usize)>>> {
        let grace_days = self.options.reset_grace_days;
        let handles: Vec<_> = self
            .guilds
            .keys()
            .map(|guild_id| {
                self.queue(guild_id, TaskLabel::new("semester_reset"), move |ctx| async move {
                    reset::check_semester_reset(&ctx, grace_days, Utc::now()).await
                })
            })
            .collect();
        join_all(handles).await
    }

    // ========================================================================
    // Bans and verification
    // ========================================================================

    /// Ban a member globally and kick them from every guild they are in.
    /// Resolves with the number of guilds they were kicked from.
    pub async fn ban(&self, member_id: &str) -> Result<usize> {
        self.db.set_banned(member_id, true).await?;
        info!(member_id = %member_id, "Member banned");

        let mut handles = Vec::new();
        for guild_id in self.guilds.keys() {
            if self.platform.member(guild_id, member_id).await?.is_none() {
                continue;
            }
            let member_id = member_id.to_string();
            handles.push(self.queue(
                guild_id,
                TaskLabel::member("ban_kick", member_id.clone()),
                move |ctx| async move { ban::kick(&ctx, &member_id).await },
            ));
        }

        let mut kicked = 0;
        for result in join_all(handles).await {
            match result {
                Ok(true) => kicked += 1,
                Ok(false) => {}
                Err(e) => warn!(member_id = %member_id, error = %e, "Ban kick failed"),
            }
        }
        Ok(kicked)
    }

    /// Clear the ban flag; the member has to rejoin by themselves
    pub async fn unban(&self, member_id: &str) -> Result<()> {
        self.db.set_banned(member_id, false).await?;
        info!(member_id = %member_id, "Member unbanned");
        Ok(())
    }

    /// Record a freshly sent verification code (UNVERIFIED -> CODE_SENT)
    pub async fn store_verification_code(
        &self,
        member_id: &str,
        student_id: &str,
        code: &str,
    ) -> Result<()> {
        let mut user = self.db.find_or_create_user(member_id, None).await?;
        if user.is_verified() {
            return Err(BotError::Config(format!("member {} is already verified", member_id)));
        }
        user.student_id = Some(student_id.trim().to_lowercase());
        user.verification_code = Some(code.to_string());
        user.verification_status = VerificationStatus::CodeSent;
        self.db.save_user(&user).await
    }

    /// Redeem a verification code (CODE_SENT -> VERIFIED) and sync the
    /// member's roles in every guild they are in. Returns the verified
    /// member, or `None` for an unknown code.
    pub async fn verify_code(&self, code: &str) -> Result<Option<MemberId>> {
        let Some(user) = self.db.find_user_by_code(code).await? else {
            return Ok(None);
        };
        let member_id = user.member_id.clone();

        let mut guilds = Vec::new();
        for guild_id in self.guilds.keys() {
            if self.platform.member(guild_id, &member_id).await?.is_some() {
                guilds.push(guild_id.clone());
            }
        }

        let mut banned = false;
        if guilds.is_empty() {
            // Not in any guild yet; roles follow on join
            let mut user = user;
            user.verification_status = VerificationStatus::Verified;
            user.verification_code = None;
            self.db.save_user(&user).await?;
        }
        for guild_id in guilds {
            let id = member_id.clone();
            let outcome = self
                .queue(
                    &guild_id,
                    TaskLabel::member("mark_verified", member_id.clone()),
                    move |ctx| async move { member_update::mark_verified(&ctx, &id).await },
                )
                .await?;
            if outcome == VerifyOutcome::Banned {
                banned = true;
                break;
            }
        }

        if banned {
            self.ban(&member_id).await?;
        }
        Ok(Some(member_id))
    }

    // ========================================================================
    // Schedules
    // ========================================================================

    /// Reconcile every guild every `interval`
    pub fn spawn_periodic_reconciliation(self: &Arc<Self>, interval: Duration) {
        let bot = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; the startup pass already ran
            ticker.tick().await;
            loop {
                ticker.tick().await;
                bot.run_reconciliation_all().await;
            }
        });
    }

    /// Run the semester check once a day
    pub fn spawn_semester_schedule(self: &Arc<Self>) {
        let bot = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = reset::until_next_check(Utc::now());
                info!(wait_secs = wait.as_secs(), "Next semester reset check scheduled");
                tokio::time::sleep(wait).await;
                for result in bot.check_semester_reset().await {
                    if let Err(e) = result {
                        error!(error = %e, "Semester reset failed");
                    }
                }
            }
        });
    }
}

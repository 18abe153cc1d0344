//! Member update operations
//!
//! Each function is one queued unit of work: change the stored desired
//! state, bring the member's roles in line with it, then clean up course
//! implements nobody uses any more. Callers run these through the guild's
//! queue.

use tracing::{info, warn};

use super::role_diff::RoleDiff;
use crate::db::UserDoc;
use crate::guild::GuildContext;
use crate::models::VerificationStatus;
use crate::types::{MemberId, Result};

/// How a member's course assignments change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentChange {
    Add,
    Remove,
    ToggleTa,
}

/// Outcome of marking a member verified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    /// The student ID belongs to a banned account; this one is banned too
    Banned,
}

/// Normalised keys of the courses a change applies to
async fn change_keys(
    ctx: &GuildContext,
    user: &UserDoc,
    course_keys: &[String],
    change: AssignmentChange,
) -> Result<Vec<String>> {
    match change {
        // Only offered courses can be joined
        AssignmentChange::Add => Ok(ctx
            .resolve_courses(course_keys)
            .await?
            .iter()
            .map(|c| c.key())
            .collect()),
        // Anything currently assigned can be left, even if no longer offered
        AssignmentChange::Remove | AssignmentChange::ToggleTa => Ok(course_keys
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| user.assignment(ctx.guild_id(), k).is_some())
            .collect()),
    }
}

/// Apply an assignment change to a member. Returns the course keys that
/// were actually affected.
pub async fn change_courses(
    ctx: &GuildContext,
    member_id: &str,
    course_keys: &[String],
    change: AssignmentChange,
) -> Result<Vec<String>> {
    let mut user = ctx.db.find_or_create_user(member_id, Some(ctx.guild_id())).await?;
    let keys = change_keys(ctx, &user, course_keys, change).await?;

    if !keys.is_empty() {
        match change {
            AssignmentChange::Add => user.add_courses(ctx.guild_id(), &keys),
            AssignmentChange::Remove => user.remove_courses(ctx.guild_id(), &keys),
            AssignmentChange::ToggleTa => user.toggle_ta(ctx.guild_id(), &keys),
        }
        ctx.db.save_guild_data(&user, ctx.guild_id()).await?;
        info!(guild_id = %ctx.guild_id(), member_id = %member_id, change = ?change, courses = ?keys, "Updated course assignments");
    }

    sync_user(ctx, &user).await?;
    clean_up(ctx).await?;
    Ok(keys)
}

pub async fn unassign_all(ctx: &GuildContext, member_id: &str) -> Result<()> {
    let mut user = ctx.db.find_or_create_user(member_id, Some(ctx.guild_id())).await?;
    user.remove_all_courses(ctx.guild_id());
    ctx.db.save_guild_data(&user, ctx.guild_id()).await?;
    info!(guild_id = %ctx.guild_id(), member_id = %member_id, "Unassigned all courses");

    sync_user(ctx, &user).await?;
    clean_up(ctx).await
}

/// Unassign every course from many members, cleaning up once at the end
pub async fn unassign_all_many(ctx: &GuildContext, member_ids: &[MemberId]) -> Result<usize> {
    info!(guild_id = %ctx.guild_id(), count = member_ids.len(), "Unassigning all courses from members");
    let mut users = Vec::with_capacity(member_ids.len());
    for member_id in member_ids {
        let mut user = ctx.db.find_or_create_user(member_id, Some(ctx.guild_id())).await?;
        user.remove_all_courses(ctx.guild_id());
        ctx.db.save_guild_data(&user, ctx.guild_id()).await?;
        users.push(user);
    }

    for user in &users {
        if let Err(e) = sync_user(ctx, user).await {
            warn!(guild_id = %ctx.guild_id(), member_id = %user.member_id, error = %e, "Role sync failed");
        }
    }
    clean_up(ctx).await?;
    Ok(users.len())
}

/// Mark a member verified and sync their roles, unless the student ID
/// they verified with belongs to a banned account
pub async fn mark_verified(ctx: &GuildContext, member_id: &str) -> Result<VerifyOutcome> {
    let mut user = ctx.db.find_or_create_user(member_id, Some(ctx.guild_id())).await?;
    user.verification_status = VerificationStatus::Verified;
    user.verification_code = None;

    let banned_sibling = match &user.student_id {
        Some(student_id) => ctx
            .db
            .find_users_by_student_id(student_id)
            .await?
            .iter()
            .any(|other| other.member_id != user.member_id && other.banned),
        None => false,
    };
    ctx.db.save_user(&user).await?;

    if banned_sibling {
        ctx.db.set_banned(member_id, true).await?;
        warn!(guild_id = %ctx.guild_id(), member_id = %member_id, "Verified with a banned student ID");
        return Ok(VerifyOutcome::Banned);
    }

    info!(guild_id = %ctx.guild_id(), member_id = %member_id, "Marked verified");
    sync_user(ctx, &user).await?;
    Ok(VerifyOutcome::Verified)
}

/// Forget a member's data for this guild after they left
pub async fn leave_guild(ctx: &GuildContext, member_id: &str) -> Result<()> {
    ctx.db.clear_guild(member_id, ctx.guild_id()).await?;
    info!(guild_id = %ctx.guild_id(), member_id = %member_id, "Cleared data of departed member");
    clean_up(ctx).await
}

/// Same as [`leave_guild`] for many members, cleaning up once
pub async fn leave_guild_many(ctx: &GuildContext, member_ids: &[MemberId]) -> Result<()> {
    for member_id in member_ids {
        ctx.db.clear_guild(member_id, ctx.guild_id()).await?;
    }
    info!(guild_id = %ctx.guild_id(), count = member_ids.len(), "Cleared data of departed members");
    clean_up(ctx).await
}

/// Bring a member's roles in line with the store. Returns `None` when the
/// member is not in the guild.
pub async fn sync_member(ctx: &GuildContext, member_id: &str) -> Result<Option<RoleDiff>> {
    let user = ctx.db.find_or_create_user(member_id, Some(ctx.guild_id())).await?;
    sync_user(ctx, &user).await
}

async fn sync_user(ctx: &GuildContext, user: &UserDoc) -> Result<Option<RoleDiff>> {
    let Some(member) = ctx.platform.member(ctx.guild_id(), &user.member_id).await? else {
        return Ok(None);
    };
    let diff = RoleDiff::compute(ctx, user, &member).await?;
    if !diff.is_empty() {
        diff.apply(ctx, &user.member_id).await?;
    }
    Ok(Some(diff))
}

/// Delete course implements without members, then sort every major
pub async fn clean_up(ctx: &GuildContext) -> Result<()> {
    let implements = ctx.implements();
    implements.delete_empty_courses().await?;
    for major in &ctx.config.majors {
        implements.sort(major).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::guild::testing::*;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_join_toggle_leave() {
        let f = fixture(50);
        f.platform.add_member(GUILD, "m1", &[]).await;

        let applied = change_courses(&f.ctx, "m1", &keys(&["CS-1000", "bio-1"]), AssignmentChange::Add)
            .await
            .unwrap();
        assert_eq!(applied, keys(&["cs-1000"]));

        change_courses(&f.ctx, "m1", &keys(&["cs-1000"]), AssignmentChange::ToggleTa)
            .await
            .unwrap();
        let implement = f.db.guild_storage(GUILD).await.unwrap().course_implement("cs-1000").cloned().unwrap();
        let roles = f.platform.member_roles(GUILD, "m1").await;
        assert!(roles.contains(&implement.ta_role_id));

        let applied = change_courses(&f.ctx, "m1", &keys(&["cs-1000", "cs-2000"]), AssignmentChange::Remove)
            .await
            .unwrap();
        assert_eq!(applied, keys(&["cs-1000"]));
        assert!(f.platform.member_roles(GUILD, "m1").await.is_empty());
        assert!(f.db.guild_storage(GUILD).await.unwrap().course_implement("cs-1000").is_none());
    }

    #[tokio::test]
    async fn test_leave_guild_deletes_unused_implements() {
        let f = fixture(50);
        f.platform.add_member(GUILD, "m1", &[]).await;
        change_courses(&f.ctx, "m1", &keys(&["math-1000"]), AssignmentChange::Add)
            .await
            .unwrap();

        f.platform.remove_member(GUILD, "m1").await;
        leave_guild(&f.ctx, "m1").await.unwrap();

        let user = f.db.find_user("m1").await.unwrap().unwrap();
        assert!(user.guild(GUILD).is_none());
        assert!(f.db.guild_storage(GUILD).await.unwrap().course_implement("math-1000").is_none());
    }

    #[tokio::test]
    async fn test_verify_with_banned_student_id() {
        let f = fixture(50);
        f.platform.add_member(GUILD, "alt", &[]).await;

        let mut banned = UserDoc::new("main");
        banned.student_id = Some("u0000001".to_string());
        banned.banned = true;
        f.db.insert_user(banned).await;

        let mut alt = UserDoc::new("alt");
        alt.student_id = Some("u0000001".to_string());
        alt.verification_code = Some("abc".to_string());
        f.db.insert_user(alt).await;

        assert_eq!(mark_verified(&f.ctx, "alt").await.unwrap(), VerifyOutcome::Banned);
        let alt = f.db.find_user("alt").await.unwrap().unwrap();
        assert!(alt.banned);
        assert!(alt.verification_code.is_none());
        assert!(f.platform.member_roles(GUILD, "alt").await.is_empty());
    }

    #[tokio::test]
    async fn test_bulk_unassign() {
        let f = fixture(50);
        for id in ["m1", "m2"] {
            f.platform.add_member(GUILD, id, &[]).await;
            change_courses(&f.ctx, id, &keys(&["cs-1000"]), AssignmentChange::Add)
                .await
                .unwrap();
        }

        let count = unassign_all_many(&f.ctx, &keys(&["m1", "m2"])).await.unwrap();
        assert_eq!(count, 2);
        assert!(f.db.guild_storage(GUILD).await.unwrap().course_implement("cs-1000").is_none());
        assert!(!f.db.find_user("m2").await.unwrap().unwrap().has_courses(GUILD));
    }
}

//! Role Diff Engine
//!
//! Compares what the store says a member should hold with the roles the
//! member holds on the platform and produces the minimal change set.

use tracing::debug;

use crate::db::UserDoc;
use crate::guild::GuildContext;
use crate::platform::MemberInfo;
use crate::types::{Result, RoleId};

const ROLE_UPDATE_REASON: &str = "Course and verification role sync";

/// Roles to add to and remove from one member
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleDiff {
    pub to_add: Vec<RoleId>,
    pub to_remove: Vec<RoleId>,
    /// Course keys whose roles were taken away; candidates for deletion
    pub emptied: Vec<String>,
}

impl RoleDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    fn add(&mut self, member: &MemberInfo, role_id: &RoleId) {
        if !member.has_role(role_id) && !self.to_add.contains(role_id) {
            self.to_add.push(role_id.clone());
        }
    }

    fn remove(&mut self, member: &MemberInfo, role_id: &RoleId) -> bool {
        if member.has_role(role_id) && !self.to_remove.contains(role_id) {
            self.to_remove.push(role_id.clone());
            return true;
        }
        false
    }

    /// Compute the diff for a member. Course implements the member should
    /// have are created on the way, so this must run inside the guild queue.
    pub async fn compute(ctx: &GuildContext, user: &UserDoc, member: &MemberInfo) -> Result<Self> {
        let mut diff = RoleDiff::default();
        let implements = ctx.implements();

        if ctx.config.verification_enabled {
            if user.is_verified() {
                let verification = implements.get_or_create_verification().await?;
                diff.add(member, &verification.role_id);
            } else if let Some(verification) = implements.verification().await? {
                diff.remove(member, &verification.role_id);
            }
        }

        for course in ctx.known_courses(Some(user)).await? {
            let key = course.key();
            match user.assignment(ctx.guild_id(), &key) {
                Some(assignment) => {
                    let implement = implements.get_or_create_course(&course).await?;
                    diff.add(member, &implement.main_role_id);
                    if assignment.is_ta {
                        diff.add(member, &implement.ta_role_id);
                    } else {
                        diff.remove(member, &implement.ta_role_id);
                    }
                }
                None => {
                    let Some(implement) = implements.course(&course).await? else {
                        continue;
                    };
                    let mut removed = false;
                    for role_id in implement.role_ids() {
                        removed |= diff.remove(member, role_id);
                    }
                    if removed {
                        diff.emptied.push(key);
                    }
                }
            }
        }

        Ok(diff)
    }

    /// Add, pause if both lists are non-empty, remove, then delete the
    /// implements that lost their last member
    pub async fn apply(&self, ctx: &GuildContext, member_id: &str) -> Result<()> {
        if !self.to_add.is_empty() {
            ctx.platform
                .add_member_roles(ctx.guild_id(), member_id, &self.to_add, ROLE_UPDATE_REASON)
                .await?;
        }
        if !self.to_add.is_empty() && !self.to_remove.is_empty() && !ctx.step_delay.is_zero() {
            tokio::time::sleep(ctx.step_delay).await;
        }
        if !self.to_remove.is_empty() {
            ctx.platform
                .remove_member_roles(ctx.guild_id(), member_id, &self.to_remove, ROLE_UPDATE_REASON)
                .await?;
        }

        let implements = ctx.implements();
        for course_key in &self.emptied {
            implements.delete_course_if_empty(course_key).await?;
        }

        debug!(
            guild_id = %ctx.guild_id(),
            member_id = %member_id,
            added = self.to_add.len(),
            removed = self.to_remove.len(),
            "Applied role diff"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::guild::testing::*;
    use crate::models::VerificationStatus;
    use crate::platform::Platform;

    async fn member(f: &Fixture, id: &str) -> MemberInfo {
        f.platform.member(GUILD, id).await.unwrap().unwrap()
    }

    async fn sync(f: &Fixture, user: &UserDoc) -> RoleDiff {
        let member = member(f, &user.member_id).await;
        let diff = RoleDiff::compute(&f.ctx, user, &member).await.unwrap();
        diff.apply(&f.ctx, &user.member_id).await.unwrap();
        diff
    }

    #[tokio::test]
    async fn test_assignment_creates_and_grants() {
        let f = fixture(50);
        f.platform.add_member(GUILD, "m1", &[]).await;
        let mut user = UserDoc::new("m1");
        user.verification_status = VerificationStatus::Verified;
        user.add_courses(GUILD, &["cs-1000".to_string()]);
        f.db.insert_user(user.clone()).await;

        let diff = sync(&f, &user).await;
        assert_eq!(diff.to_add.len(), 2);
        assert!(diff.to_remove.is_empty());

        let storage = f.db.guild_storage(GUILD).await.unwrap();
        let implement = storage.course_implement("cs-1000").unwrap();
        let roles = f.platform.member_roles(GUILD, "m1").await;
        assert!(roles.contains(&implement.main_role_id));
        assert!(!roles.contains(&implement.ta_role_id));
        assert!(roles.contains(&storage.verification_implement.unwrap().role_id));
    }

    #[tokio::test]
    async fn test_correct_roles_give_empty_diff() {
        let f = fixture(50);
        f.platform.add_member(GUILD, "m1", &[]).await;
        let mut user = UserDoc::new("m1");
        user.add_courses(GUILD, &["cs-1000".to_string()]);
        user.toggle_ta(GUILD, &["cs-1000".to_string()]);
        f.db.insert_user(user.clone()).await;
        sync(&f, &user).await;

        f.platform.reset_counts().await;
        let member = member(&f, "m1").await;
        let diff = RoleDiff::compute(&f.ctx, &user, &member).await.unwrap();
        assert!(diff.is_empty());
        diff.apply(&f.ctx, "m1").await.unwrap();
        assert_eq!(f.platform.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_unassign_removes_roles_and_deletes_last() {
        let f = fixture(50);
        f.platform.add_member(GUILD, "m1", &[]).await;
        f.platform.add_member(GUILD, "m2", &[]).await;

        let mut users = Vec::new();
        for id in ["m1", "m2"] {
            let mut user = UserDoc::new(id);
            user.add_courses(GUILD, &["math-1000".to_string()]);
            f.db.insert_user(user.clone()).await;
            sync(&f, &user).await;
            users.push(user);
        }

        // Non-last assignee leaves: implement stays
        users[0].remove_courses(GUILD, &["math-1000".to_string()]);
        f.db.save_guild_data(&users[0], GUILD).await.unwrap();
        let diff = sync(&f, &users[0]).await;
        assert_eq!(diff.emptied, vec!["math-1000".to_string()]);
        assert!(f.platform.member_roles(GUILD, "m1").await.is_empty());
        assert!(f.db.guild_storage(GUILD).await.unwrap().course_implement("math-1000").is_some());

        // Last assignee leaves: implement goes
        users[1].remove_courses(GUILD, &["math-1000".to_string()]);
        f.db.save_guild_data(&users[1], GUILD).await.unwrap();
        sync(&f, &users[1]).await;
        assert!(f.db.guild_storage(GUILD).await.unwrap().course_implement("math-1000").is_none());
        assert!(f.platform.role_named(GUILD, "math-1000").await.is_empty());
    }

    #[tokio::test]
    async fn test_unverified_loses_verification_role() {
        let f = fixture(50);
        let role = f.ctx.implements().get_or_create_verification().await.unwrap();
        f.platform.add_member(GUILD, "m1", &[role.role_id.as_str()]).await;

        let user = UserDoc::new("m1");
        let diff = sync(&f, &user).await;
        assert_eq!(diff.to_remove, vec![role.role_id]);
        assert!(f.platform.member_roles(GUILD, "m1").await.is_empty());
    }
}

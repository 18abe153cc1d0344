//! Virtual bans
//!
//! A ban is a global flag on the user. Members carrying it are kicked from
//! every guild the bot manages, now and whenever they show up again.

use tracing::info;

use super::member_update;
use crate::guild::GuildContext;
use crate::types::Result;

const KICK_REASON: &str = "Automatic kick due to virtual ban";

/// Kick a member from this guild and forget their guild data
pub async fn kick(ctx: &GuildContext, member_id: &str) -> Result<bool> {
    if ctx.platform.member(ctx.guild_id(), member_id).await?.is_none() {
        return Ok(false);
    }

    info!(guild_id = %ctx.guild_id(), member_id = %member_id, "Kicking banned member");
    match ctx
        .platform
        .kick_member(ctx.guild_id(), member_id, KICK_REASON)
        .await
    {
        Err(e) if !e.is_not_found() => return Err(e),
        _ => {}
    }
    member_update::leave_guild(ctx, member_id).await?;
    Ok(true)
}

/// Kick the member if their user record carries the ban flag
pub async fn kick_if_banned(ctx: &GuildContext, member_id: &str) -> Result<bool> {
    let user = ctx.db.find_or_create_user(member_id, None).await?;
    if !user.banned {
        return Ok(false);
    }
    kick(ctx, member_id).await
}

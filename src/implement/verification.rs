//! Verification implement: the guild's "verified" role

use tracing::info;

use crate::db::{GuildStorageDoc, VerificationImplement};
use crate::guild::GuildContext;
use crate::models::VERIFICATION_ROLE_NAME;
use crate::platform::RoleSpec;
use crate::types::Result;

const VERIFICATION_ROLE_COLOR: u32 = 0x3498DB;

fn role_spec() -> RoleSpec {
    RoleSpec {
        name: VERIFICATION_ROLE_NAME.to_string(),
        hoist: true,
        mentionable: false,
        color: VERIFICATION_ROLE_COLOR,
    }
}

async fn create(
    ctx: &GuildContext,
    storage: &mut GuildStorageDoc,
) -> Result<VerificationImplement> {
    let role_id = ctx.platform.create_role(ctx.guild_id(), &role_spec()).await?;
    let implement = VerificationImplement { role_id };
    storage.verification_implement = Some(implement.clone());
    ctx.db.save_guild_storage(storage).await?;

    info!(guild_id = %ctx.guild_id(), role_id = %implement.role_id, "Created verification role");
    Ok(implement)
}

pub async fn get_or_create(
    ctx: &GuildContext,
    storage: &mut GuildStorageDoc,
) -> Result<VerificationImplement> {
    match &storage.verification_implement {
        Some(existing) => Ok(existing.clone()),
        None => create(ctx, storage).await,
    }
}

/// Create the role when it is missing or no longer resolves
pub async fn guarantee(ctx: &GuildContext, storage: &mut GuildStorageDoc) -> Result<usize> {
    if !ctx.config.verification_enabled {
        return Ok(0);
    }
    if let Some(existing) = &storage.verification_implement {
        if ctx
            .platform
            .role(ctx.guild_id(), &existing.role_id)
            .await?
            .is_some()
        {
            return Ok(0);
        }
    }
    create(ctx, storage).await?;
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::guild::testing::*;

    #[tokio::test]
    async fn test_guarantee_is_idempotent() {
        let f = fixture(50);
        let mut storage = f.db.guild_storage(GUILD).await.unwrap();

        assert_eq!(guarantee(&f.ctx, &mut storage).await.unwrap(), 1);
        assert_eq!(guarantee(&f.ctx, &mut storage).await.unwrap(), 0);
        let first = storage.verification_implement.clone().unwrap();
        assert_eq!(get_or_create(&f.ctx, &mut storage).await.unwrap(), first);

        f.platform.delete_role_externally(GUILD, &first.role_id).await;
        assert_eq!(guarantee(&f.ctx, &mut storage).await.unwrap(), 1);
        let stored = f.db.guild_storage(GUILD).await.unwrap();
        assert_ne!(stored.verification_implement.unwrap().role_id, first.role_id);
        assert_eq!(f.platform.role_named(GUILD, "verified").await.len(), 1);
    }
}

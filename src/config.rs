//! Configuration for StudyBot
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::collections::HashSet;
use std::time::Duration;

use crate::bot::BotOptions;
use crate::guild::GuildConfig;
use crate::models::{Major, SWAP_MARGIN};

/// StudyBot - course and verification resource manager
#[derive(Parser, Debug, Clone)]
#[command(name = "studybot")]
#[command(about = "Course and verification resource manager for university community guilds")]
pub struct Args {
    /// Bot token for the platform REST API
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    pub discord_token: String,

    /// Platform REST API base URL
    #[arg(long, env = "DISCORD_API_URL", default_value = "https://discord.com/api/v10")]
    pub discord_api_url: String,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "studybot")]
    pub mongodb_db: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Fixed delay between platform mutations and between queued tasks
    #[arg(long, env = "RATE_LIMIT_MS", default_value = "1000")]
    pub rate_limit_ms: u64,

    /// Hard platform limit of channels per category
    #[arg(long, env = "MAX_CHANNELS_PER_CATEGORY", default_value = "50")]
    pub max_channels_per_category: usize,

    /// Seconds between reconciliation passes (0 = only at startup)
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value = "0")]
    pub reconcile_interval_secs: u64,

    /// Days an assignment survives a reset after its last update
    #[arg(long, env = "RESET_GRACE_DAYS", default_value = "30")]
    pub reset_grace_days: i64,

    /// Run the daily semester reset check
    #[arg(long, env = "SEMESTER_RESET", default_value = "false")]
    pub semester_reset: bool,

    /// Managed guilds: `guildId:major,major[:moderatorRoleId]`, separated by `;`
    #[arg(long, env = "GUILDS")]
    pub guilds: String,

    /// Manage the verification role and gate
    #[arg(long, env = "VERIFICATION_ENABLED", default_value = "true")]
    pub verification_enabled: bool,
}

impl Args {
    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    /// `None` when only the startup pass should run
    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }

    pub fn bot_options(&self) -> BotOptions {
        BotOptions {
            max_children: self.max_channels_per_category,
            rate_limit: self.rate_limit(),
            reset_grace_days: self.reset_grace_days,
        }
    }

    /// Parse the guild list
    pub fn guild_configs(&self) -> Result<Vec<GuildConfig>, String> {
        let mut configs = parse_guilds(&self.guilds)?;
        for config in &mut configs {
            config.verification_enabled = self.verification_enabled;
        }
        Ok(configs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.discord_token.trim().is_empty() {
            return Err("DISCORD_TOKEN must not be empty".to_string());
        }

        let configs = self.guild_configs()?;
        if configs.is_empty() {
            return Err("GUILDS must name at least one guild".to_string());
        }
        let mut seen = HashSet::new();
        for config in &configs {
            if !seen.insert(config.guild_id.as_str()) {
                return Err(format!("guild {} is configured twice", config.guild_id));
            }
        }

        if self.max_channels_per_category == 0 {
            return Err("MAX_CHANNELS_PER_CATEGORY must be greater than 0".to_string());
        }
        if self.max_channels_per_category <= SWAP_MARGIN {
            return Err(format!(
                "MAX_CHANNELS_PER_CATEGORY must be larger than the swap margin ({})",
                SWAP_MARGIN
            ));
        }

        if self.reset_grace_days < 0 {
            return Err("RESET_GRACE_DAYS must not be negative".to_string());
        }

        Ok(())
    }
}

/// Parse `guildId:major,major[:moderatorRoleId]` entries separated by `;`
pub fn parse_guilds(raw: &str) -> Result<Vec<GuildConfig>, String> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_guild)
        .collect()
}

fn parse_guild(entry: &str) -> Result<GuildConfig, String> {
    let mut parts = entry.split(':').map(str::trim);
    let guild_id = parts
        .next()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| format!("missing guild ID in '{}'", entry))?;

    let majors: Vec<Major> = parts
        .next()
        .unwrap_or_default()
        .split(',')
        .map(|prefix| prefix.trim().to_lowercase())
        .filter(|prefix| !prefix.is_empty())
        .map(Major::new)
        .collect();
    if majors.is_empty() {
        return Err(format!("guild {} has no majors", guild_id));
    }

    let moderator_role_id = parts.next().filter(|id| !id.is_empty()).map(str::to_string);
    if parts.next().is_some() {
        return Err(format!("too many fields in '{}'", entry));
    }

    let mut config = GuildConfig::new(guild_id, majors);
    config.moderator_role_id = moderator_role_id;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_for(guilds: &str, extra: &[&str]) -> Args {
        let mut argv = vec!["studybot", "--discord-token", "t", "--guilds", guilds];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    fn args(extra: &[&str]) -> Args {
        args_for("g1:cs,math", extra)
    }

    #[test]
    fn test_parse_guilds() {
        let configs = parse_guilds("g1:cs, Math:mods ; g2:ece").unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].guild_id, "g1");
        assert_eq!(configs[0].majors, vec![Major::new("cs"), Major::new("math")]);
        assert_eq!(configs[0].moderator_role_id.as_deref(), Some("mods"));
        assert_eq!(configs[1].moderator_role_id, None);

        assert!(parse_guilds("g1").is_err());
        assert!(parse_guilds(":cs").is_err());
        assert!(parse_guilds("g1:cs:mods:extra").is_err());
    }

    #[test]
    fn test_defaults() {
        let args = args(&[]);
        assert!(args.validate().is_ok());
        assert_eq!(args.rate_limit(), Duration::from_millis(1000));
        assert_eq!(args.reconcile_interval(), None);
        assert_eq!(args.bot_options().max_children, 50);
        assert!(args.guild_configs().unwrap()[0].verification_enabled);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(args(&["--max-channels-per-category", "0"]).validate().is_err());
        assert!(args(&["--max-channels-per-category", "2"]).validate().is_err());
        assert!(args(&["--max-channels-per-category", "3"]).validate().is_ok());
        assert!(args_for("g1:cs;g1:math", &[]).validate().is_err());
        assert!(args_for(" ; ", &[]).validate().is_err());
    }
}

//! StudyBot - course and verification resource manager

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use studybot::{
    config::Args,
    db::{MongoClient, MongoDatabase},
    platform::{DiscordHttp, DiscordHttpConfig, Paced},
    services::EmptyCatalog,
    StudyBot,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("studybot={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }
    let guilds = args.guild_configs().map_err(anyhow::Error::msg)?;

    info!("======================================");
    info!("  StudyBot");
    info!("======================================");
    info!("Platform API: {}", args.discord_api_url);
    info!("MongoDB: {}", args.mongodb_uri);
    info!("Guilds: {}", guilds.len());
    for guild in &guilds {
        let majors: Vec<&str> = guild.majors.iter().map(|m| m.prefix.as_str()).collect();
        info!("  {}: {}", guild.guild_id, majors.join(", "));
    }
    info!("Rate limit: {}ms", args.rate_limit_ms);
    info!("Channels per category: {}", args.max_channels_per_category);
    info!("======================================");

    let mongo = MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await?;
    let db = Arc::new(MongoDatabase::new(&mongo).await?);
    info!("MongoDB connected successfully");

    let http = DiscordHttp::connect(DiscordHttpConfig::new(
        args.discord_api_url.clone(),
        args.discord_token.clone(),
    ))
    .await?;
    let platform = Arc::new(Paced::new(http, args.rate_limit()));

    let bot = Arc::new(StudyBot::new(
        platform,
        db,
        Arc::new(EmptyCatalog),
        guilds,
        args.bot_options(),
    ));

    for report in bot.run_reconciliation_all().await {
        if !report.is_clean() {
            info!(run_id = %report.run_id, failures = report.failures, "Startup reconciliation repaired drift");
        }
    }

    if let Some(interval) = args.reconcile_interval() {
        info!("Reconciling every {}s", interval.as_secs());
        bot.spawn_periodic_reconciliation(interval);
    }
    if args.semester_reset {
        bot.spawn_semester_schedule();
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

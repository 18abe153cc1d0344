//! Shared error type and identifier aliases

use thiserror::Error;

/// Platform snowflake of a guild
pub type GuildId = String;
/// Platform snowflake of a guild member (same as the user ID)
pub type MemberId = String;
/// Platform snowflake of a role
pub type RoleId = String;
/// Platform snowflake of a channel or container
pub type ChannelId = String;

/// Errors surfaced by the bot core
#[derive(Debug, Error)]
pub enum BotError {
    /// Platform call failed (network, rate limit, permissions)
    #[error("platform error: {0}")]
    Platform(String),

    /// A referenced platform object or document does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Document store failure
    #[error("database error: {0}")]
    Database(String),

    /// The platform refused to create more containers or children
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The guild queue dropped a task before it completed
    #[error("queue error: {0}")]
    Queue(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BotError {
    /// Whether this error means the referenced object no longer resolves
    pub fn is_not_found(&self) -> bool {
        matches!(self, BotError::NotFound(_))
    }
}

impl From<mongodb::error::Error> for BotError {
    fn from(e: mongodb::error::Error) -> Self {
        BotError::Database(e.to_string())
    }
}

impl From<bson::ser::Error> for BotError {
    fn from(e: bson::ser::Error) -> Self {
        BotError::Database(format!("serialization failed: {}", e))
    }
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s.as_u16()) == Some(404) {
            BotError::NotFound(e.to_string())
        } else {
            BotError::Platform(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;

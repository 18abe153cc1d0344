//! Database schemas
//!
//! MongoDB document structures for users and guild storage.

mod guild_storage;
mod metadata;
mod user;

pub use guild_storage::{
    CourseImplement, GuildStorageDoc, MajorImplement, VerificationImplement,
    GUILD_STORAGE_COLLECTION,
};
pub use metadata::Metadata;
pub use user::{CourseAssignment, UserDoc, UserGuildData, USER_COLLECTION};

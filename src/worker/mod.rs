//! Background execution
//!
//! All mutations of a guild go through that guild's queue in [`queue`].

pub mod queue;

pub use queue::{GuildQueues, TaskHandle, TaskLabel};

//! StudyBot - course and verification resource manager
//!
//! Keeps the roles, channels and containers of a university community guild
//! in line with what its members signed up for.
//!
//! ## Components
//!
//! - **Implements**: per-course roles and channels, per-major containers and
//!   the verification role, created on demand and repaired when they drift
//! - **Rebalancer**: keeps course channels sorted across containers without
//!   ever exceeding the platform's per-container limit
//! - **Role diff**: minimal role changes that bring a member in line with
//!   their stored assignments
//! - **Guild queues**: one serialized mutation queue per guild
//! - **Reconciler**: periodic repair of everything above

pub mod bot;
pub mod config;
pub mod db;
pub mod guild;
pub mod implement;
pub mod models;
pub mod platform;
pub mod services;
pub mod types;
pub mod worker;

pub use bot::{BotOptions, StudyBot};
pub use config::Args;
pub use types::{BotError, Result};

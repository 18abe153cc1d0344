//! Business services
//!
//! Everything here operates on one guild through a [`crate::guild::GuildContext`]
//! and expects to run inside that guild's mutation queue.

pub mod ban;
pub mod catalog;
pub mod health;
pub mod member_update;
pub mod reset;
pub mod role_diff;

pub use catalog::{CourseCatalog, EmptyCatalog, StaticCatalog};
pub use health::{ReconciliationReport, Reconciler};
pub use member_update::{AssignmentChange, VerifyOutcome};
pub use reset::Semester;
pub use role_diff::RoleDiff;

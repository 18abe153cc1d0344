//! Course assignment resets
//!
//! Members who did not touch their course list for a while lose their
//! assignments, either on demand or at the start of each semester.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Utc};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use super::member_update;
use crate::guild::GuildContext;
use crate::types::{MemberId, Result};

/// Unassign all courses from every member whose assignments are older than
/// the grace period. Returns the number of members reset.
pub async fn reset_assignments(
    ctx: &GuildContext,
    grace_days: i64,
    now: DateTime<Utc>,
) -> Result<usize> {
    let cutoff = now - ChronoDuration::days(grace_days);
    let stale: Vec<MemberId> = ctx
        .db
        .users_in_guild(ctx.guild_id())
        .await?
        .into_iter()
        .filter(|u| {
            u.guild(ctx.guild_id())
                .is_some_and(|g| !g.courses.is_empty() && g.courses_last_updated < cutoff)
        })
        .map(|u| u.member_id)
        .collect();

    let members = ctx.platform.members(ctx.guild_id()).await?;
    let present: Vec<MemberId> = stale
        .iter()
        .filter(|id| members.iter().any(|m| &&m.id == id))
        .cloned()
        .collect();
    if present.len() != stale.len() {
        warn!(
            guild_id = %ctx.guild_id(),
            stale = stale.len(),
            present = present.len(),
            "Some members to reset are no longer in the guild"
        );
    }

    info!(guild_id = %ctx.guild_id(), count = present.len(), grace_days, "Resetting course assignments");
    member_update::unassign_all_many(ctx, &present).await
}

/// Semester whose start triggers a reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semester {
    Spring,
    Summer,
    Fall,
}

impl Semester {
    /// (month, day) of each semester reset
    const RESET_DATES: [(u32, u32, Semester); 3] = [
        (1, 5, Semester::Spring),
        (5, 17, Semester::Summer),
        (8, 18, Semester::Fall),
    ];

    /// The semester starting on `date`, if any
    pub fn starting_on(date: NaiveDate) -> Option<Semester> {
        Self::RESET_DATES
            .iter()
            .find(|(month, day, _)| date.month() == *month && date.day() == *day)
            .map(|(_, _, semester)| *semester)
    }
}

impl fmt::Display for Semester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Semester::Spring => "spring",
            Semester::Summer => "summer",
            Semester::Fall => "fall",
        })
    }
}

/// Hour of day (UTC) the daily semester check runs
pub const SEMESTER_CHECK_HOUR: u32 = 12;

/// How long to wait from `now` until the next daily check
pub fn until_next_check(now: DateTime<Utc>) -> Duration {
    let check_time = NaiveTime::from_hms_opt(SEMESTER_CHECK_HOUR, 0, 0).unwrap_or(NaiveTime::MIN);
    let today = Utc.from_utc_datetime(&now.date_naive().and_time(check_time));
    let next = if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

/// Run the semester reset when `now` is a semester start. Returns the
/// semester and the number of members reset.
pub async fn check_semester_reset(
    ctx: &GuildContext,
    grace_days: i64,
    now: DateTime<Utc>,
) -> Result<Option<(Semester, usize)>> {
    let Some(semester) = Semester::starting_on(now.date_naive()) else {
        info!(guild_id = %ctx.guild_id(), "No semester reset today");
        return Ok(None);
    };

    info!(guild_id = %ctx.guild_id(), semester = %semester, "Semester reset initiated");
    let count = reset_assignments(ctx, grace_days, now).await?;
    info!(guild_id = %ctx.guild_id(), semester = %semester, count, "Semester reset complete");
    Ok(Some((semester, count)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, UserDoc};
    use crate::guild::testing::*;

    #[test]
    fn test_semester_dates() {
        let date = |m, d| NaiveDate::from_ymd_opt(2026, m, d).unwrap();
        assert_eq!(Semester::starting_on(date(1, 5)), Some(Semester::Spring));
        assert_eq!(Semester::starting_on(date(5, 17)), Some(Semester::Summer));
        assert_eq!(Semester::starting_on(date(8, 18)), Some(Semester::Fall));
        assert_eq!(Semester::starting_on(date(12, 16)), None);
    }

    #[test]
    fn test_until_next_check() {
        let morning = Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap();
        assert_eq!(until_next_check(morning), Duration::from_secs(3600));
        let evening = Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap();
        assert_eq!(until_next_check(evening), Duration::from_secs(23 * 3600));
    }

    #[tokio::test]
    async fn test_reset_respects_grace_period() {
        let f = fixture(50);
        let now = Utc::now();

        for (id, age_days) in [("old", 40), ("fresh", 5)] {
            f.platform.add_member(GUILD, id, &[]).await;
            let mut user = UserDoc::new(id);
            user.add_courses(GUILD, &["cs-1000".to_string()]);
            user.guild_mut(GUILD).courses_last_updated = now - ChronoDuration::days(age_days);
            f.db.insert_user(user).await;
        }

        assert_eq!(reset_assignments(&f.ctx, 30, now).await.unwrap(), 1);
        assert!(!f.db.find_user("old").await.unwrap().unwrap().has_courses(GUILD));
        assert!(f.db.find_user("fresh").await.unwrap().unwrap().has_courses(GUILD));
    }

    #[tokio::test]
    async fn test_semester_check_only_on_dates() {
        let f = fixture(50);
        let plain_day = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert!(check_semester_reset(&f.ctx, 30, plain_day).await.unwrap().is_none());

        let fall = Utc.with_ymd_and_hms(2026, 8, 18, 12, 0, 0).unwrap();
        assert_eq!(
            check_semester_reset(&f.ctx, 30, fall).await.unwrap(),
            Some((Semester::Fall, 0))
        );
    }
}

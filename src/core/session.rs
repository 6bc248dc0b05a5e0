//! Broker-timezone clock arithmetic for daily resets and session dates.
//!
//! Business-day boundaries are never computed in UTC: the session date
//! rolls at the configured reset time in the configured timezone, and
//! lockout-until-reset targets the next such instant.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    pub reset_time: NaiveTime,
    pub tz: Tz,
}

impl SessionClock {
    pub fn new(reset_time: NaiveTime, tz: Tz) -> Self {
        Self { reset_time, tz }
    }

    pub fn from_config(reset_time: &str, timezone: &str) -> Result<Self> {
        let reset_time = parse_clock_time(reset_time)
            .with_context(|| format!("invalid reset time {reset_time:?}"))?;
        let tz: Tz = timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid timezone {timezone:?}: {e}"))?;
        Ok(Self::new(reset_time, tz))
    }

    /// The session date `now` belongs to. Past the reset time the session
    /// already belongs to the next calendar day.
    pub fn session_date(&self, now: DateTime<Utc>) -> NaiveDate {
        let local = now.with_timezone(&self.tz);
        if local.time() >= self.reset_time {
            local.date_naive() + Duration::days(1)
        } else {
            local.date_naive()
        }
    }

    /// The next reset instant strictly after `now`.
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.tz);
        let mut date = local.date_naive();
        if local.time() >= self.reset_time {
            date += Duration::days(1);
        }
        self.resolve_local(date)
    }

    /// Resolve a local wall-clock instant on `date`, tolerating DST gaps.
    fn resolve_local(&self, date: NaiveDate) -> DateTime<Utc> {
        let naive = date.and_time(self.reset_time);
        match self.tz.from_local_datetime(&naive) {
            chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(first, _) => first.with_timezone(&Utc),
            // Skipped by a DST jump: shift an hour forward.
            chrono::LocalResult::None => {
                let shifted = naive + Duration::hours(1);
                self.tz
                    .from_local_datetime(&shifted)
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
            }
        }
    }

    pub fn local_date_string(&self, now: DateTime<Utc>) -> String {
        now.with_timezone(&self.tz)
            .date_naive()
            .format("%Y-%m-%d")
            .to_string()
    }
}

pub fn parse_clock_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

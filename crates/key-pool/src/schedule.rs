//! Daily quota reset boundary
//!
//! Quotas roll over at a fixed wall-clock time in the provider's timezone.
//! The zone is an IANA name, so the boundary follows daylight saving: midnight
//! Pacific is 08:00 UTC in winter and 07:00 UTC in summer.

use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};

/// A daily reset instant: `at` wall-clock time in `zone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSchedule {
    zone: Tz,
    at: NaiveTime,
}

impl Default for ResetSchedule {
    /// Midnight in America/Los_Angeles.
    fn default() -> Self {
        Self {
            zone: chrono_tz::America::Los_Angeles,
            at: NaiveTime::MIN,
        }
    }
}

impl ResetSchedule {
    pub fn new(zone: Tz, at: NaiveTime) -> Self {
        Self { zone, at }
    }

    /// Parse a zone like `America/Los_Angeles` and a time of day like `00:00`.
    pub fn parse(zone: &str, at: &str) -> Result<Self> {
        let zone: Tz = zone
            .trim()
            .parse()
            .map_err(|e| Error::Schedule(format!("timezone {zone:?}: {e}")))?;
        let at = NaiveTime::parse_from_str(at.trim(), "%H:%M")
            .map_err(|e| Error::Schedule(format!("reset time {at:?}: {e}")))?;
        Ok(Self { zone, at })
    }

    /// First reset boundary strictly after `now`.
    pub fn next_reset_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.with_timezone(&self.zone).date_naive();
        (0..=2)
            .filter_map(|days| today.checked_add_days(Days::new(days)))
            .filter_map(|date| self.boundary_on(date))
            .find(|boundary| *boundary > now)
            .unwrap_or_else(|| now + TimeDelta::days(1))
    }

    /// Time remaining until the next boundary.
    pub fn until_next(&self, now: DateTime<Utc>) -> Duration {
        (self.next_reset_after(now) - now)
            .to_std()
            .unwrap_or_default()
    }

    /// The boundary on a local date. A time repeated by a DST fall-back takes
    /// its first occurrence; a time skipped by spring-forward moves an hour
    /// later.
    fn boundary_on(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        let local = date.and_time(self.at);
        self.zone
            .from_local_datetime(&local)
            .earliest()
            .or_else(|| {
                self.zone
                    .from_local_datetime(&(local + TimeDelta::hours(1)))
                    .earliest()
            })
            .map(|boundary| boundary.with_timezone(&Utc))
    }
}

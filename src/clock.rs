//! Day boundary clock.
//!
//! Every timestamp belongs to exactly one [`DayId`]. A day `D` covers the half-open window
//! `[D 10:00 UTC, D+1 10:00 UTC)`, so anything before the boundary on a calendar date still belongs
//! to the previous day.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::DAY_BOUNDARY_HOUR_UTC;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct DayId(pub NaiveDate);

const BOUNDARY_OFFSET: TimeDelta = TimeDelta::hours(DAY_BOUNDARY_HOUR_UTC as i64);

/// Maps `now` onto its canonical day bucket.
pub fn day_id(now: DateTime<Utc>) -> DayId {
    DayId((now - BOUNDARY_OFFSET).date_naive())
}

/// First boundary instant strictly after `now`.
pub fn next_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    day_id(now).ends_at()
}

impl DayId {
    pub fn starts_at(&self) -> DateTime<Utc> {
        let boundary = NaiveTime::from_hms_opt(DAY_BOUNDARY_HOUR_UTC, 0, 0).unwrap_or(NaiveTime::MIN);
        self.0.and_time(boundary).and_utc()
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.next().starts_at()
    }

    pub fn next(&self) -> DayId {
        DayId(self.0.checked_add_days(Days::new(1)).unwrap_or(self.0))
    }

    pub fn prev(&self) -> DayId {
        DayId(self.0.checked_sub_days(Days::new(1)).unwrap_or(self.0))
    }

    /// Whole days from `self` forward to `later`; negative when `later` is in the past.
    pub fn days_until(&self, later: DayId) -> i64 {
        (later.0 - self.0).num_days()
    }

    /// Day count since the unix epoch, used for deterministic rotations.
    pub fn ordinal(&self) -> i64 {
        self.0.signed_duration_since(NaiveDate::default()).num_days()
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.starts_at() && t < self.ends_at()
    }
}

impl fmt::Display for DayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for DayId {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DayId(NaiveDate::parse_from_str(s, "%Y-%m-%d")?))
    }
}

impl From<NaiveDate> for DayId {
    fn from(value: NaiveDate) -> Self {
        DayId(value)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use chrono::TimeZone;

    pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    pub fn day(y: i32, m: u32, d: u32) -> DayId {
        DayId(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn test_same_window_same_day() {
        let window = [
            at(2025, 3, 14, 10, 0),
            at(2025, 3, 14, 17, 45),
            at(2025, 3, 14, 23, 59),
            at(2025, 3, 15, 0, 0),
            at(2025, 3, 15, 9, 59),
        ];

        for t in window {
            assert_eq!(day_id(t), day(2025, 3, 14), "{t}");
        }
    }

    #[test]
    fn test_boundary_changes_day_exactly_once() {
        let before = at(2025, 3, 15, 9, 59);
        let boundary = at(2025, 3, 15, 10, 0);

        assert_eq!(day_id(before).next(), day_id(boundary));
        assert_eq!(day_id(boundary), day_id(at(2025, 3, 16, 9, 59)));

        let mut changes = 0;
        let mut last = day_id(at(2025, 3, 15, 0, 0));
        for minute in 0..24 * 60 {
            let t = at(2025, 3, 15, 0, 0) + TimeDelta::minutes(minute);
            if day_id(t) != last {
                changes += 1;
                last = day_id(t);
            }
        }
        assert_eq!(changes, 1);
    }

    #[test]
    fn test_window_edges() {
        let d = day(2024, 12, 31);
        assert_eq!(d.starts_at(), at(2024, 12, 31, 10, 0));
        assert_eq!(d.ends_at(), at(2025, 1, 1, 10, 0));
        assert!(d.contains(at(2025, 1, 1, 9, 59)));
        assert!(!d.contains(at(2025, 1, 1, 10, 0)));
        assert_eq!(next_boundary(at(2025, 1, 1, 9, 0)), at(2025, 1, 1, 10, 0));
        assert_eq!(next_boundary(at(2025, 1, 1, 10, 0)), at(2025, 1, 2, 10, 0));
    }

    #[test]
    fn test_day_arithmetic_and_format() {
        let d = day(2025, 2, 28);
        assert_eq!(d.next(), day(2025, 3, 1));
        assert_eq!(d.next().prev(), d);
        assert_eq!(d.days_until(day(2025, 3, 3)), 3);
        assert_eq!(d.to_string(), "2025-02-28");
        assert_eq!("2025-02-28".parse::<DayId>().unwrap(), d);
        assert_eq!(d.next().ordinal() - d.ordinal(), 1);
    }
}

//! Daily reset clock and the offset to its next occurrence.
//!
//! Usage quotas expire and recurring schedules fire at a fixed time-of-day.
//! Both need the same question answered: *how long until the next reset?*
//!
//! The math is done on local wall-clock time (`NaiveDateTime`), so a reset at
//! `03:00` always lands on `03:00` on the wall clock, and "now equals the
//! reset time" yields a full day rather than zero.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// One day, the upper bound of any reset offset.
pub const FULL_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Accepted input layouts, tried in order.
const LAYOUTS: [&str; 3] = ["%I:%M%p", "%I:%M %p", "%H:%M"];

/// Time-of-day (hour and minute) at which a daily cycle restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResetClock(NaiveTime);

impl ResetClock {
    /// Build a reset clock from a 24-hour `hour` and `minute`.
    pub fn new(hour: u32, minute: u32) -> CoreResult<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(Self)
            .ok_or_else(|| CoreError::invalid_reset_clock(format!("{hour:02}:{minute:02}")))
    }

    /// Parse `3:00AM`, `11:30 PM` or `23:30`.
    pub fn parse(input: &str) -> CoreResult<Self> {
        let trimmed = input.trim();
        let time = LAYOUTS
            .iter()
            .find_map(|layout| NaiveTime::parse_from_str(trimmed, layout).ok())
            .ok_or_else(|| CoreError::invalid_reset_clock(input))?;

        Self::new(time.hour(), time.minute())
    }

    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    pub fn minute(&self) -> u32 {
        self.0.minute()
    }

    pub fn time(&self) -> NaiveTime {
        self.0
    }

    /// Offset from `now` until the next occurrence of this clock.
    pub fn offset_from(&self, now: NaiveDateTime) -> Duration {
        compute_reset_offset(now, *self)
    }
}

impl fmt::Display for ResetClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%-I:%M%p"))
    }
}

impl FromStr for ResetClock {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResetClock {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResetClock> for String {
    fn from(clock: ResetClock) -> Self {
        clock.to_string()
    }
}

/// Time remaining until the next `reset` strictly after `now`.
///
/// - `now` before the reset time-of-day: the reset happens later today.
/// - `now` at or after it: the reset happens on the following calendar day.
///
/// The result is always in `(0, 24h]` and `now + offset` has the reset's
/// time-of-day.
pub fn compute_reset_offset(now: NaiveDateTime, reset: ResetClock) -> Duration {
    let today = now.date().and_time(reset.time());

    let next = if now < today {
        Some(today)
    } else {
        today.checked_add_signed(TimeDelta::days(1))
    };

    next.and_then(|next| (next - now).to_std().ok())
        .unwrap_or(FULL_DAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 9, 14)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn hm(hours: u64, minutes: u64) -> Duration {
        Duration::from_secs(hours * 3600 + minutes * 60)
    }

    #[test]
    fn offset_table() {
        let three = ResetClock::parse("3:00AM").unwrap();
        let three_thirty = ResetClock::parse("3:30AM").unwrap();

        let cases = [
            (at(5, 30), three, hm(21, 30)),
            (at(14, 0), three, hm(13, 0)),
            (at(23, 0), three, hm(4, 0)),
            (at(1, 0), three, hm(2, 0)),
            (at(0, 0), three, hm(3, 0)),
            (at(4, 0), three, hm(23, 0)),
            (at(3, 0), three, hm(24, 0)),
            (at(2, 59), three, hm(0, 1)),
            (at(3, 1), three, hm(23, 59)),
            (at(3, 1), three_thirty, hm(0, 29)),
        ];

        for (now, reset, want) in cases {
            assert_eq!(
                compute_reset_offset(now, reset),
                want,
                "now={now} reset={reset}"
            );
        }
    }

    #[test]
    fn sub_minute_precision_lands_on_reset() {
        let reset = ResetClock::new(3, 0).unwrap();
        let now = at(2, 59) + TimeDelta::seconds(30);

        assert_eq!(compute_reset_offset(now, reset), Duration::from_secs(30));
    }

    #[test]
    fn offset_crosses_month_end() {
        let reset = ResetClock::new(3, 0).unwrap();
        let now = NaiveDate::from_ymd_opt(2023, 12, 31)
            .unwrap()
            .and_hms_opt(22, 0, 0)
            .unwrap();

        assert_eq!(compute_reset_offset(now, reset), hm(5, 0));
    }

    #[test]
    fn parses_kitchen_and_24h_layouts() {
        assert_eq!(ResetClock::parse("3:00AM").unwrap(), ResetClock::new(3, 0).unwrap());
        assert_eq!(ResetClock::parse("11:30 PM").unwrap(), ResetClock::new(23, 30).unwrap());
        assert_eq!(ResetClock::parse("12:00AM").unwrap(), ResetClock::new(0, 0).unwrap());
        assert_eq!(ResetClock::parse(" 07:15 ").unwrap(), ResetClock::new(7, 15).unwrap());
    }

    #[test]
    fn rejects_garbage_and_out_of_range() {
        assert!(matches!(
            ResetClock::parse("tomorrow"),
            Err(CoreError::InvalidResetClock(_))
        ));
        assert!(ResetClock::new(24, 0).is_err());
        assert!(ResetClock::new(3, 60).is_err());
    }

    #[test]
    fn display_uses_kitchen_layout() {
        assert_eq!(ResetClock::new(15, 4).unwrap().to_string(), "3:04PM");
        assert_eq!(ResetClock::new(0, 5).unwrap().to_string(), "12:05AM");
    }

    #[test]
    fn serde_round_trips_through_string() {
        let clock: ResetClock = serde_json::from_str("\"3:00AM\"").unwrap();
        assert_eq!(clock, ResetClock::new(3, 0).unwrap());
        assert_eq!(serde_json::to_string(&clock).unwrap(), "\"3:00AM\"");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            ..ProptestConfig::default()
        })]

        /// Property: the offset is within (0, 24h] and lands on the reset time-of-day.
        #[test]
        fn offset_is_bounded_and_lands_on_reset(
            day in 0u32..365,
            secs in 0u32..86_400,
            reset_hour in 0u32..24,
            reset_minute in 0u32..60,
        ) {
            let now = NaiveDate::from_yo_opt(2024, day + 1)
                .unwrap()
                .and_hms_opt(secs / 3600, (secs / 60) % 60, secs % 60)
                .unwrap();
            let reset = ResetClock::new(reset_hour, reset_minute).unwrap();

            let offset = compute_reset_offset(now, reset);
            prop_assert!(offset > Duration::ZERO);
            prop_assert!(offset <= FULL_DAY);

            let landed = now + TimeDelta::from_std(offset).unwrap();
            prop_assert_eq!(landed.time(), reset.time());
        }
    }
}

//! Calendar arithmetic for statistic windows
//!
//! Every window is described by a [`Cadence`]. For a timestamp the
//! [`WindowClock`] reports the length of the cadence instance the timestamp
//! falls in and how far into that instance the timestamp sits, both in
//! minutes. Seconds are ignored. Variable-length cadences (monthly, quarterly,
//! yearly) are computed from the calendar of the timestamp itself, so February
//! of a leap year is 29 days long.

use std::{fmt, str::FromStr};

use chrono::{Datelike, NaiveDateTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};

const MINUTES_PER_HOUR: u64 = 60;
const MINUTES_PER_DAY: u64 = 1_440;

/// Errors produced by [`Cadence`] parsing
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The cadence name is not one this crate understands
    #[error("Unsupported cadence '{0}', valid values are: {VALID_NAMES}")]
    UnsupportedCadence(String),
}

const VALID_NAMES: &str = "half_hourly, hourly, 2hourly, 3hourly, 6hourly, 12hourly, daily, \
                           daily_noon, weekly, monthly, 3monthly, yearly, continuous";

/// A calendar period over which a statistic or an output file is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cadence {
    /// Thirty minutes, aligned to :00 and :30
    #[serde(rename = "half_hourly")]
    HalfHourly,
    /// One hour
    #[serde(rename = "hourly")]
    Hourly,
    /// Two hours, aligned to midnight
    #[serde(rename = "2hourly")]
    TwoHourly,
    /// Three hours, aligned to midnight
    #[serde(rename = "3hourly")]
    ThreeHourly,
    /// Six hours, aligned to midnight
    #[serde(rename = "6hourly")]
    SixHourly,
    /// Twelve hours, aligned to midnight
    #[serde(rename = "12hourly")]
    TwelveHourly,
    /// One day, midnight to midnight
    #[serde(rename = "daily")]
    Daily,
    /// One day, noon to noon
    #[serde(rename = "daily_noon")]
    DailyNoon,
    /// One week, starting on Monday
    #[serde(rename = "weekly")]
    Weekly,
    /// One calendar month
    #[serde(rename = "monthly")]
    Monthly,
    /// One calendar quarter, starting January, April, July or October
    #[serde(rename = "3monthly")]
    Quarterly,
    /// One calendar year
    #[serde(rename = "yearly")]
    Yearly,
    /// Open-ended accumulation that never resets
    #[serde(rename = "continuous")]
    Continuous,
}

impl Cadence {
    /// The configuration name of this cadence
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Cadence::HalfHourly => "half_hourly",
            Cadence::Hourly => "hourly",
            Cadence::TwoHourly => "2hourly",
            Cadence::ThreeHourly => "3hourly",
            Cadence::SixHourly => "6hourly",
            Cadence::TwelveHourly => "12hourly",
            Cadence::Daily => "daily",
            Cadence::DailyNoon => "daily_noon",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
            Cadence::Quarterly => "3monthly",
            Cadence::Yearly => "yearly",
            Cadence::Continuous => "continuous",
        }
    }

    /// Whether every instance of `self` lies entirely inside one instance of
    /// `outer`.
    ///
    /// Continuous nests in every calendar cadence since it is tracked by the
    /// output cadence. Nothing nests in continuous.
    #[must_use]
    pub fn nests_in(self, outer: Cadence) -> bool {
        use Cadence::{Continuous, Daily, Monthly, Quarterly, Weekly, Yearly};

        match (self, outer) {
            (_, Continuous) => false,
            (Continuous, _) => true,
            _ if self == outer => true,
            (Daily, Weekly | Monthly | Quarterly | Yearly) => true,
            (Monthly, Quarterly | Yearly) | (Quarterly, Yearly) => true,
            _ => match (self.sub_daily_minutes(), outer.sub_daily_minutes()) {
                (Some(inner), Some(outer)) => outer % inner == 0,
                // Every sub-daily block divides twelve hours, so it aligns with
                // both midnight and noon.
                (Some(_), None) => true,
                _ => false,
            },
        }
    }

    fn sub_daily_minutes(self) -> Option<u64> {
        match self {
            Cadence::HalfHourly => Some(30),
            Cadence::Hourly => Some(MINUTES_PER_HOUR),
            Cadence::TwoHourly => Some(2 * MINUTES_PER_HOUR),
            Cadence::ThreeHourly => Some(3 * MINUTES_PER_HOUR),
            Cadence::SixHourly => Some(6 * MINUTES_PER_HOUR),
            Cadence::TwelveHourly => Some(12 * MINUTES_PER_HOUR),
            _ => None,
        }
    }

    /// Strftime pattern matching the resolution of this cadence, used when
    /// naming outputs.
    #[must_use]
    pub fn label_format(self) -> &'static str {
        match self {
            Cadence::HalfHourly | Cadence::Continuous => "%Y_%m_%d_T%H_%M",
            Cadence::Hourly
            | Cadence::TwoHourly
            | Cadence::ThreeHourly
            | Cadence::SixHourly
            | Cadence::TwelveHourly
            | Cadence::DailyNoon => "%Y_%m_%d_T%H",
            Cadence::Daily | Cadence::Weekly => "%Y_%m_%d",
            Cadence::Monthly | Cadence::Quarterly => "%Y_%m",
            Cadence::Yearly => "%Y",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Cadence {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let cadence = match input {
            "half_hourly" => Cadence::HalfHourly,
            "hourly" => Cadence::Hourly,
            "2hourly" => Cadence::TwoHourly,
            "3hourly" => Cadence::ThreeHourly,
            "6hourly" => Cadence::SixHourly,
            "12hourly" => Cadence::TwelveHourly,
            "daily" => Cadence::Daily,
            "daily_noon" => Cadence::DailyNoon,
            "weekly" => Cadence::Weekly,
            "monthly" => Cadence::Monthly,
            "3monthly" | "quarterly" => Cadence::Quarterly,
            "yearly" | "annually" => Cadence::Yearly,
            "continuous" => Cadence::Continuous,
            other => return Err(Error::UnsupportedCadence(other.to_string())),
        };
        Ok(cadence)
    }
}

/// Position of a timestamp inside its cadence instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Length of the cadence instance, minutes
    pub length: u64,
    /// Minutes elapsed since the instance began
    pub offset: u64,
}

impl Span {
    /// First minute of the instance containing `timestamp`
    #[must_use]
    pub fn start(&self, timestamp: NaiveDateTime) -> NaiveDateTime {
        floor_minute(timestamp) - minutes(self.offset)
    }

    /// First minute after the instance containing `timestamp`
    #[must_use]
    pub fn end(&self, timestamp: NaiveDateTime) -> NaiveDateTime {
        self.start(timestamp) + minutes(self.length)
    }
}

/// Converts timestamps into window length and offset for a cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowClock {
    time_step: u64,
    continuous_multiplier: u64,
}

impl WindowClock {
    /// Create a clock for samples `time_step` minutes apart. A continuous
    /// window spans `continuous_multiplier` samples.
    #[must_use]
    pub fn new(time_step: u64, continuous_multiplier: u64) -> Self {
        Self {
            time_step,
            continuous_multiplier,
        }
    }

    /// Length of the cadence instance containing `timestamp` and the offset
    /// of `timestamp` into it, both in minutes.
    #[must_use]
    pub fn minutes_into_window(&self, cadence: Cadence, timestamp: NaiveDateTime) -> Span {
        let hour = u64::from(timestamp.hour());
        let minute = u64::from(timestamp.minute());
        let into_day = hour * MINUTES_PER_HOUR + minute;

        match cadence {
            Cadence::HalfHourly => Span {
                length: 30,
                offset: minute % 30,
            },
            Cadence::Hourly => Span {
                length: MINUTES_PER_HOUR,
                offset: minute,
            },
            Cadence::TwoHourly => n_hourly(2, hour, minute),
            Cadence::ThreeHourly => n_hourly(3, hour, minute),
            Cadence::SixHourly => n_hourly(6, hour, minute),
            Cadence::TwelveHourly => n_hourly(12, hour, minute),
            Cadence::Daily => Span {
                length: MINUTES_PER_DAY,
                offset: into_day,
            },
            Cadence::DailyNoon => Span {
                length: MINUTES_PER_DAY,
                offset: ((hour + 12) % 24) * MINUTES_PER_HOUR + minute,
            },
            Cadence::Weekly => Span {
                length: 7 * MINUTES_PER_DAY,
                offset: u64::from(timestamp.weekday().num_days_from_monday()) * MINUTES_PER_DAY
                    + into_day,
            },
            Cadence::Monthly => Span {
                length: days_in_month(timestamp.year(), timestamp.month()) * MINUTES_PER_DAY,
                offset: u64::from(timestamp.day0()) * MINUTES_PER_DAY + into_day,
            },
            Cadence::Quarterly => {
                let year = timestamp.year();
                let first = (timestamp.month0() / 3) * 3 + 1;
                let length: u64 = (first..first + 3).map(|m| days_in_month(year, m)).sum();
                let elapsed: u64 = (first..timestamp.month())
                    .map(|m| days_in_month(year, m))
                    .sum();
                Span {
                    length: length * MINUTES_PER_DAY,
                    offset: (elapsed + u64::from(timestamp.day0())) * MINUTES_PER_DAY + into_day,
                }
            }
            Cadence::Yearly => Span {
                length: days_in_year(timestamp.year()) * MINUTES_PER_DAY,
                offset: u64::from(timestamp.ordinal0()) * MINUTES_PER_DAY + into_day,
            },
            Cadence::Continuous => Span {
                length: self.time_step * self.continuous_multiplier,
                offset: 0,
            },
        }
    }
}

fn n_hourly(n: u64, hour: u64, minute: u64) -> Span {
    Span {
        length: n * MINUTES_PER_HOUR,
        offset: (hour % n) * MINUTES_PER_HOUR + minute,
    }
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_year(year: i32) -> u64 {
    if is_leap_year(year) { 366 } else { 365 }
}

/// Number of days in `month` (1-based) of `year`
#[must_use]
pub fn days_in_month(year: i32, month: u32) -> u64 {
    match month {
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 31,
    }
}

#[allow(clippy::cast_possible_wrap)]
pub(crate) fn minutes(count: u64) -> TimeDelta {
    TimeDelta::minutes(count as i64)
}

/// Whole minutes from `earlier` to `later`, zero if `later` is not after
/// `earlier`.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn minutes_between(earlier: NaiveDateTime, later: NaiveDateTime) -> u64 {
    let delta = floor_minute(later) - floor_minute(earlier);
    delta.num_minutes().max(0) as u64
}

pub(crate) fn floor_minute(timestamp: NaiveDateTime) -> NaiveDateTime {
    timestamp
        .date()
        .and_hms_opt(timestamp.hour(), timestamp.minute(), 0)
        .unwrap_or(timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn clock() -> WindowClock {
        WindowClock::new(60, 1)
    }

    #[test]
    fn monthly_length_tracks_calendar() {
        let c = clock();
        for (y, m, days) in [
            (2021, 1, 31),
            (2021, 2, 28),
            (2020, 2, 29),
            (2021, 4, 30),
            (1900, 2, 28),
            (2000, 2, 29),
        ] {
            let span = c.minutes_into_window(Cadence::Monthly, at(y, m, 10, 5, 0));
            assert_eq!(span.length, days * 1_440, "{y}-{m}");
        }
    }

    #[test]
    fn monthly_offset_counts_from_first_day() {
        let span = clock().minutes_into_window(Cadence::Monthly, at(2022, 3, 3, 2, 15));
        assert_eq!(span.offset, 2 * 1_440 + 2 * 60 + 15);
    }

    #[test]
    fn quarterly_sums_three_months() {
        let c = clock();
        let q1 = c.minutes_into_window(Cadence::Quarterly, at(2021, 2, 1, 0, 0));
        assert_eq!(q1.length, (31 + 28 + 31) * 1_440);
        assert_eq!(q1.offset, 31 * 1_440);

        let q4 = c.minutes_into_window(Cadence::Quarterly, at(2021, 10, 1, 0, 0));
        assert_eq!(q4.length, (31 + 30 + 31) * 1_440);
        assert_eq!(q4.offset, 0);
    }

    #[test]
    fn n_hourly_offsets_wrap_within_block() {
        let c = clock();
        let span = c.minutes_into_window(Cadence::SixHourly, at(2021, 1, 1, 7, 30));
        assert_eq!(span, Span { length: 360, offset: 90 });
        let span = c.minutes_into_window(Cadence::ThreeHourly, at(2021, 1, 1, 6, 0));
        assert_eq!(span.offset, 0);
    }

    #[test]
    fn daily_noon_starts_at_midday() {
        let c = clock();
        assert_eq!(
            c.minutes_into_window(Cadence::DailyNoon, at(2021, 1, 1, 12, 0))
                .offset,
            0
        );
        assert_eq!(
            c.minutes_into_window(Cadence::DailyNoon, at(2021, 1, 2, 0, 0))
                .offset,
            720
        );
    }

    #[test]
    fn weekly_starts_on_monday() {
        // 2021-01-04 is a Monday
        let span = clock().minutes_into_window(Cadence::Weekly, at(2021, 1, 6, 1, 0));
        assert_eq!(span.offset, 2 * 1_440 + 60);
    }

    #[test]
    fn yearly_handles_leap_years() {
        let c = clock();
        assert_eq!(
            c.minutes_into_window(Cadence::Yearly, at(2020, 12, 31, 0, 0)),
            Span {
                length: 366 * 1_440,
                offset: 365 * 1_440
            }
        );
        assert_eq!(
            c.minutes_into_window(Cadence::Yearly, at(2021, 3, 1, 0, 0))
                .length,
            365 * 1_440
        );
    }

    #[test]
    fn continuous_uses_multiplier() {
        let span = WindowClock::new(30, 4).minutes_into_window(Cadence::Continuous, at(2021, 1, 1, 3, 0));
        assert_eq!(span, Span { length: 120, offset: 0 });
    }

    #[test]
    fn unknown_cadence_rejected() {
        assert_eq!(
            "fortnightly".parse::<Cadence>(),
            Err(Error::UnsupportedCadence("fortnightly".to_string()))
        );
        assert_eq!("annually".parse::<Cadence>(), Ok(Cadence::Yearly));
    }

    #[test]
    fn nesting() {
        assert!(Cadence::Daily.nests_in(Cadence::Monthly));
        assert!(Cadence::Monthly.nests_in(Cadence::Yearly));
        assert!(Cadence::Hourly.nests_in(Cadence::DailyNoon));
        assert!(Cadence::ThreeHourly.nests_in(Cadence::Daily));
        assert!(Cadence::ThreeHourly.nests_in(Cadence::SixHourly));
        assert!(!Cadence::TwoHourly.nests_in(Cadence::ThreeHourly));
        assert!(Cadence::ThreeHourly.nests_in(Cadence::DailyNoon));
        assert!(!Cadence::Weekly.nests_in(Cadence::Monthly));
        assert!(!Cadence::Monthly.nests_in(Cadence::Daily));
        assert!(!Cadence::Daily.nests_in(Cadence::DailyNoon));
        assert!(Cadence::Continuous.nests_in(Cadence::Monthly));
        assert!(!Cadence::Continuous.nests_in(Cadence::Continuous));
    }

    proptest! {
        #[test]
        fn span_start_is_window_aligned(minute_of_year in 0u64..(365 * 1_440)) {
            let c = clock();
            let ts = at(2021, 1, 1, 0, 0) + minutes(minute_of_year);
            for cadence in [
                Cadence::Hourly,
                Cadence::SixHourly,
                Cadence::Daily,
                Cadence::DailyNoon,
                Cadence::Weekly,
                Cadence::Monthly,
                Cadence::Quarterly,
                Cadence::Yearly,
            ] {
                let span = c.minutes_into_window(cadence, ts);
                prop_assert!(span.offset < span.length);
                let start = span.start(ts);
                prop_assert_eq!(c.minutes_into_window(cadence, start).offset, 0);
            }
        }
    }
}

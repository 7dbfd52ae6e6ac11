//! Dosing intervals and start anchors.
//!
//! An [`Interval`] is a strictly positive span of whole minutes, wide enough
//! for hourly dosing as well as reminder offsets of several hundred days.
//! A [`StartAnchor`] marks the first dose, either at an exact instant or on a
//! calendar date (normalized to the start of that day).

use crate::{Error, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MINUTES_PER_HOUR: i64 = 60;
const MINUTES_PER_DAY: i64 = 24 * MINUTES_PER_HOUR;
const MINUTES_PER_WEEK: i64 = 7 * MINUTES_PER_DAY;

/// Unit an interval amount is expressed in
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl IntervalUnit {
    /// Number of minutes in one unit
    pub fn minutes(self) -> i64 {
        match self {
            IntervalUnit::Minutes => 1,
            IntervalUnit::Hours => MINUTES_PER_HOUR,
            IntervalUnit::Days => MINUTES_PER_DAY,
            IntervalUnit::Weeks => MINUTES_PER_WEEK,
        }
    }
}

impl FromStr for IntervalUnit {
    type Err = Error;

    /// Accepts `hour`, `hours`, `HOUR(S)`, `h` and the like.
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace("(s)", "");
        let unit = match normalized.as_str() {
            "m" | "min" | "mins" | "minute" | "minutes" => IntervalUnit::Minutes,
            "h" | "hr" | "hrs" | "hour" | "hours" => IntervalUnit::Hours,
            "d" | "day" | "days" => IntervalUnit::Days,
            "w" | "wk" | "wks" | "week" | "weeks" => IntervalUnit::Weeks,
            _ => {
                return Err(Error::InvalidInterval(format!(
                    "unknown interval unit '{}'",
                    s
                )))
            }
        };
        Ok(unit)
    }
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
            IntervalUnit::Weeks => "weeks",
        };
        f.write_str(label)
    }
}

/// A strictly positive span of time, in whole minutes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "i64", into = "i64")]
pub struct Interval {
    minutes: i64,
}

impl Interval {
    /// Build an interval of `amount` units.
    ///
    /// Fails with `InvalidInterval` unless the result is strictly positive.
    pub fn new(amount: i64, unit: IntervalUnit) -> Result<Self> {
        let minutes = amount.checked_mul(unit.minutes()).ok_or_else(|| {
            Error::OutOfRange(format!("{} {} does not fit in an interval", amount, unit))
        })?;
        Self::from_minutes(minutes)
    }

    pub fn from_minutes(minutes: i64) -> Result<Self> {
        if minutes <= 0 {
            return Err(Error::InvalidInterval(format!(
                "interval must be positive, got {} minutes",
                minutes
            )));
        }
        // Keep every interval convertible to a chrono Duration.
        if Duration::try_minutes(minutes).is_none() {
            return Err(Error::OutOfRange(format!(
                "{} minutes exceeds the supported range",
                minutes
            )));
        }
        Ok(Self { minutes })
    }

    pub fn hours(amount: i64) -> Result<Self> {
        Self::new(amount, IntervalUnit::Hours)
    }

    pub fn days(amount: i64) -> Result<Self> {
        Self::new(amount, IntervalUnit::Days)
    }

    pub fn weeks(amount: i64) -> Result<Self> {
        Self::new(amount, IntervalUnit::Weeks)
    }

    pub fn as_minutes(&self) -> i64 {
        self.minutes
    }

    pub fn as_duration(&self) -> Duration {
        Duration::minutes(self.minutes)
    }

    /// Largest unit this interval is a whole number of
    pub fn unit(&self) -> IntervalUnit {
        [
            IntervalUnit::Weeks,
            IntervalUnit::Days,
            IntervalUnit::Hours,
            IntervalUnit::Minutes,
        ]
        .into_iter()
        .find(|u| self.minutes % u.minutes() == 0)
        .unwrap_or(IntervalUnit::Minutes)
    }

    /// The duration covered by `count` back-to-back intervals
    pub fn times(&self, count: i64) -> Result<Duration> {
        self.minutes
            .checked_mul(count)
            .and_then(Duration::try_minutes)
            .ok_or_else(|| {
                Error::OutOfRange(format!("{} x {} overflows", count, self))
            })
    }
}

impl TryFrom<i64> for Interval {
    type Error = Error;

    fn try_from(minutes: i64) -> Result<Self> {
        Self::from_minutes(minutes)
    }
}

impl From<Interval> for i64 {
    fn from(interval: Interval) -> Self {
        interval.minutes
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = self.unit();
        write!(f, "{} {}", self.minutes / unit.minutes(), unit)
    }
}

/// Add `count` whole intervals to `anchor`
pub fn advance(anchor: DateTime<Utc>, interval: Interval, count: i64) -> Result<DateTime<Utc>> {
    let span = interval.times(count)?;
    anchor.checked_add_signed(span).ok_or_else(|| {
        Error::OutOfRange(format!(
            "{} + {} x {} is not a representable instant",
            anchor, count, interval
        ))
    })
}

/// When the first dose is taken
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StartAnchor {
    /// A specific clock time, used for sub-day dosing
    At { instant: DateTime<Utc> },
    /// A calendar date, used for daily-or-longer dosing
    OnDate { date: NaiveDate },
}

impl StartAnchor {
    /// Build an anchor from optional form inputs.
    ///
    /// Exactly one of `date` and `time` must be supplied.
    pub fn from_parts(date: Option<NaiveDate>, time: Option<DateTime<Utc>>) -> Result<Self> {
        match (date, time) {
            (Some(date), None) => Ok(StartAnchor::OnDate { date }),
            (None, Some(instant)) => Ok(StartAnchor::At { instant }),
            (Some(_), Some(_)) => Err(Error::InvalidStart(
                "give either a start date or a start time, not both".into(),
            )),
            (None, None) => Err(Error::InvalidStart(
                "a start date or a start time is required".into(),
            )),
        }
    }

    /// The instant of the first dose
    pub fn instant(&self) -> DateTime<Utc> {
        match self {
            StartAnchor::At { instant } => *instant,
            StartAnchor::OnDate { date } => date.and_time(NaiveTime::MIN).and_utc(),
        }
    }
}

impl fmt::Display for StartAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartAnchor::At { instant } => write!(f, "{}", instant.format("%Y-%m-%d %H:%M UTC")),
            StartAnchor::OnDate { date } => write!(f, "{}", date.format("%Y-%m-%d")),
        }
    }
}

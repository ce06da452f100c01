use std::fmt;

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::topics::NO_MODE;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Wall-clock minute of the day, written as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    minutes: u16,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self {
            minutes: hour as u16 * 60 + minute as u16,
        })
    }

    /// Accepts `H:MM` / `HH:MM` with `0 <= H <= 23` and `0 <= M <= 59`.
    pub fn parse(value: &str) -> Option<Self> {
        let (hour, minute) = value.split_once(':')?;
        if minute.contains(':') {
            return None;
        }
        Self::new(hour.parse().ok()?, minute.parse().ok()?)
    }

    pub fn from_time(time: NaiveTime) -> Self {
        Self {
            minutes: (time.hour() * 60 + time.minute()) as u16,
        }
    }

    pub fn minutes(self) -> u16 {
        self.minutes
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.minutes / 60, self.minutes % 60)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid time of day '{value}', expected HH:MM"))
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Period {
    #[serde(default)]
    pub name: String,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub mode: String,
}

impl Period {
    /// A period whose start is after its end wraps past midnight.
    pub fn is_overnight(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, minute: u16) -> bool {
        let start = self.start.minutes();
        let end = self.end.minutes();
        if start <= end {
            start <= minute && minute < end
        } else {
            minute >= start || minute < end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Schedule {
    pub active: bool,
    pub default_mode: String,
    #[serde(default)]
    pub periods: Vec<Period>,
}

impl Schedule {
    /// First period in declaration order that contains `time`.
    pub fn matching_period(&self, time: TimeOfDay) -> Option<&Period> {
        let minute = time.minutes() % MINUTES_PER_DAY;
        self.periods.iter().find(|period| period.contains(minute))
    }

    /// The default mode followed by every period's mode, in declaration order.
    pub fn referenced_modes(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.default_mode.as_str())
            .chain(self.periods.iter().map(|period| period.mode.as_str()))
    }

    pub fn mode_at(&self, time: TimeOfDay) -> &str {
        self.matching_period(time)
            .map(|period| period.mode.as_str())
            .unwrap_or(self.default_mode.as_str())
    }
}

/// Picks the active mode name.
///
/// While the schedule is followed the schedule decides. Otherwise the manual
/// mode wins, and with no manual selection the previous mode carries over
/// (which may be no mode at all). A manual selection of [`NO_MODE`] means no
/// mode.
pub fn resolve_mode(
    now: NaiveTime,
    schedule: &Schedule,
    follow_schedule: bool,
    manual_mode: Option<&str>,
    previous_mode: Option<&str>,
) -> Option<String> {
    if !follow_schedule {
        return manual_mode
            .or(previous_mode)
            .filter(|mode| *mode != NO_MODE)
            .map(str::to_string);
    }

    Some(schedule.mode_at(TimeOfDay::from_time(now)).to_string())
}

//! Domain model and the shift matching/deduplication engine.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "shiftwatch-core";

/// Shift state as reported by the roster API.
///
/// `Unknown` absorbs any value the API starts reporting that this crate does
/// not know about; unknown shifts are never claimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShiftStatus {
    /// Open swap offered by another courier.
    Pending,
    /// Open slot with no courier assigned.
    Unassigned,
    /// Already taken.
    Assigned,
    #[serde(other)]
    Unknown,
}

impl ShiftStatus {
    pub fn is_claimable(self) -> bool {
        matches!(self, ShiftStatus::Pending | ShiftStatus::Unassigned)
    }
}

impl fmt::Display for ShiftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShiftStatus::Pending => "PENDING",
            ShiftStatus::Unassigned => "UNASSIGNED",
            ShiftStatus::Assigned => "ASSIGNED",
            ShiftStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// One candidate shift offered by the roster service.
///
/// Times are wall-clock values in the zone the service reported via
/// `time_zone`. Identity is the source-assigned `id` alone: the same shift
/// fetched on two polls with a different `status` still compares equal,
/// which is what makes the seen-set difference correct across cycles.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Shift {
    pub id: u64,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub status: ShiftStatus,
    pub time_zone: String,
    pub starting_point_id: i64,
    pub starting_point_name: String,
}

impl PartialEq for Shift {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::hash::Hash for Shift {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Shift {
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

impl fmt::Display for Shift {
    /// Renders like `March 4 14:00-16:30 (2h 30m)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let minutes = self.duration_minutes().max(0);
        write!(
            f,
            "{} {} {:02}:{:02}-{:02}:{:02} ({}h {}m)",
            month_name(self.start.month()),
            self.start.day(),
            self.start.hour(),
            self.start.minute(),
            self.end.hour(),
            self.end.minute(),
            minutes / 60,
            minutes % 60,
        )
    }
}

fn month_name(month: u32) -> &'static str {
    match month {
        1 => "January",
        2 => "February",
        3 => "March",
        4 => "April",
        5 => "May",
        6 => "June",
        7 => "July",
        8 => "August",
        9 => "September",
        10 => "October",
        11 => "November",
        _ => "December",
    }
}

pub const DAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

/// Weekday name to index (0 = Monday .. 6 = Sunday). Case-insensitive,
/// accepts full names or any prefix of at least three letters.
pub fn day_index(name: &str) -> Option<u8> {
    let needle = name.trim().to_ascii_lowercase();
    if needle.len() < 3 {
        return None;
    }
    DAY_NAMES
        .iter()
        .position(|full| full.to_ascii_lowercase().starts_with(&needle))
        .map(|i| i as u8)
}

pub fn day_name(index: u8) -> Option<&'static str> {
    DAY_NAMES.get(index as usize).copied()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeslotError {
    #[error("timeslot end {end} is not after start {start}")]
    EndNotAfterStart { start: NaiveTime, end: NaiveTime },
    #[error("minimum duration {min_minutes}m exceeds the {span_minutes}m window")]
    MinDurationExceedsWindow { min_minutes: u32, span_minutes: u32 },
}

/// A weekly recurring acceptance window for shifts.
///
/// `days` holds weekday indices, 0 = Monday through 6 = Sunday, matching the
/// persisted schema. Clock bounds are stored as `HH:MM` strings on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringTimeslot {
    pub days: BTreeSet<u8>,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    pub min_minutes: u32,
}

impl RecurringTimeslot {
    /// Validating constructor, used wherever a timeslot comes from user
    /// input. Deserialization of persisted timeslots deliberately bypasses
    /// this so legacy data keeps loading.
    pub fn new(
        days: BTreeSet<u8>,
        start: NaiveTime,
        end: NaiveTime,
        min_minutes: u32,
    ) -> Result<Self, TimeslotError> {
        if end <= start {
            return Err(TimeslotError::EndNotAfterStart { start, end });
        }
        let span_minutes = ((end - start).num_minutes()) as u32;
        if min_minutes > span_minutes {
            return Err(TimeslotError::MinDurationExceedsWindow {
                min_minutes,
                span_minutes,
            });
        }
        Ok(Self {
            days,
            start,
            end,
            min_minutes,
        })
    }

    /// The first-run default: every day, all hours, no minimum length.
    pub fn catch_all() -> Self {
        Self {
            days: (0..7).collect(),
            start: NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default(),
            end: NaiveTime::from_hms_opt(23, 59, 0).unwrap_or_default(),
            min_minutes: 0,
        }
    }

    /// Whether a shift falls inside this window.
    ///
    /// A shift that ends on a different calendar date than it starts is
    /// rejected outright: a same-day clock window cannot contain it, and
    /// comparing clock times across the midnight boundary silently accepts
    /// nonsense. Pure and total for any `start < end`.
    pub fn accepts(&self, shift: &Shift) -> bool {
        let weekday = shift.start.weekday().num_days_from_monday() as u8;
        if !self.days.contains(&weekday) {
            return false;
        }
        if shift.end.date() != shift.start.date() {
            return false;
        }
        if shift.start.time() < self.start || shift.end.time() > self.end {
            return false;
        }
        shift.duration_minutes() >= i64::from(self.min_minutes)
    }
}

impl fmt::Display for RecurringTimeslot {
    /// Renders like `09:00-17:00 every Monday, Wednesday (min 60m)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days = self
            .days
            .iter()
            .filter_map(|d| day_name(*d))
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02} every {} (min {}m)",
            self.start.hour(),
            self.start.minute(),
            self.end.hour(),
            self.end.minute(),
            days,
            self.min_minutes,
        )
    }
}

/// `HH:MM` serde representation for clock-of-day fields.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Shifts present in `current` whose id was not seen in `previous`.
///
/// The difference is computed over ids explicitly so the identity-only
/// equality contract is visible here rather than buried in `Hash`/`Eq`.
pub fn diff_new(current: &HashSet<Shift>, previous: &HashSet<Shift>) -> HashSet<Shift> {
    let seen: HashSet<u64> = previous.iter().map(|s| s.id).collect();
    current
        .iter()
        .filter(|s| !seen.contains(&s.id))
        .cloned()
        .collect()
}

/// Shifts accepted by at least one timeslot.
///
/// No timeslots means nothing matches; the conservative default. The driver
/// is expected to synthesize a catch-all timeslot on first run instead of
/// relying on an accept-everything fallback here.
pub fn filter_valid(candidates: &HashSet<Shift>, timeslots: &[RecurringTimeslot]) -> HashSet<Shift> {
    candidates
        .iter()
        .filter(|shift| timeslots.iter().any(|slot| slot.accepts(shift)))
        .cloned()
        .collect()
}

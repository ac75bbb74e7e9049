//! Offset-qualified instants and half-open time ranges.
//!
//! A [`Timestamp`] is always qualified by a UTC offset; ordering, equality
//! and hashing are on the absolute instant, so `09:00+00:00` and
//! `10:00+01:00` are the same timestamp. Naive datetimes are rejected at the
//! parsing boundary. Calendar-aware timezone rules (DST transitions, named
//! zones) are the business of whatever produces the timestamps; everything
//! in this crate only needs the instant and its offset.

use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::ops::{Add, Sub};
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TimeError;

/// Smallest representable step between two index points.
pub fn resolution() -> Duration {
    Duration::nanoseconds(1)
}

/// A timezone-qualified instant.
#[derive(Clone, Copy)]
pub struct Timestamp(DateTime<FixedOffset>);

impl Timestamp {
    pub fn new(inner: DateTime<FixedOffset>) -> Self {
        Timestamp(inner)
    }

    /// Wrap a UTC instant, keeping the zero offset.
    pub fn utc(inner: DateTime<Utc>) -> Self {
        Timestamp(inner.with_timezone(&Utc.fix()))
    }

    /// Parse an RFC 3339 timestamp. The UTC offset is mandatory; a naive
    /// datetime parses as [`TimeError::MissingTimezone`].
    pub fn parse(s: &str) -> Result<Self, TimeError> {
        let s = s.trim();

        if let Ok(inner) = DateTime::parse_from_rfc3339(s) {
            return Ok(Timestamp(inner));
        }
        if let Ok(inner) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
            return Ok(Timestamp(inner));
        }

        let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .any(|fmt| NaiveDateTime::parse_from_str(s, fmt).is_ok())
            || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok();

        if naive {
            Err(TimeError::MissingTimezone(s.to_string()))
        } else {
            Err(TimeError::Parse(s.to_string()))
        }
    }

    /// The absolute instant in UTC.
    pub fn instant(&self) -> DateTime<Utc> {
        self.0.with_timezone(&Utc)
    }

    pub fn offset(&self) -> FixedOffset {
        *self.0.offset()
    }

    /// Calendar date in the timestamp's own offset.
    pub fn local_date(&self) -> NaiveDate {
        self.0.date_naive()
    }

    /// Nanoseconds since the Unix epoch. `None` outside the representable
    /// range (roughly 1677..=2262).
    pub fn nanos(&self) -> Option<i64> {
        self.0.timestamp_nanos_opt()
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Timestamp::utc(DateTime::from_timestamp_nanos(nanos))
    }

    pub fn min(self, other: Self) -> Self {
        if self <= other { self } else { other }
    }

    pub fn max(self, other: Self) -> Self {
        if self >= other { self } else { other }
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Hash for Timestamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.timestamp().hash(state);
        self.0.timestamp_subsec_nanos().hash(state);
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs)
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 - rhs)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339())
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0.to_rfc3339())
    }
}

impl FromStr for Timestamp {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timestamp::parse(s)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Timestamp::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A moment within a day, together with the UTC offset it is quoted in.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeOfDay {
    time: NaiveTime,
    offset: FixedOffset,
}

impl TimeOfDay {
    pub fn new(time: NaiveTime, offset: FixedOffset) -> Self {
        TimeOfDay { time, offset }
    }

    pub fn utc(time: NaiveTime) -> Self {
        TimeOfDay {
            time,
            offset: Utc.fix(),
        }
    }

    /// Parse strings like `"16:30"`, `"16:30:00.5"`, or `"16:30 [-05:00]"`.
    /// The bracketed offset defaults to UTC when omitted.
    pub fn parse(s: &str) -> Result<Self, TimeError> {
        let s = s.trim();
        let (time_str, offset) = match s.split_once('[') {
            Some((head, tail)) => {
                let inner = tail
                    .strip_suffix(']')
                    .ok_or_else(|| TimeError::Parse(s.to_string()))?;
                let offset = inner
                    .trim()
                    .parse::<FixedOffset>()
                    .map_err(|_| TimeError::Parse(s.to_string()))?;
                (head.trim(), offset)
            }
            None => (s, Utc.fix()),
        };

        for fmt in ["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"] {
            if let Ok(time) = NaiveTime::parse_from_str(time_str, fmt) {
                return Ok(TimeOfDay { time, offset });
            }
        }

        Err(TimeError::Parse(s.to_string()))
    }

    /// The instant this time of day falls on for a given date.
    pub fn on(&self, date: NaiveDate) -> Timestamp {
        let local = date.and_time(self.time);
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Timestamp(DateTime::from_naive_utc_and_offset(utc, self.offset))
    }

    pub fn time(&self) -> NaiveTime {
        self.time
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }
}

impl Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.time.format("%H:%M:%S%.f"), self.offset)
    }
}

impl Debug for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimeOfDay({self})")
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimeOfDay::parse(s)
    }
}

/// A half-open interval `[start, end)` of timestamps with `start <= end`.
/// Equal bounds denote an empty range.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    start: Timestamp,
    end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, TimeError> {
        if start > end {
            return Err(TimeError::Inverted { start, end });
        }
        Ok(TimeRange { start, end })
    }

    /// The range covering a sorted index running from `first` to `last`
    /// inclusive; `view` over it extracts exactly those rows.
    pub fn of_points(first: Timestamp, last: Timestamp) -> Result<Self, TimeError> {
        TimeRange::new(first, last + resolution())
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether the instant falls within `[start, end)`.
    pub fn contains_point(&self, t: Timestamp) -> bool {
        self.start <= t && t < self.end
    }

    /// Whether `other` is a sub-interval of this range.
    pub fn contains(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether the two ranges share a non-empty overlap.
    pub fn intersects(&self, other: &TimeRange) -> bool {
        self.start.max(other.start) < self.end.min(other.end)
    }

    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeRange { start, end })
    }

    /// The smallest range covering both inputs.
    pub fn union(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Subtraction of prefix: the part of this range at or after `t`.
    /// Empty (anchored at `end`) when `t` is past the end.
    pub fn since(&self, t: Timestamp) -> TimeRange {
        TimeRange {
            start: self.start.max(t).min(self.end),
            end: self.end,
        }
    }

    /// Shift the start backward by `lookback`, keeping the end fixed.
    pub fn with_lookback(&self, lookback: Duration) -> TimeRange {
        TimeRange {
            start: self.start - lookback,
            end: self.end,
        }
    }
}

impl Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl Debug for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimeRange{self}")
    }
}

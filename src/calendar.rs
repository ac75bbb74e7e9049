//! Expected-index calendars.
//!
//! A [`Calendar`] describes the set of instants at which a dataset is
//! expected to have a row, potentially infinite in extent. Completion
//! checking only ever asks two questions of it: which events fall inside a
//! range, and what the last event at or before some instant is. Anything
//! that can answer those, be it an exchange session schedule, a cron-like
//! rule, or a static list, can drive a [`CalendarChecker`](crate::CalendarChecker).

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, Weekday};

use crate::error::TimeError;
use crate::time::{TimeOfDay, TimeRange, Timestamp};

/// A set of expected instants.
pub trait Calendar: Debug + Send + Sync {
    /// All events within `range`, in ascending order.
    fn events_in(&self, range: &TimeRange) -> Vec<Timestamp>;

    /// The latest event at or before `as_of`, if any.
    fn last_on_or_before(&self, as_of: Timestamp) -> Option<Timestamp>;
}

pub const BUSINESS_DAYS: [Weekday; 5] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
];

/// One event per included day at a fixed time of day, minus holidays.
#[derive(Debug, Clone)]
pub struct DailyCalendar {
    time_of_day: TimeOfDay,
    weekdays: Vec<Weekday>,
    holidays: BTreeSet<NaiveDate>,
}

impl DailyCalendar {
    /// Business-day calendar (Monday through Friday) with no holidays.
    pub fn business(time_of_day: TimeOfDay) -> Self {
        DailyCalendar {
            time_of_day,
            weekdays: BUSINESS_DAYS.to_vec(),
            holidays: BTreeSet::new(),
        }
    }

    /// Every day of the week.
    pub fn daily(time_of_day: TimeOfDay) -> Self {
        DailyCalendar {
            time_of_day,
            weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            holidays: BTreeSet::new(),
        }
    }

    pub fn with_weekdays(mut self, weekdays: impl IntoIterator<Item = Weekday>) -> Self {
        self.weekdays = weekdays.into_iter().collect();
        self
    }

    pub fn with_holidays(mut self, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays = holidays.into_iter().collect();
        self
    }

    fn includes(&self, date: NaiveDate) -> bool {
        self.weekdays.contains(&date.weekday()) && !self.holidays.contains(&date)
    }
}

impl Calendar for DailyCalendar {
    fn events_in(&self, range: &TimeRange) -> Vec<Timestamp> {
        if range.is_empty() || self.weekdays.is_empty() {
            return Vec::new();
        }

        // Pad by a day on each side; the calendar's offset may place an
        // event on a neighbouring local date.
        let mut date = range.start().local_date() - Duration::days(1);
        let last = range.end().local_date() + Duration::days(1);

        let mut events = Vec::new();
        while date <= last {
            if self.includes(date) {
                let stamp = self.time_of_day.on(date);
                if range.contains_point(stamp) {
                    events.push(stamp);
                }
            }
            date = date + Duration::days(1);
        }
        events
    }

    fn last_on_or_before(&self, as_of: Timestamp) -> Option<Timestamp> {
        if self.weekdays.is_empty() {
            return None;
        }

        let mut date = as_of.local_date() + Duration::days(1);
        // A week covers every weekday; anything further back is a holiday
        // run. Ten years of holidays in a row means an empty calendar.
        for _ in 0..3660 {
            if self.includes(date) {
                let stamp = self.time_of_day.on(date);
                if stamp <= as_of {
                    return Some(stamp);
                }
            }
            date = date - Duration::days(1);
        }
        None
    }
}

/// Events at a fixed interval, anchored at the Unix epoch. Used when data
/// should be at most one interval stale whenever the graph is run.
#[derive(Debug, Clone)]
pub struct IntervalCalendar {
    every: Duration,
}

impl IntervalCalendar {
    /// `every` must be positive and divide one day evenly.
    pub fn new(every: Duration) -> Result<Self, TimeError> {
        let nanos = every.num_nanoseconds().unwrap_or(0);
        let day = Duration::days(1).num_nanoseconds().unwrap_or(0);
        if nanos <= 0 || day % nanos != 0 {
            return Err(TimeError::Parse(format!(
                "interval {every} does not evenly divide one day"
            )));
        }
        Ok(IntervalCalendar { every })
    }

    fn floor(&self, t: Timestamp) -> Option<Timestamp> {
        let nanos = t.nanos()?;
        let step = self.every.num_nanoseconds()?;
        Some(Timestamp::from_nanos(nanos.div_euclid(step) * step))
    }
}

impl Calendar for IntervalCalendar {
    fn events_in(&self, range: &TimeRange) -> Vec<Timestamp> {
        if range.is_empty() {
            return Vec::new();
        }

        let mut events = Vec::new();
        let Some(mut tick) = self.floor(range.start()) else {
            return events;
        };
        if tick < range.start() {
            tick = tick + self.every;
        }
        while range.contains_point(tick) {
            events.push(tick);
            tick = tick + self.every;
        }
        events
    }

    fn last_on_or_before(&self, as_of: Timestamp) -> Option<Timestamp> {
        self.floor(as_of)
    }
}

/// The union of several calendars.
#[derive(Debug, Clone)]
pub struct UnionCalendar {
    calendars: Vec<Arc<dyn Calendar>>,
}

impl UnionCalendar {
    pub fn new(calendars: Vec<Arc<dyn Calendar>>) -> Self {
        UnionCalendar { calendars }
    }

    /// Merge a set of calendars, flattening nested unions.
    pub fn merge(calendars: impl IntoIterator<Item = UnionOrLeaf>) -> Self {
        let mut flattened = Vec::new();
        for calendar in calendars {
            match calendar {
                UnionOrLeaf::Union(union) => flattened.extend(union.calendars),
                UnionOrLeaf::Leaf(leaf) => flattened.push(leaf),
            }
        }
        UnionCalendar {
            calendars: flattened,
        }
    }

    pub fn calendars(&self) -> &[Arc<dyn Calendar>] {
        &self.calendars
    }
}

/// Input to [`UnionCalendar::merge`].
pub enum UnionOrLeaf {
    Union(UnionCalendar),
    Leaf(Arc<dyn Calendar>),
}

impl From<UnionCalendar> for UnionOrLeaf {
    fn from(value: UnionCalendar) -> Self {
        UnionOrLeaf::Union(value)
    }
}

impl From<Arc<dyn Calendar>> for UnionOrLeaf {
    fn from(value: Arc<dyn Calendar>) -> Self {
        UnionOrLeaf::Leaf(value)
    }
}

impl Calendar for UnionCalendar {
    fn events_in(&self, range: &TimeRange) -> Vec<Timestamp> {
        let mut events: Vec<Timestamp> = self
            .calendars
            .iter()
            .flat_map(|calendar| calendar.events_in(range))
            .collect();
        events.sort();
        events.dedup();
        events
    }

    fn last_on_or_before(&self, as_of: Timestamp) -> Option<Timestamp> {
        self.calendars
            .iter()
            .filter_map(|calendar| calendar.last_on_or_before(as_of))
            .max()
    }
}

/// An explicit, finite list of events. Mostly useful in tests and for
/// cadences produced by an external scheduling system.
#[derive(Debug, Clone)]
pub struct ExplicitCalendar {
    events: Vec<Timestamp>,
}

impl ExplicitCalendar {
    pub fn new(mut events: Vec<Timestamp>) -> Self {
        events.sort();
        events.dedup();
        ExplicitCalendar { events }
    }
}

impl Calendar for ExplicitCalendar {
    fn events_in(&self, range: &TimeRange) -> Vec<Timestamp> {
        self.events
            .iter()
            .copied()
            .filter(|event| range.contains_point(*event))
            .collect()
    }

    fn last_on_or_before(&self, as_of: Timestamp) -> Option<Timestamp> {
        self.events.iter().copied().filter(|e| *e <= as_of).last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timestamp;

    fn ts(s: &str) -> Timestamp {
        Timestamp::parse(s).unwrap()
    }

    fn range(start: &str, end: &str) -> TimeRange {
        TimeRange::new(ts(start), ts(end)).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn business_calendar_skips_weekends() {
        let close = DailyCalendar::business(TimeOfDay::parse("16:30").unwrap());

        // 2020-03-06 is a Friday; the 7th and 8th are the weekend.
        let events = close.events_in(&range("2020-03-06T00:00:00Z", "2020-03-10T00:00:00Z"));
        assert_eq!(
            events,
            vec![ts("2020-03-06T16:30:00Z"), ts("2020-03-09T16:30:00Z")]
        );

        assert_eq!(
            close.last_on_or_before(ts("2020-03-08T12:00:00Z")),
            Some(ts("2020-03-06T16:30:00Z"))
        );
    }

    #[test]
    fn holidays_remove_expected_events() {
        let plain = DailyCalendar::business(TimeOfDay::parse("16:30").unwrap());
        let with_holiday = plain.clone().with_holidays([date("2019-12-25")]);

        let as_of = ts("2019-12-25T23:00:00Z");
        assert_eq!(
            plain.last_on_or_before(as_of),
            Some(ts("2019-12-25T16:30:00Z"))
        );
        assert_eq!(
            with_holiday.last_on_or_before(as_of),
            Some(ts("2019-12-24T16:30:00Z"))
        );
    }

    #[test]
    fn calendar_offset_is_honoured() {
        let ny_close = DailyCalendar::business(TimeOfDay::parse("16:30 [-05:00]").unwrap());

        assert_eq!(
            ny_close.last_on_or_before(ts("2020-03-03T00:00:00Z")),
            Some(ts("2020-03-02T16:30:00-05:00"))
        );
    }

    #[test]
    fn interval_calendar_must_divide_a_day() {
        assert!(IntervalCalendar::new(Duration::hours(7)).is_err());
        assert!(IntervalCalendar::new(Duration::zero()).is_err());

        let hourly = IntervalCalendar::new(Duration::hours(1)).unwrap();
        assert_eq!(
            hourly.last_on_or_before(ts("2020-03-02T09:40:00Z")),
            Some(ts("2020-03-02T09:00:00Z"))
        );

        let events = hourly.events_in(&range("2020-03-02T09:30:00Z", "2020-03-02T12:00:00Z"));
        assert_eq!(
            events,
            vec![
                ts("2020-03-02T10:00:00Z"),
                ts("2020-03-02T11:00:00Z"),
            ]
        );
    }

    #[test]
    fn union_takes_the_latest_event() {
        let morning: Arc<dyn Calendar> =
            Arc::new(DailyCalendar::daily(TimeOfDay::parse("09:00").unwrap()));
        let evening: Arc<dyn Calendar> =
            Arc::new(DailyCalendar::daily(TimeOfDay::parse("17:00").unwrap()));
        let union = UnionCalendar::new(vec![morning, evening]);

        assert_eq!(
            union.last_on_or_before(ts("2020-03-02T12:00:00Z")),
            Some(ts("2020-03-02T09:00:00Z"))
        );

        let events = union.events_in(&range("2020-03-02T00:00:00Z", "2020-03-03T00:00:00Z"));
        assert_eq!(
            events,
            vec![ts("2020-03-02T09:00:00Z"), ts("2020-03-02T17:00:00Z")]
        );
    }

    #[test]
    fn merge_flattens_nested_unions() {
        let a: Arc<dyn Calendar> =
            Arc::new(DailyCalendar::daily(TimeOfDay::parse("09:00").unwrap()));
        let b: Arc<dyn Calendar> =
            Arc::new(DailyCalendar::daily(TimeOfDay::parse("17:00").unwrap()));
        let inner = UnionCalendar::new(vec![a]);

        let merged = UnionCalendar::merge([UnionOrLeaf::from(inner), UnionOrLeaf::from(b)]);
        assert_eq!(merged.calendars().len(), 2);
    }
}

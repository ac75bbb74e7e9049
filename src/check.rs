//! Completion checking.
//!
//! A completion checker decides whether a dataset's persisted output is up
//! to date for a target range, looking only at the *end* of the stored
//! index. That asymmetry is deliberate and load-bearing: data is expected
//! to grow forward in time, and downstream causal correctness is defined in
//! terms of "has the expected last bar arrived yet". Data expanding
//! backwards (earlier rows appearing later) is not detected by any
//! checker and breaks causality; keep front-fills out of incremental
//! pipelines.

use std::fmt::Debug;
use std::sync::Arc;

use chrono::Duration;

use crate::calendar::Calendar;
use crate::error::CompletionError;
use crate::time::{resolution, TimeRange, Timestamp};

/// Policy deciding whether stored data satisfies a target range.
pub trait CompletionChecker: Debug + Send + Sync {
    /// Is data covering `existing` complete with respect to `target`?
    /// `existing` is the stored index extent, `None` when nothing is
    /// stored. Never true for absent or empty data unless the target
    /// itself is empty.
    fn is_complete(
        &self,
        target: &TimeRange,
        existing: Option<&TimeRange>,
    ) -> Result<bool, CompletionError>;

    /// The instant data is expected to reach for `target`; `None` when the
    /// checker has no specific expectation.
    fn expected_last(&self, target: &TimeRange) -> Result<Option<Timestamp>, CompletionError>;
}

/// Checks the stored index against a calendar of expected instants:
/// complete once the last stored row reaches the last calendar event at or
/// before the target's end.
#[derive(Debug, Clone)]
pub struct CalendarChecker {
    calendar: Arc<dyn Calendar>,
    tolerance: Option<Duration>,
}

impl CalendarChecker {
    pub fn new(calendar: impl Calendar + 'static) -> Self {
        CalendarChecker {
            calendar: Arc::new(calendar),
            tolerance: None,
        }
    }

    pub fn from_arc(calendar: Arc<dyn Calendar>) -> Self {
        CalendarChecker {
            calendar,
            tolerance: None,
        }
    }

    /// Allow data to lag the calendar by up to `tolerance`.
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    pub fn calendar(&self) -> &Arc<dyn Calendar> {
        &self.calendar
    }
}

impl CompletionChecker for CalendarChecker {
    fn is_complete(
        &self,
        target: &TimeRange,
        existing: Option<&TimeRange>,
    ) -> Result<bool, CompletionError> {
        if target.is_empty() {
            return Ok(true);
        }
        let Some(existing) = existing else {
            return Ok(false);
        };
        if existing.is_empty() {
            return Ok(false);
        }

        match self.expected_last(target)? {
            // No expected event up to the target's end: nothing is owed.
            None => Ok(true),
            // The stored end is exclusive, so the last stored row reaches
            // `expected` exactly when the end lies strictly beyond it.
            Some(expected) => Ok(existing.end() > expected),
        }
    }

    fn expected_last(&self, target: &TimeRange) -> Result<Option<Timestamp>, CompletionError> {
        // The target is half-open, so an event sitting exactly on its end
        // belongs to the next window, not this one.
        let mut as_of = target.end() - resolution();
        if let Some(tolerance) = self.tolerance {
            as_of = as_of - tolerance;
        }
        Ok(self.calendar.last_on_or_before(as_of))
    }
}

/// Checker for data with no known schedule: any stored data overlapping the
/// target counts as complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct IrregularChecker;

impl CompletionChecker for IrregularChecker {
    fn is_complete(
        &self,
        target: &TimeRange,
        existing: Option<&TimeRange>,
    ) -> Result<bool, CompletionError> {
        if target.is_empty() {
            return Ok(true);
        }
        Ok(existing.is_some_and(|existing| existing.intersects(target)))
    }

    fn expected_last(&self, _target: &TimeRange) -> Result<Option<Timestamp>, CompletionError> {
        Ok(None)
    }
}

/// How a [`CompositeChecker`] combines its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Complete only when every child is; the effective expectation is the
    /// earliest of the children's.
    Strictest,
    /// Complete when any child is; the effective expectation is the latest.
    Laxest,
}

/// Combines several checkers under one strategy. This is how a task
/// inherits completion semantics from multiple parents.
#[derive(Debug, Clone)]
pub struct CompositeChecker {
    strategy: Strategy,
    children: Vec<Arc<dyn CompletionChecker>>,
}

impl CompositeChecker {
    pub fn new(strategy: Strategy, children: Vec<Arc<dyn CompletionChecker>>) -> Self {
        CompositeChecker { strategy, children }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn children(&self) -> &[Arc<dyn CompletionChecker>] {
        &self.children
    }
}

impl CompletionChecker for CompositeChecker {
    fn is_complete(
        &self,
        target: &TimeRange,
        existing: Option<&TimeRange>,
    ) -> Result<bool, CompletionError> {
        let mut any = false;
        let mut all = true;

        for child in &self.children {
            if child.is_complete(target, existing)? {
                any = true;
            } else {
                all = false;
            }
        }

        Ok(match self.strategy {
            Strategy::Strictest => all,
            Strategy::Laxest => any,
        })
    }

    fn expected_last(&self, target: &TimeRange) -> Result<Option<Timestamp>, CompletionError> {
        let mut effective: Option<Timestamp> = None;

        for child in &self.children {
            let Some(expected) = child.expected_last(target)? else {
                continue;
            };
            effective = Some(match (effective, self.strategy) {
                (None, _) => expected,
                (Some(current), Strategy::Strictest) => current.min(expected),
                (Some(current), Strategy::Laxest) => current.max(expected),
            });
        }

        Ok(effective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::DailyCalendar;
    use crate::time::TimeOfDay;
    use chrono::NaiveDate;

    fn ts(s: &str) -> Timestamp {
        Timestamp::parse(s).unwrap()
    }

    fn range(start: &str, end: &str) -> TimeRange {
        TimeRange::new(ts(start), ts(end)).unwrap()
    }

    fn business_close() -> DailyCalendar {
        DailyCalendar::business(TimeOfDay::parse("16:30").unwrap())
    }

    #[test]
    fn calendar_checker_requires_the_expected_bar() {
        let checker = CalendarChecker::new(business_close());
        // 2019-12-23 is a Monday; the target runs through Thursday morning.
        let target = range("2019-12-23T00:00:00Z", "2019-12-26T00:00:00Z");
        // Stored data ends with Tuesday's close.
        let stored = range("2019-12-20T16:30:00Z", "2019-12-24T16:30:01Z");

        assert_eq!(
            checker.expected_last(&target).unwrap(),
            Some(ts("2019-12-25T16:30:00Z"))
        );
        assert!(!checker.is_complete(&target, Some(&stored)).unwrap());
    }

    #[test]
    fn holiday_calendar_flips_completion_of_the_same_payload() {
        let target = range("2019-12-23T00:00:00Z", "2019-12-26T00:00:00Z");
        let stored = range("2019-12-20T16:30:00Z", "2019-12-24T16:30:01Z");

        let without_holidays = CalendarChecker::new(business_close());
        assert!(!without_holidays.is_complete(&target, Some(&stored)).unwrap());

        let christmas = NaiveDate::from_ymd_opt(2019, 12, 25).unwrap();
        let with_holidays =
            CalendarChecker::new(business_close().with_holidays([christmas]));
        assert_eq!(
            with_holidays.expected_last(&target).unwrap(),
            Some(ts("2019-12-24T16:30:00Z"))
        );
        assert!(with_holidays.is_complete(&target, Some(&stored)).unwrap());
    }

    #[test]
    fn nothing_stored_is_never_complete() {
        let checker = CalendarChecker::new(business_close());
        let target = range("2019-12-23T00:00:00Z", "2019-12-26T00:00:00Z");

        assert!(!checker.is_complete(&target, None).unwrap());
        assert!(!IrregularChecker.is_complete(&target, None).unwrap());

        let empty_target = range("2019-12-23T00:00:00Z", "2019-12-23T00:00:00Z");
        assert!(checker.is_complete(&empty_target, None).unwrap());
    }

    #[test]
    fn tolerance_relaxes_the_expectation() {
        let strict = CalendarChecker::new(business_close());
        let relaxed = CalendarChecker::new(business_close()).with_tolerance(Duration::days(1));

        let target = range("2019-12-23T00:00:00Z", "2019-12-25T00:00:00Z");
        let stored = range("2019-12-20T16:30:00Z", "2019-12-23T16:30:01Z");

        assert!(!strict.is_complete(&target, Some(&stored)).unwrap());
        assert!(relaxed.is_complete(&target, Some(&stored)).unwrap());
    }

    #[test]
    fn irregular_checker_wants_overlap_only() {
        let target = range("2020-01-01T00:00:00Z", "2020-02-01T00:00:00Z");
        let inside = range("2020-01-10T00:00:00Z", "2020-01-11T00:00:00Z");
        let before = range("2019-01-01T00:00:00Z", "2019-06-01T00:00:00Z");

        assert!(IrregularChecker.is_complete(&target, Some(&inside)).unwrap());
        assert!(!IrregularChecker.is_complete(&target, Some(&before)).unwrap());
        assert_eq!(IrregularChecker.expected_last(&target).unwrap(), None);
    }

    #[test]
    fn strictest_composite_takes_the_earliest_expectation() {
        let at_15 = CalendarChecker::new(DailyCalendar::daily(TimeOfDay::parse("15:00").unwrap()));
        let at_17 = CalendarChecker::new(DailyCalendar::daily(TimeOfDay::parse("17:00").unwrap()));
        let composite = CompositeChecker::new(
            Strategy::Strictest,
            vec![Arc::new(at_15), Arc::new(at_17)],
        );

        let target = range("2020-03-01T00:00:00Z", "2020-03-02T18:00:00Z");
        assert_eq!(
            composite.expected_last(&target).unwrap(),
            Some(ts("2020-03-02T15:00:00Z"))
        );

        // Data through 15:00 satisfies one leg but not both.
        let through_15 = range("2020-03-01T00:00:00Z", "2020-03-02T15:00:01Z");
        assert!(!composite.is_complete(&target, Some(&through_15)).unwrap());

        let through_17 = range("2020-03-01T00:00:00Z", "2020-03-02T17:00:01Z");
        assert!(composite.is_complete(&target, Some(&through_17)).unwrap());
    }

    #[test]
    fn laxest_composite_accepts_any_leg() {
        let at_15 = CalendarChecker::new(DailyCalendar::daily(TimeOfDay::parse("15:00").unwrap()));
        let at_17 = CalendarChecker::new(DailyCalendar::daily(TimeOfDay::parse("17:00").unwrap()));
        let composite =
            CompositeChecker::new(Strategy::Laxest, vec![Arc::new(at_15), Arc::new(at_17)]);

        let target = range("2020-03-01T00:00:00Z", "2020-03-02T18:00:00Z");
        assert_eq!(
            composite.expected_last(&target).unwrap(),
            Some(ts("2020-03-02T17:00:00Z"))
        );

        let through_15 = range("2020-03-01T00:00:00Z", "2020-03-02T15:00:01Z");
        assert!(composite.is_complete(&target, Some(&through_15)).unwrap());
    }
}

//! Closed, day-granular date intervals.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{CalViewError, CalViewResult};

/// A closed interval `[start, end]` of calendar days.
///
/// Both ends are inclusive and `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> CalViewResult<Self> {
        if end < start {
            return Err(CalViewError::InvalidWindow(format!(
                "end {} is before start {}",
                end, start
            )));
        }
        Ok(DateRange { start, end })
    }

    /// A range covering a single day.
    pub fn day(date: NaiveDate) -> Self {
        DateRange {
            start: date,
            end: date,
        }
    }

    /// Build a window from optional bounds.
    /// A missing end means a single-day window; a missing start is invalid.
    pub fn from_bounds(start: Option<NaiveDate>, end: Option<NaiveDate>) -> CalViewResult<Self> {
        let start =
            start.ok_or_else(|| CalViewError::InvalidWindow("window has no start date".into()))?;
        Self::new(start, end.unwrap_or(start))
    }

    /// Parse `YYYY-MM-DD` bounds.
    pub fn parse(start: &str, end: &str) -> CalViewResult<Self> {
        Self::new(parse_date(start)?, parse_date(end)?)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of days covered.
    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// True when `next` (which starts no earlier than `self`) overlaps this
    /// range or begins on the day right after it.
    pub fn touches(&self, next: &DateRange) -> bool {
        match self.end.succ_opt() {
            Some(after) => next.start <= after,
            None => true,
        }
    }

    /// Construct from bounds already known to be ordered.
    pub(crate) fn ordered(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "unordered bounds {} > {}", start, end);
        DateRange { start, end }
    }

    /// Iterate every day in the range.
    pub fn iter_days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

fn parse_date(s: &str) -> CalViewResult<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
        CalViewError::InvalidWindow(format!("Invalid date format '{}'. Expected YYYY-MM-DD", s))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, m, d).unwrap()
    }

    #[test]
    fn test_new_rejects_end_before_start() {
        assert!(matches!(
            DateRange::new(date(3, 2), date(3, 1)),
            Err(CalViewError::InvalidWindow(_))
        ));
    }

    #[test]
    fn test_from_bounds_defaults_to_single_day() {
        let range = DateRange::from_bounds(Some(date(3, 4)), None).unwrap();
        assert_eq!(range, DateRange::day(date(3, 4)));
        assert!(DateRange::from_bounds(None, Some(date(3, 4))).is_err());
    }

    #[test]
    fn test_touches_adjacent_and_overlapping() {
        let a = DateRange::parse("2025-03-01", "2025-03-02").unwrap();
        let adjacent = DateRange::parse("2025-03-03", "2025-03-05").unwrap();
        let gap = DateRange::parse("2025-03-04", "2025-03-05").unwrap();
        assert!(a.touches(&adjacent));
        assert!(!a.touches(&gap));
        assert!(!a.overlaps(&adjacent));
    }

    #[test]
    fn test_iter_days_is_inclusive() {
        let range = DateRange::parse("2025-02-27", "2025-03-02").unwrap();
        let days: Vec<_> = range.iter_days().collect();
        assert_eq!(days.len() as i64, range.len_days());
        assert_eq!(days.first(), Some(&date(2, 27)));
        assert_eq!(days.last(), Some(&date(3, 2)));
    }

    #[test]
    fn test_parse_rejects_bad_format() {
        assert!(DateRange::parse("03/01/2025", "2025-03-02").is_err());
    }
}

//! Concrete event occurrences as displayed by views.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::date_range::DateRange;
use crate::event::EventId;

/// Cache key of an occurrence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OccurrenceId {
    pub event_id: EventId,
    pub start: DateTime<Utc>,
}

/// One concrete instance of an event.
///
/// All-day occurrences hold midnight UTC of their first and last day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub event_id: EventId,
    pub calendar: String,
    pub recurrence_id: Option<DateTime<Utc>>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
    pub label: String,
}

impl Occurrence {
    pub fn id(&self) -> OccurrenceId {
        OccurrenceId {
            event_id: self.event_id.clone(),
            start: self.start,
        }
    }

    /// Display order: start, then case-insensitive label, then event id.
    pub fn display_cmp(&self, other: &Occurrence) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| {
                let a = self.label.chars().flat_map(char::to_lowercase);
                let b = other.label.chars().flat_map(char::to_lowercase);
                a.cmp(b)
            })
            .then_with(|| self.event_id.cmp(&other.event_id))
    }

    /// Whether both values are the same displayed item.
    /// Label and other content are deliberately not compared.
    pub fn same_item(&self, other: &Occurrence) -> bool {
        self.start == other.start && self.end == other.end && self.event_id == other.event_id
    }

    /// Whether the content shown for an item differs.
    pub fn content_differs(&self, other: &Occurrence) -> bool {
        self.label != other.label
            || self.all_day != other.all_day
            || self.calendar != other.calendar
            || self.recurrence_id != other.recurrence_id
    }

    /// Days this occurrence is visible on.
    pub fn days(&self) -> DateRange {
        let first = self.start.date_naive();
        let last = if self.all_day || self.end <= self.start {
            self.end.date_naive()
        } else {
            // `end` is exclusive for timed occurrences
            (self.end - Duration::seconds(1)).date_naive()
        };
        DateRange::ordered(first, last.max(first))
    }
}

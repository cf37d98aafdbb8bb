//! RRULE expansion for recurring events.
//!
//! Expands a master recurring event into concrete occurrences within a span
//! of instants, honouring EXDATEs and per-instance overrides.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rrule::RRuleSet;

use crate::error::{CalViewError, CalViewResult};
use crate::event::{Event, EventTime};
use crate::occurrence::Occurrence;

/// Upper bound on instances produced by one expansion.
const MAX_INSTANCES: u16 = 1000;

fn ics_time(prefix: &str, time: &EventTime) -> String {
    // The rrule parser needs a datetime, so all-day dates become midnight UTC
    match time {
        EventTime::Date(d) => format!("{}:{}T000000Z", prefix, d.format("%Y%m%d")),
        EventTime::DateTime(dt) => format!("{}:{}", prefix, dt.format("%Y%m%dT%H%M%SZ")),
    }
}

fn build_rrule_string(master: &Event) -> Option<String> {
    let recurrence = master.recurrence.as_ref()?;
    let mut lines = vec![
        ics_time("DTSTART", &master.start),
        format!("RRULE:{}", recurrence.rrule),
    ];
    lines.extend(recurrence.exdates.iter().map(|t| ics_time("EXDATE", t)));
    Some(lines.join("\n"))
}

/// Occurrence for a non-recurring event, or for one instance of a series.
pub fn occurrence_of(event: &Event, start: DateTime<Utc>) -> Occurrence {
    let span = event.end.to_utc() - event.start.to_utc();
    Occurrence {
        event_id: event.id.clone(),
        calendar: event.calendar.clone(),
        recurrence_id: event.recurrence_id,
        start,
        end: start + span,
        all_day: event.is_all_day(),
        label: event.summary.clone(),
    }
}

/// Expand `master` into the occurrences starting within `[from, to]`.
///
/// `overrides` maps recurrence ids to override events that replace the
/// generated instance. A non-recurring master yields itself when it starts in
/// the span.
pub fn expand(
    master: &Event,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    overrides: &HashMap<DateTime<Utc>, Event>,
) -> CalViewResult<Vec<Occurrence>> {
    let Some(rrule_str) = build_rrule_string(master) else {
        let start = master.start.to_utc();
        return Ok(if start >= from && start <= to {
            vec![occurrence_of(master, start)]
        } else {
            Vec::new()
        });
    };

    let rrule_set: RRuleSet = rrule_str.parse().map_err(|e| {
        CalViewError::StorageFailure(format!(
            "Failed to parse RRULE for event '{}': {}",
            master.id, e
        ))
    })?;

    // after/before are exclusive; widen by a second to make the span inclusive.
    let tz: rrule::Tz = Utc.into();
    let after = (from - Duration::seconds(1)).with_timezone(&tz);
    let before = (to + Duration::seconds(1)).with_timezone(&tz);

    let result = rrule_set.after(after).before(before).all(MAX_INSTANCES);

    let occurrences = result
        .dates
        .iter()
        .map(|dt| dt.with_timezone(&Utc))
        .map(|start| match overrides.get(&start) {
            Some(exception) => occurrence_of(exception, exception.start.to_utc()),
            None => Occurrence {
                recurrence_id: Some(start),
                ..occurrence_of(master, start)
            },
        })
        .collect();

    Ok(occurrences)
}

//! In-memory event store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::date_range::DateRange;
use crate::error::{CalViewError, CalViewResult};
use crate::event::{Event, EventId};
use crate::occurrence::Occurrence;
use crate::recurrence::{expand, occurrence_of};
use crate::storage::{EventStore, LoadRequest, LoadResult};

/// How far ahead `next_occurrence` looks for a recurring instance.
const NEXT_OCCURRENCE_HORIZON_DAYS: i64 = 366 * 10;

#[derive(Default)]
struct StoreData {
    masters: HashMap<EventId, Event>,
    /// Single-instance overrides, by event and recurrence id.
    overrides: HashMap<EventId, HashMap<DateTime<Utc>, Event>>,
}

/// Event store held in memory. Clones share the same data, so a caller can
/// keep a clone to mutate events while the original lives in the storage
/// worker.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<StoreData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: impl IntoIterator<Item = Event>) -> CalViewResult<Self> {
        let store = Self::new();
        for event in events {
            store.insert(event)?;
        }
        Ok(store)
    }

    /// Insert or replace an event. Events with a recurrence id are stored as
    /// overrides of their series.
    pub fn insert(&self, event: Event) -> CalViewResult<()> {
        let mut data = self.write()?;
        match event.recurrence_id {
            Some(instance) => {
                data.overrides
                    .entry(event.id.clone())
                    .or_default()
                    .insert(instance, event);
            }
            None => {
                data.masters.insert(event.id.clone(), event);
            }
        }
        Ok(())
    }

    /// Remove an event together with its overrides.
    pub fn remove(&self, id: &EventId) -> CalViewResult<bool> {
        let mut data = self.write()?;
        data.overrides.remove(id);
        Ok(data.masters.remove(id).is_some())
    }

    pub fn len(&self) -> usize {
        self.read().map(|d| d.masters.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> CalViewResult<RwLockReadGuard<'_, StoreData>> {
        self.inner
            .read()
            .map_err(|_| CalViewError::StorageFailure("event store lock poisoned".into()))
    }

    fn write(&self) -> CalViewResult<RwLockWriteGuard<'_, StoreData>> {
        self.inner
            .write()
            .map_err(|_| CalViewError::StorageFailure("event store lock poisoned".into()))
    }
}

impl StoreData {
    fn overrides_of(&self, id: &EventId) -> HashMap<DateTime<Utc>, Event> {
        self.overrides.get(id).cloned().unwrap_or_default()
    }

    fn load_range(&self, range: &DateRange, result: &mut LoadResult) -> CalViewResult<()> {
        let from = range.start().and_time(NaiveTime::MIN).and_utc();
        let to = range.end().and_hms_opt(23, 59, 59).map(|t| t.and_utc()).unwrap_or(from);

        for master in self.masters.values() {
            // Catch occurrences that start before the range but run into it.
            let span = (master.end.to_utc() - master.start.to_utc()).max(Duration::zero());
            let overrides = self.overrides_of(&master.id);
            let occurrences = expand(master, from - span, to, &overrides)?;

            let mut added = HashSet::new();
            for occurrence in occurrences {
                if occurrence.days().overlaps(range) {
                    added.insert(occurrence.id());
                    result.add_occurrence(occurrence, range);
                }
            }

            // Instances moved onto these days from outside the expanded span.
            for exception in overrides.values() {
                let moved = occurrence_of(exception, exception.start.to_utc());
                if moved.days().overlaps(range) && added.insert(moved.id()) {
                    result.add_occurrence(moved, range);
                }
            }

            let visible = !added.is_empty();
            if visible {
                result.events.insert(master.id.clone(), master.clone());
            }
        }

        result.ranges.push(*range);
        Ok(())
    }

    fn next_occurrence(
        &self,
        event_id: &EventId,
        recurrence_id: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
    ) -> CalViewResult<Occurrence> {
        let master = self
            .masters
            .get(event_id)
            .ok_or_else(|| CalViewError::EventNotFound(event_id.clone()))?;
        let overrides = self.overrides_of(event_id);

        if let Some(instance) = recurrence_id {
            if let Some(exception) = overrides.get(&instance) {
                return Ok(occurrence_of(exception, exception.start.to_utc()));
            }
            if !master.is_recurring() {
                return Ok(occurrence_of(master, master.start.to_utc()));
            }
            return expand(master, instance, instance, &overrides)?
                .into_iter()
                .next()
                .ok_or_else(|| CalViewError::EventNotFound(event_id.clone()));
        }

        let from = match after {
            Some(after) => after + Duration::seconds(1),
            None => master.start.to_utc(),
        };
        let to = from + Duration::days(NEXT_OCCURRENCE_HORIZON_DAYS);

        expand(master, from, to, &overrides)?
            .into_iter()
            .filter(|o| o.start >= from)
            .min_by(|a, b| a.display_cmp(b))
            .ok_or_else(|| CalViewError::EventNotFound(event_id.clone()))
    }
}

impl EventStore for MemoryStore {
    fn load(&mut self, request: &LoadRequest) -> CalViewResult<LoadResult> {
        let data = self.read()?;
        let mut result = LoadResult::default();

        for range in &request.ranges {
            data.load_range(range, &mut result)?;
        }

        for id in &request.identifiers {
            match data.next_occurrence(id, None, None) {
                Ok(anchor) => {
                    if let Some(event) = data.masters.get(id) {
                        result.events.insert(id.clone(), event.clone());
                    }
                    result.add_anchor(anchor);
                }
                Err(CalViewError::EventNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(result)
    }

    fn next_occurrence(
        &mut self,
        event_id: &EventId,
        recurrence_id: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
    ) -> CalViewResult<Occurrence> {
        self.read()?.next_occurrence(event_id, recurrence_id, after)
    }
}

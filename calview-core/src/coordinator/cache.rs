//! Loaded occurrence data of one scope.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;

use crate::date_range::DateRange;
use crate::event::{Event, EventId};
use crate::occurrence::{Occurrence, OccurrenceId};
use crate::storage::LoadResult;

#[derive(Default)]
pub(crate) struct OccurrenceCache {
    events: HashMap<EventId, Event>,
    occurrences: HashMap<OccurrenceId, Arc<Occurrence>>,
    daily: BTreeMap<NaiveDate, BTreeSet<OccurrenceId>>,
    anchors: HashMap<EventId, OccurrenceId>,
}

impl OccurrenceCache {
    pub fn clear(&mut self) {
        *self = OccurrenceCache::default();
    }

    /// Fold a load result in. Days covered by the result replace what was
    /// cached for them; occurrences no longer reachable are dropped.
    pub fn absorb(&mut self, result: LoadResult) {
        for range in &result.ranges {
            self.daily.retain(|day, _| !range.contains(*day));
        }
        for (day, ids) in result.daily {
            self.daily.entry(day).or_default().extend(ids);
        }
        for (id, occurrence) in result.occurrences {
            self.occurrences.insert(id, Arc::new(occurrence));
        }
        self.anchors.extend(result.anchors);
        self.events.extend(result.events);
        self.prune();
    }

    pub fn forget_anchor(&mut self, id: &EventId) {
        if self.anchors.remove(id).is_some() {
            self.prune();
        }
    }

    /// Drop occurrences referenced by neither a day nor an anchor, and events
    /// left without occurrences.
    fn prune(&mut self) {
        let reachable: HashSet<&OccurrenceId> = self
            .daily
            .values()
            .flatten()
            .chain(self.anchors.values())
            .collect();
        self.occurrences.retain(|id, _| reachable.contains(id));

        let owners: HashSet<&EventId> = self.occurrences.keys().map(|id| &id.event_id).collect();
        self.events.retain(|id, _| owners.contains(id));
    }

    /// Every cached occurrence visible on a day of `range`, unordered.
    pub fn in_window(&self, range: &DateRange) -> Vec<Arc<Occurrence>> {
        let ids: BTreeSet<&OccurrenceId> = self
            .daily
            .range(range.start()..=range.end())
            .flat_map(|(_, ids)| ids)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.occurrences.get(id))
            .cloned()
            .collect()
    }

    pub fn anchors(&self, ids: &[EventId]) -> Vec<Arc<Occurrence>> {
        ids.iter()
            .filter_map(|id| self.anchors.get(id))
            .filter_map(|id| self.occurrences.get(id))
            .cloned()
            .collect()
    }

    pub fn event(&self, id: &EventId) -> Option<&Event> {
        self.events.get(id)
    }
}

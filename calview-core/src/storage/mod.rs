//! Boundary to the event storage engine.
//!
//! The coordinator never touches storage directly. It builds a [`LoadRequest`],
//! hands it to the storage context through a [`StorageHandle`], and merges the
//! returned [`LoadResult`] once the request completes.

mod memory;
mod worker;

pub use memory::MemoryStore;
pub use worker::{StorageHandle, StorageWorker};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};

use crate::coordinator::ScopeId;
use crate::date_range::DateRange;
use crate::error::CalViewResult;
use crate::event::{Event, EventId};
use crate::occurrence::{Occurrence, OccurrenceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A batch of data missing from one scope's cache.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub id: BatchId,
    pub scope: ScopeId,
    /// Disjoint, non-adjacent day ranges in ascending order.
    pub ranges: Vec<DateRange>,
    /// Events wanted regardless of the days they fall on.
    pub identifiers: Vec<EventId>,
    /// The scope was invalidated; results replace the cache instead of
    /// extending it.
    pub full_reset: bool,
}

/// What the storage engine produced for a [`LoadRequest`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadResult {
    /// Ranges whose occurrences are fully contained in this result.
    pub ranges: Vec<DateRange>,
    /// Requested identifiers that were found.
    pub identifiers: Vec<EventId>,
    pub events: HashMap<EventId, Event>,
    pub occurrences: HashMap<OccurrenceId, Occurrence>,
    /// Occurrences active on each loaded day.
    pub daily: BTreeMap<NaiveDate, BTreeSet<OccurrenceId>>,
    /// Representative occurrence of each resolved identifier.
    pub anchors: HashMap<EventId, OccurrenceId>,
}

impl LoadResult {
    /// Record an occurrence under every loaded day it is visible on.
    pub fn add_occurrence(&mut self, occurrence: Occurrence, within: &DateRange) {
        let id = occurrence.id();
        for day in occurrence.days().iter_days() {
            if within.contains(day) {
                self.daily.entry(day).or_default().insert(id.clone());
            }
        }
        self.occurrences.insert(id, occurrence);
    }

    /// Record the anchor occurrence of an identifier lookup.
    pub fn add_anchor(&mut self, occurrence: Occurrence) {
        let id = occurrence.id();
        self.identifiers.push(occurrence.event_id.clone());
        self.anchors.insert(occurrence.event_id.clone(), id.clone());
        self.occurrences.insert(id, occurrence);
    }
}

/// A blocking event store, driven from the storage context only.
pub trait EventStore: Send + 'static {
    /// Load everything the request asks for. Identifiers that do not exist
    /// are left out of [`LoadResult::identifiers`] rather than failing.
    fn load(&mut self, request: &LoadRequest) -> CalViewResult<LoadResult>;

    /// Next occurrence of an event: the instance at `recurrence_id` when one
    /// is given, otherwise the first instance starting after `after` (or the
    /// first instance at all).
    fn next_occurrence(
        &mut self,
        event_id: &EventId,
        recurrence_id: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
    ) -> CalViewResult<Occurrence>;
}

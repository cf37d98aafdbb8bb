//! Set of already-loaded date ranges.
//!
//! A [`RangeSet`] keeps its ranges sorted by start day with no two ranges
//! overlapping or adjacent. The set is never edited in place: [`RangeSet::merge`]
//! returns a new set, so a scope swaps its cache in one assignment.

use serde::{Deserialize, Serialize};

use crate::date_range::DateRange;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: Vec<DateRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        RangeSet { ranges: Vec::new() }
    }

    /// Normalise an arbitrary list of ranges into a set.
    pub fn from_ranges(ranges: &[DateRange]) -> Self {
        RangeSet::new().merge(ranges)
    }

    pub fn ranges(&self) -> &[DateRange] {
        &self.ranges
    }

    pub fn into_ranges(self) -> Vec<DateRange> {
        self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Union of this set and `additions`.
    ///
    /// All ranges are sorted by start and folded left to right; a range that
    /// overlaps the running range or starts on the day after it extends it.
    pub fn merge(&self, additions: &[DateRange]) -> RangeSet {
        debug_assert!(self.is_well_formed(), "merge on malformed set {:?}", self);

        let mut all: Vec<DateRange> = Vec::with_capacity(self.ranges.len() + additions.len());
        all.extend_from_slice(&self.ranges);
        all.extend_from_slice(additions);
        all.sort_by_key(|r| r.start());

        let mut merged: Vec<DateRange> = Vec::with_capacity(all.len());
        let mut iter = all.into_iter();
        let Some(mut running) = iter.next() else {
            return RangeSet::new();
        };

        for next in iter {
            if running.touches(&next) {
                if next.end() > running.end() {
                    running = DateRange::ordered(running.start(), next.end());
                }
            } else {
                merged.push(running);
                running = next;
            }
        }
        merged.push(running);

        let result = RangeSet { ranges: merged };
        debug_assert!(result.is_well_formed());
        result
    }

    /// Maximal sub-ranges of `query` not covered by this set, in order.
    pub fn gaps(&self, query: &DateRange) -> Vec<DateRange> {
        let mut gaps = Vec::new();

        // Skip ranges that end before the query starts.
        let lo = self.ranges.partition_point(|r| r.end() < query.start());

        let mut cursor = query.start();
        for range in &self.ranges[lo..] {
            if range.start() > query.end() {
                break;
            }
            if range.start() > cursor {
                if let Some(before) = range.start().pred_opt() {
                    gaps.push(DateRange::ordered(cursor, before));
                }
            }
            if range.end() >= cursor {
                match range.end().succ_opt() {
                    Some(after) => cursor = after,
                    None => return gaps,
                }
            }
        }

        if cursor <= query.end() {
            gaps.push(DateRange::ordered(cursor, query.end()));
        }

        gaps
    }

    /// True when no day of `query` is missing.
    pub fn covers(&self, query: &DateRange) -> bool {
        let idx = self.ranges.partition_point(|r| r.end() < query.start());
        self.ranges
            .get(idx)
            .is_some_and(|r| r.start() <= query.start() && r.end() >= query.end())
    }

    fn is_well_formed(&self) -> bool {
        self.ranges.windows(2).all(|pair| !pair[0].touches(&pair[1]))
    }
}

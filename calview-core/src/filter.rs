//! View-level display filters applied before reconciliation.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::date_range::DateRange;
use crate::occurrence::Occurrence;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewFilter {
    /// Keep only all-day occurrences.
    #[serde(default)]
    pub all_day_only: bool,
    /// Keep only the earliest occurrence of each calendar.
    #[serde(default)]
    pub first_per_calendar: bool,
}

impl ViewFilter {
    pub fn all_day_only() -> Self {
        ViewFilter {
            all_day_only: true,
            ..Default::default()
        }
    }

    pub fn first_per_calendar() -> Self {
        ViewFilter {
            first_per_calendar: true,
            ..Default::default()
        }
    }

    /// Filter and sort candidate occurrences into display order.
    ///
    /// `window` drops occurrences not visible on any day of the window;
    /// all-day occurrences count their end day as visible.
    pub fn apply(
        &self,
        window: Option<&DateRange>,
        candidates: impl IntoIterator<Item = Arc<Occurrence>>,
    ) -> Vec<Arc<Occurrence>> {
        let mut kept: Vec<Arc<Occurrence>> = candidates
            .into_iter()
            .filter(|o| window.is_none_or(|w| o.days().overlaps(w)))
            .filter(|o| !self.all_day_only || o.all_day)
            .collect();

        kept.sort_by(|a, b| a.display_cmp(b));

        if self.first_per_calendar {
            let mut seen = HashSet::new();
            kept.retain(|o| seen.insert(o.calendar.clone()));
        }

        kept
    }
}

//! Load coordination across views.
//!
//! [`LoadCoordinator`] owns one [`RangeSet`] and occurrence cache per scope
//! plus the state of every registered view. It is a plain state machine:
//! callers feed it view changes, timer ticks and load completions together
//! with the current instant, and it returns the batches to dispatch. The
//! async driver in [`service`] wires it to timers and the storage worker.
//!
//! Per scope the phases are:
//!
//! ```text
//! Idle -> Dirty -> AwaitingBatch -> Loading -> Idle
//! ```
//!
//! `Dirty` runs a restartable debounce deadline. When it passes, every dirty
//! view is checked against the cache; covered views are served right away
//! and the gaps of the rest become one [`LoadRequest`]. Only one batch per
//! scope is outstanding at a time. Its completion merges into the cache and
//! re-serves every view of the scope.

mod cache;
mod service;

pub use service::{CoordinatorHandle, CoordinatorService};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::CoordinatorConfig;
use crate::date_range::DateRange;
use crate::error::CalViewResult;
use crate::event::{Event, EventId};
use crate::filter::ViewFilter;
use crate::occurrence::Occurrence;
use crate::range_set::RangeSet;
use crate::reconcile::reconcile;
use crate::storage::{BatchId, LoadRequest, LoadResult};
use crate::view::{ViewId, ViewRequest, ViewState, ViewUpdate};
use cache::OccurrenceCache;

/// Independent cache grouping, e.g. "agenda" or "search".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(String);

impl ScopeId {
    pub fn new(name: impl Into<String>) -> Self {
        ScopeId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ScopeId {
    fn from(name: &str) -> Self {
        ScopeId(name.to_string())
    }
}

impl From<String> for ScopeId {
    fn from(name: String) -> Self {
        ScopeId(name)
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopePhase {
    Idle,
    Dirty,
    AwaitingBatch,
    Loading,
}

struct PendingBatch {
    id: BatchId,
    identifiers: Vec<EventId>,
    full_reset: bool,
    dispatched: bool,
}

#[derive(Default)]
struct ScopeState {
    loaded: RangeSet,
    /// Identifiers the store has answered for, found or not.
    known: HashSet<EventId>,
    absent: HashSet<EventId>,
    cache: OccurrenceCache,
    deadline: Option<Instant>,
    batch: Option<PendingBatch>,
    needs_full_reload: bool,
    reset_during_load: bool,
}

impl ScopeState {
    fn phase(&self) -> ScopePhase {
        match (&self.batch, self.deadline) {
            (Some(batch), _) if batch.dispatched => ScopePhase::Loading,
            (Some(_), _) => ScopePhase::AwaitingBatch,
            (None, Some(_)) => ScopePhase::Dirty,
            (None, None) => ScopePhase::Idle,
        }
    }

    fn schedule(&mut self, at: Instant) {
        self.deadline = Some(self.deadline.map_or(at, |current| current.min(at)));
    }

    /// What a view still needs before it can be served.
    fn missing_for(&self, request: &ViewRequest) -> Missing {
        match request {
            ViewRequest::Unset | ViewRequest::InvalidWindow => Missing::default(),
            ViewRequest::Window(range) if self.needs_full_reload => Missing {
                ranges: vec![*range],
                identifiers: Vec::new(),
            },
            ViewRequest::Window(range) => Missing {
                ranges: self.loaded.gaps(range),
                identifiers: Vec::new(),
            },
            ViewRequest::Identifiers(ids) => Missing {
                ranges: Vec::new(),
                identifiers: ids
                    .iter()
                    .filter(|id| self.needs_full_reload || !self.known.contains(*id))
                    .cloned()
                    .collect(),
            },
        }
    }
}

#[derive(Default)]
struct Missing {
    ranges: Vec<DateRange>,
    identifiers: Vec<EventId>,
}

impl Missing {
    fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.identifiers.is_empty()
    }
}

pub struct LoadCoordinator {
    config: CoordinatorConfig,
    scopes: HashMap<ScopeId, ScopeState>,
    views: BTreeMap<ViewId, ViewState>,
    next_view_id: u64,
    next_batch_id: u64,
}

impl LoadCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        LoadCoordinator {
            config,
            scopes: HashMap::new(),
            views: BTreeMap::new(),
            next_view_id: 1,
            next_batch_id: 1,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // VIEW REGISTRATION:

    pub fn register(
        &mut self,
        scope: ScopeId,
        filter: ViewFilter,
        notifier: mpsc::UnboundedSender<ViewUpdate>,
    ) -> ViewId {
        let id = ViewId(self.next_view_id);
        self.next_view_id += 1;

        self.scopes.entry(scope.clone()).or_default();
        debug!(view = %id, scope = %scope, "view registered");
        self.views.insert(id, ViewState::new(scope, filter, notifier));
        id
    }

    /// Forget a view. Work already in flight for it completes unobserved.
    pub fn unregister(&mut self, view: ViewId) {
        if self.views.remove(&view).is_some() {
            debug!(view = %view, "view unregistered");
        }
    }

    pub fn set_window(
        &mut self,
        view: ViewId,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        now: Instant,
    ) {
        let Some(state) = self.views.get_mut(&view) else {
            trace!(view = %view, "window change for unknown view");
            return;
        };

        match DateRange::from_bounds(start, end) {
            Ok(window) => {
                if state.already_serving(&window) {
                    return;
                }
                state.request = ViewRequest::Window(window);
                self.mark_dirty(view, now);
            }
            Err(e) => {
                debug!(view = %view, error = %e, "serving empty list for invalid window");
                state.request = ViewRequest::InvalidWindow;
                self.serve_now(view);
            }
        }
    }

    pub fn set_identifiers(&mut self, view: ViewId, ids: Vec<EventId>, now: Instant) {
        let Some(state) = self.views.get_mut(&view) else {
            trace!(view = %view, "identifier change for unknown view");
            return;
        };

        let mut seen = HashSet::new();
        let ids: Vec<EventId> = ids.into_iter().filter(|id| seen.insert(id.clone())).collect();
        let request = ViewRequest::Identifiers(ids);
        if !state.dirty && state.request == request {
            return;
        }
        state.request = request;
        self.mark_dirty(view, now);
    }

    pub fn set_filter(&mut self, view: ViewId, filter: ViewFilter, now: Instant) {
        let Some(state) = self.views.get_mut(&view) else {
            return;
        };
        if state.filter == filter {
            return;
        }
        state.filter = filter;
        self.mark_dirty(view, now);
    }

    /// The store changed structurally: drop what `scope` (or every scope)
    /// has loaded and reload every view's current request.
    pub fn reset(&mut self, scope: Option<&ScopeId>, now: Instant) {
        let debounce = self.config.debounce;
        for (id, state) in self.scopes.iter_mut() {
            if scope.is_some_and(|s| s != id) {
                continue;
            }
            info!(scope = %id, in_flight = state.batch.is_some(), "scope reset");
            state.loaded = RangeSet::new();
            state.known.clear();
            state.absent.clear();
            state.needs_full_reload = true;
            if state.batch.is_some() {
                state.reset_during_load = true;
            }
            state.deadline = Some(now + debounce);
        }

        for view in self.views.values_mut() {
            if scope.is_none_or(|s| *s == view.scope) {
                view.dirty = true;
            }
        }
    }

    // TIMER + BATCHES:

    /// Earliest instant at which [`poll_due`](Self::poll_due) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scopes.values().filter_map(|s| s.deadline).min()
    }

    /// Run the dirty cycle of every scope whose debounce has elapsed.
    pub fn poll_due(&mut self, now: Instant) -> Vec<LoadRequest> {
        let mut due: Vec<ScopeId> = self
            .scopes
            .iter()
            .filter(|(_, s)| s.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();

        due.into_iter()
            .filter_map(|scope| self.run_cycle(&scope))
            .collect()
    }

    fn run_cycle(&mut self, scope_id: &ScopeId) -> Option<LoadRequest> {
        let scope = self.scopes.get_mut(scope_id)?;
        scope.deadline = None;

        let mut gaps = Vec::new();
        let mut wanted: BTreeSet<EventId> = BTreeSet::new();
        let mut dead = Vec::new();

        for (id, view) in self.views.iter_mut() {
            if view.scope != *scope_id || !view.dirty {
                continue;
            }
            let missing = scope.missing_for(&view.request);
            if missing.is_empty() {
                if !serve(scope, view) {
                    dead.push(*id);
                }
            } else {
                gaps.extend(missing.ranges);
                wanted.extend(missing.identifiers);
            }
        }
        self.drop_views(dead);

        let scope = self.scopes.get_mut(scope_id)?;
        if gaps.is_empty() && wanted.is_empty() {
            return None;
        }
        if scope.batch.is_some() {
            trace!(scope = %scope_id, "batch in flight, dirty views wait for it");
            return None;
        }

        let full_reset = scope.needs_full_reload;
        let (ranges, identifiers) = if full_reset {
            self.full_reload_targets(scope_id)
        } else {
            (RangeSet::from_ranges(&gaps).into_ranges(), wanted.into_iter().collect())
        };

        let id = BatchId(self.next_batch_id);
        self.next_batch_id += 1;

        let scope = self.scopes.get_mut(scope_id)?;
        scope.needs_full_reload = false;
        scope.batch = Some(PendingBatch {
            id,
            identifiers: identifiers.clone(),
            full_reset,
            dispatched: false,
        });

        info!(
            scope = %scope_id,
            batch = %id,
            ranges = ranges.len(),
            identifiers = identifiers.len(),
            full_reset,
            "batch built"
        );

        Some(LoadRequest {
            id,
            scope: scope_id.clone(),
            ranges,
            identifiers,
            full_reset,
        })
    }

    /// Every current window and identifier of the scope's views.
    fn full_reload_targets(&self, scope_id: &ScopeId) -> (Vec<DateRange>, Vec<EventId>) {
        let mut windows = Vec::new();
        let mut identifiers = BTreeSet::new();
        for view in self.views.values().filter(|v| v.scope == *scope_id) {
            match &view.request {
                ViewRequest::Window(range) => windows.push(*range),
                ViewRequest::Identifiers(ids) => identifiers.extend(ids.iter().cloned()),
                ViewRequest::Unset | ViewRequest::InvalidWindow => {}
            }
        }
        (
            RangeSet::from_ranges(&windows).into_ranges(),
            identifiers.into_iter().collect(),
        )
    }

    /// The batch has been handed to the storage context.
    pub fn mark_dispatched(&mut self, batch: BatchId) {
        if let Some(pending) = self
            .scopes
            .values_mut()
            .filter_map(|s| s.batch.as_mut())
            .find(|b| b.id == batch)
        {
            pending.dispatched = true;
        }
    }

    /// Fold a finished batch in and re-serve every view of its scope.
    pub fn complete(&mut self, batch: BatchId, result: CalViewResult<LoadResult>, now: Instant) {
        let Some(scope_id) = self
            .scopes
            .iter()
            .find(|(_, s)| s.batch.as_ref().is_some_and(|b| b.id == batch))
            .map(|(id, _)| id.clone())
        else {
            debug!(batch = %batch, "completion for unknown batch ignored");
            return;
        };
        let debounce = self.config.debounce;
        let retry_delay = self.config.retry_delay;

        let Some(scope) = self.scopes.get_mut(&scope_id) else {
            return;
        };
        let Some(pending) = scope.batch.take() else {
            return;
        };

        if scope.reset_during_load {
            info!(scope = %scope_id, batch = %batch, "scope was reset during load, reloading");
            scope.reset_during_load = false;
            scope.needs_full_reload = true;
            scope.schedule(now + debounce);
            return;
        }

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    scope = %scope_id,
                    batch = %batch,
                    error = %e,
                    transient = e.is_transient(),
                    retry_in = ?retry_delay,
                    "load failed, views stay dirty"
                );
                if pending.full_reset {
                    scope.needs_full_reload = true;
                }
                scope.schedule(now + retry_delay);
                return;
            }
        };

        if pending.full_reset {
            scope.loaded = RangeSet::new();
            scope.known.clear();
            scope.absent.clear();
            scope.cache.clear();
        }

        scope.loaded = scope.loaded.merge(&result.ranges);

        let resolved: HashSet<&EventId> = result.identifiers.iter().collect();
        let mut absent = Vec::new();
        for id in &pending.identifiers {
            if resolved.contains(id) {
                scope.absent.remove(id);
            } else {
                absent.push(id.clone());
            }
            scope.known.insert(id.clone());
        }
        for id in &absent {
            scope.cache.forget_anchor(id);
            scope.absent.insert(id.clone());
        }

        info!(
            scope = %scope_id,
            batch = %batch,
            loaded_ranges = scope.loaded.len(),
            resolved = resolved.len(),
            absent = absent.len(),
            "batch merged"
        );
        scope.cache.absorb(result);

        self.reevaluate(&scope_id, now);
    }

    /// Serve every covered view of the scope; the rest go back to dirty.
    fn reevaluate(&mut self, scope_id: &ScopeId, now: Instant) {
        let debounce = self.config.debounce;
        let Some(scope) = self.scopes.get_mut(scope_id) else {
            return;
        };

        let mut dead = Vec::new();
        let mut pending = false;
        for (id, view) in self.views.iter_mut() {
            if view.scope != *scope_id {
                continue;
            }
            if scope.missing_for(&view.request).is_empty() {
                if !serve(scope, view) {
                    dead.push(*id);
                }
            } else {
                view.dirty = true;
                pending = true;
            }
        }
        if pending {
            scope.schedule(now + debounce);
        }
        self.drop_views(dead);
    }

    fn mark_dirty(&mut self, view: ViewId, now: Instant) {
        let Some(state) = self.views.get_mut(&view) else {
            return;
        };
        state.dirty = true;
        if let Some(scope) = self.scopes.get_mut(&state.scope) {
            // Restart the debounce.
            scope.deadline = Some(now + self.config.debounce);
        }
    }

    fn serve_now(&mut self, view: ViewId) {
        let Some(state) = self.views.get_mut(&view) else {
            return;
        };
        let Some(scope) = self.scopes.get(&state.scope) else {
            return;
        };
        if !serve(scope, state) {
            self.drop_views(vec![view]);
        }
    }

    fn drop_views(&mut self, dead: Vec<ViewId>) {
        for view in dead {
            debug!(view = %view, "view receiver gone, unregistering");
            self.views.remove(&view);
        }
    }

    // INSPECTION:

    pub fn phase(&self, scope: &ScopeId) -> ScopePhase {
        self.scopes.get(scope).map_or(ScopePhase::Idle, ScopeState::phase)
    }

    pub fn loaded(&self, scope: &ScopeId) -> Option<&RangeSet> {
        self.scopes.get(scope).map(|s| &s.loaded)
    }

    pub fn is_known_absent(&self, scope: &ScopeId, id: &EventId) -> bool {
        self.scopes.get(scope).is_some_and(|s| s.absent.contains(id))
    }

    pub fn event(&self, scope: &ScopeId, id: &EventId) -> Option<&Event> {
        self.scopes.get(scope).and_then(|s| s.cache.event(id))
    }

    pub fn displayed(&self, view: ViewId) -> Option<&[Arc<Occurrence>]> {
        self.views.get(&view).map(|v| v.displayed.as_slice())
    }

    pub fn is_dirty(&self, view: ViewId) -> bool {
        self.views.get(&view).is_some_and(|v| v.dirty)
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }
}

/// Reconcile a view against the cache and notify it if anything changed.
/// Returns false when the view's receiver has gone away.
fn serve(scope: &ScopeState, view: &mut ViewState) -> bool {
    let (incoming, missing) = match &view.request {
        ViewRequest::Unset | ViewRequest::InvalidWindow => (Vec::new(), Vec::new()),
        ViewRequest::Window(range) => (
            view.filter.apply(Some(range), scope.cache.in_window(range)),
            Vec::new(),
        ),
        ViewRequest::Identifiers(ids) => {
            let missing: Vec<EventId> = ids
                .iter()
                .filter(|id| scope.absent.contains(*id))
                .cloned()
                .collect();
            (view.filter.apply(None, scope.cache.anchors(ids)), missing)
        }
    };

    let patch = reconcile(&mut view.displayed, incoming);
    view.dirty = false;
    view.last_served = match &view.request {
        ViewRequest::Window(range) => Some(*range),
        _ => None,
    };

    let missing_changed = missing != view.missing;
    view.missing = missing;
    if patch.is_empty() && !patch.changed && !missing_changed {
        return true;
    }

    view.notifier
        .send(ViewUpdate {
            patch,
            missing: view.missing.clone(),
        })
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CalViewError;
    use crate::occurrence::fixtures::occ;
    use std::time::Duration;

    const DEBOUNCE: Duration = Duration::from_millis(5);

    fn coordinator() -> LoadCoordinator {
        LoadCoordinator::new(CoordinatorConfig {
            debounce: DEBOUNCE,
            retry_delay: Duration::from_millis(50),
            storage_timeout: Duration::from_secs(1),
        })
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
    }

    fn range(first: u32, last: u32) -> DateRange {
        DateRange::new(d(first), d(last)).unwrap()
    }

    fn view(
        c: &mut LoadCoordinator,
        scope: &str,
    ) -> (ViewId, mpsc::UnboundedReceiver<ViewUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (c.register(ScopeId::from(scope), ViewFilter::default(), tx), rx)
    }

    /// Result covering `request` with the given occurrences, all on March 20.
    fn answer(request: &LoadRequest, items: Vec<Occurrence>) -> LoadResult {
        let mut result = LoadResult::default();
        for r in &request.ranges {
            for item in items.iter().filter(|o| o.days().overlaps(r)) {
                result.add_occurrence(item.clone(), r);
            }
            result.ranges.push(*r);
        }
        result
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ViewUpdate>) -> Vec<ViewUpdate> {
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update);
        }
        out
    }

    #[test]
    fn test_overlapping_windows_share_one_batch() {
        let mut c = coordinator();
        let (a, _rx_a) = view(&mut c, "agenda");
        let (b, _rx_b) = view(&mut c, "agenda");
        let t0 = Instant::now();

        c.set_window(a, Some(d(1)), Some(d(15)), t0);
        c.set_window(b, Some(d(10)), Some(d(31)), t0 + Duration::from_millis(2));
        assert_eq!(c.phase(&ScopeId::from("agenda")), ScopePhase::Dirty);

        // Debounce restarted by the second change.
        assert!(c.poll_due(t0 + DEBOUNCE).is_empty());

        let batches = c.poll_due(t0 + DEBOUNCE * 2);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].ranges, vec![range(1, 31)]);
        assert!(!batches[0].full_reset);
        assert_eq!(c.phase(&ScopeId::from("agenda")), ScopePhase::AwaitingBatch);

        c.mark_dispatched(batches[0].id);
        assert_eq!(c.phase(&ScopeId::from("agenda")), ScopePhase::Loading);
    }

    #[test]
    fn test_completion_serves_every_view_and_idles() {
        let mut c = coordinator();
        let (a, mut rx_a) = view(&mut c, "agenda");
        let (b, mut rx_b) = view(&mut c, "agenda");
        let t0 = Instant::now();
        c.set_window(a, Some(d(20)), None, t0);
        c.set_window(b, Some(d(18)), Some(d(22)), t0);

        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);
        c.mark_dispatched(batch.id);
        let result = answer(&batch, vec![occ("A", 9), occ("B", 14)]);
        c.complete(batch.id, Ok(result), t0 + DEBOUNCE * 2);

        assert_eq!(c.phase(&ScopeId::from("agenda")), ScopePhase::Idle);
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(c.displayed(a).unwrap().len(), 2);
        assert!(c.loaded(&ScopeId::from("agenda")).unwrap().covers(&range(18, 22)));
    }

    #[test]
    fn test_covered_window_is_served_without_load() {
        let mut c = coordinator();
        let (a, mut rx_a) = view(&mut c, "agenda");
        let t0 = Instant::now();
        c.set_window(a, Some(d(1)), Some(d(31)), t0);
        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);
        c.complete(batch.id, Ok(answer(&batch, vec![occ("A", 9)])), t0 + DEBOUNCE);
        drain(&mut rx_a);

        let t1 = t0 + Duration::from_secs(1);
        c.set_window(a, Some(d(19)), Some(d(21)), t1);
        assert!(c.poll_due(t1 + DEBOUNCE).is_empty());
        assert!(!c.is_dirty(a));
        // Same single occurrence, so nothing changes for the view.
        assert!(drain(&mut rx_a).is_empty());

        c.set_window(a, Some(d(1)), Some(d(10)), t1);
        assert!(c.poll_due(t1 + DEBOUNCE).is_empty());
        let updates = drain(&mut rx_a);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].patch.removed(), 1);
    }

    #[test]
    fn test_same_window_is_a_no_op() {
        let mut c = coordinator();
        let (a, _rx) = view(&mut c, "agenda");
        let t0 = Instant::now();
        c.set_window(a, Some(d(1)), Some(d(2)), t0);
        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);
        c.complete(batch.id, Ok(answer(&batch, vec![])), t0 + DEBOUNCE);
        assert_eq!(c.phase(&ScopeId::from("agenda")), ScopePhase::Idle);

        c.set_window(a, Some(d(1)), Some(d(2)), t0 + DEBOUNCE);
        assert_eq!(c.phase(&ScopeId::from("agenda")), ScopePhase::Idle);
        assert!(c.next_deadline().is_none());
    }

    #[test]
    fn test_invalid_window_served_empty_immediately() {
        let mut c = coordinator();
        let (a, mut rx_a) = view(&mut c, "agenda");
        let t0 = Instant::now();
        c.set_window(a, Some(d(20)), None, t0);
        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);
        c.mark_dispatched(batch.id);

        // Window becomes invalid while its load is in flight.
        c.set_window(a, Some(d(5)), Some(d(1)), t0 + DEBOUNCE);
        assert!(!c.is_dirty(a));

        c.complete(batch.id, Ok(answer(&batch, vec![occ("A", 9)])), t0 + DEBOUNCE * 2);
        assert!(c.displayed(a).unwrap().is_empty());
        assert!(drain(&mut rx_a).is_empty());

        c.set_window(a, None, Some(d(3)), t0 + DEBOUNCE * 2);
        assert!(c.next_deadline().is_none());
    }

    #[test]
    fn test_absent_identifier_is_not_requested_again() {
        let mut c = coordinator();
        let (a, mut rx_a) = view(&mut c, "search");
        let t0 = Instant::now();
        let x = EventId::from("X");

        c.set_identifiers(a, vec![x.clone()], t0);
        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);
        assert_eq!(batch.identifiers, vec![x.clone()]);
        c.complete(batch.id, Ok(LoadResult::default()), t0 + DEBOUNCE);

        assert!(c.is_known_absent(&ScopeId::from("search"), &x));
        let updates = drain(&mut rx_a);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].missing, vec![x.clone()]);

        let (b, _rx_b) = view(&mut c, "search");
        c.set_identifiers(b, vec![x.clone(), x.clone()], t0 + DEBOUNCE);
        assert!(c.poll_due(t0 + DEBOUNCE * 2).is_empty());
    }

    #[test]
    fn test_identifier_view_shows_anchor() {
        let mut c = coordinator();
        let (a, _rx) = view(&mut c, "search");
        let t0 = Instant::now();
        c.set_identifiers(a, vec![EventId::from("A"), EventId::from("B")], t0);
        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);

        let mut result = LoadResult::default();
        result.add_anchor(occ("B", 8));
        result.add_anchor(occ("A", 9));
        c.complete(batch.id, Ok(result), t0 + DEBOUNCE);

        let shown: Vec<_> = c.displayed(a).unwrap().iter().map(|o| o.event_id.as_str()).collect();
        assert_eq!(shown, vec!["B", "A"]);
    }

    #[test]
    fn test_failed_load_keeps_cache_and_retries() {
        let mut c = coordinator();
        let (a, _rx) = view(&mut c, "agenda");
        let t0 = Instant::now();
        c.set_window(a, Some(d(1)), Some(d(7)), t0);
        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);
        c.mark_dispatched(batch.id);

        let failed_at = t0 + DEBOUNCE * 2;
        c.complete(
            batch.id,
            Err(CalViewError::StorageFailure("disk on fire".into())),
            failed_at,
        );

        assert!(c.loaded(&ScopeId::from("agenda")).unwrap().is_empty());
        assert!(c.is_dirty(a));
        assert_eq!(c.phase(&ScopeId::from("agenda")), ScopePhase::Dirty);
        assert!(c.poll_due(failed_at + DEBOUNCE).is_empty());

        let retry = c.poll_due(failed_at + Duration::from_millis(50));
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].ranges, batch.ranges);
    }

    #[test]
    fn test_failed_full_reload_retries_as_full_reload() {
        let mut c = coordinator();
        let scope = ScopeId::from("agenda");
        let (a, _rx_a) = view(&mut c, "agenda");
        let (b, _rx_b) = view(&mut c, "agenda");
        let t0 = Instant::now();
        c.set_window(a, Some(d(1)), Some(d(5)), t0);
        c.set_window(b, Some(d(10)), Some(d(12)), t0);
        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);
        c.complete(batch.id, Ok(answer(&batch, vec![])), t0 + DEBOUNCE);
        c.set_window(a, Some(d(18)), Some(d(22)), t0 + DEBOUNCE);
        let batch = c.poll_due(t0 + DEBOUNCE * 2).remove(0);
        c.complete(batch.id, Ok(answer(&batch, vec![occ("A", 9)])), t0 + DEBOUNCE * 2);
        assert_eq!(c.displayed(a).unwrap().len(), 1);

        let t1 = t0 + Duration::from_secs(1);
        c.reset(Some(&scope), t1);
        let reload = c.poll_due(t1 + DEBOUNCE).remove(0);
        assert!(reload.full_reset);
        c.mark_dispatched(reload.id);

        let failed_at = t1 + DEBOUNCE * 2;
        c.complete(reload.id, Err(CalViewError::StorageTimeout(1)), failed_at);

        // Nothing merged, and what the views show is left alone.
        assert!(c.loaded(&scope).unwrap().is_empty());
        assert_eq!(c.displayed(a).unwrap().len(), 1);
        assert!(c.is_dirty(a) && c.is_dirty(b));
        assert!(c.poll_due(failed_at + DEBOUNCE).is_empty());

        let retry = c.poll_due(failed_at + Duration::from_millis(50)).remove(0);
        assert!(retry.full_reset);
        assert_eq!(retry.ranges, vec![range(10, 12), range(18, 22)]);

        c.complete(retry.id, Ok(answer(&retry, vec![occ("A", 9)])), failed_at + DEBOUNCE * 20);
        assert!(c.loaded(&scope).unwrap().covers(&range(18, 22)));
        assert!(!c.loaded(&scope).unwrap().covers(&range(1, 5)));
        assert_eq!(c.phase(&scope), ScopePhase::Idle);
    }

    #[test]
    fn test_change_during_load_waits_for_next_cycle() {
        let mut c = coordinator();
        let (a, _rx_a) = view(&mut c, "agenda");
        let (b, _rx_b) = view(&mut c, "agenda");
        let t0 = Instant::now();
        c.set_window(a, Some(d(1)), Some(d(7)), t0);
        let first = c.poll_due(t0 + DEBOUNCE).remove(0);
        c.mark_dispatched(first.id);

        let t1 = t0 + DEBOUNCE;
        c.set_window(b, Some(d(20)), Some(d(25)), t1);
        // Blocked behind the batch in flight.
        assert!(c.poll_due(t1 + DEBOUNCE).is_empty());
        assert!(c.is_dirty(b));

        let t2 = t1 + DEBOUNCE * 2;
        c.complete(first.id, Ok(answer(&first, vec![])), t2);
        assert!(c.is_dirty(b));
        assert!(!c.is_dirty(a));

        let second = c.poll_due(t2 + DEBOUNCE);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].ranges, vec![range(20, 25)]);
    }

    #[test]
    fn test_reset_during_load_reloads_instead_of_merging() {
        let mut c = coordinator();
        let scope = ScopeId::from("agenda");
        let (a, _rx) = view(&mut c, "agenda");
        let (b, _rx_b) = view(&mut c, "agenda");
        let t0 = Instant::now();
        c.set_window(a, Some(d(1)), Some(d(5)), t0);
        c.set_window(b, Some(d(10)), Some(d(12)), t0);
        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);
        c.mark_dispatched(batch.id);

        c.reset(Some(&scope), t0 + DEBOUNCE);
        let t1 = t0 + DEBOUNCE * 2;
        c.complete(batch.id, Ok(answer(&batch, vec![])), t1);
        assert!(c.loaded(&scope).unwrap().is_empty());

        let reload = c.poll_due(t1 + DEBOUNCE).remove(0);
        assert!(reload.full_reset);
        assert_eq!(reload.ranges, vec![range(1, 5), range(10, 12)]);

        c.complete(reload.id, Ok(answer(&reload, vec![])), t1 + DEBOUNCE);
        assert!(c.loaded(&scope).unwrap().covers(&range(10, 12)));
        assert_eq!(c.phase(&scope), ScopePhase::Idle);
    }

    #[test]
    fn test_reset_reloads_covered_scope_and_keeps_survivors() {
        let mut c = coordinator();
        let scope = ScopeId::from("agenda");
        let (a, mut rx) = view(&mut c, "agenda");
        let t0 = Instant::now();
        c.set_window(a, Some(d(20)), None, t0);
        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);
        c.complete(batch.id, Ok(answer(&batch, vec![occ("A", 9), occ("B", 10)])), t0 + DEBOUNCE);
        let kept = Arc::clone(&c.displayed(a).unwrap()[1]);
        drain(&mut rx);

        c.reset(None, t0 + DEBOUNCE);
        let reload = c.poll_due(t0 + DEBOUNCE * 2).remove(0);
        assert!(reload.full_reset);
        c.complete(reload.id, Ok(answer(&reload, vec![occ("B", 10)])), t0 + DEBOUNCE * 3);

        let shown = c.displayed(a).unwrap();
        assert_eq!(shown.len(), 1);
        assert!(Arc::ptr_eq(&shown[0], &kept));
        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].patch.removed(), 1);
        assert!(c.loaded(&scope).unwrap().covers(&DateRange::day(d(20))));
    }

    #[test]
    fn test_relabel_after_reset_reaches_view() {
        let mut c = coordinator();
        let (a, mut rx) = view(&mut c, "agenda");
        let t0 = Instant::now();
        c.set_window(a, Some(d(20)), None, t0);
        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);
        c.complete(batch.id, Ok(answer(&batch, vec![occ("A", 9)])), t0 + DEBOUNCE);
        let mut mirror: Vec<Arc<Occurrence>> = Vec::new();
        for update in drain(&mut rx) {
            update.patch.apply(&mut mirror);
        }

        c.reset(None, t0 + DEBOUNCE);
        let reload = c.poll_due(t0 + DEBOUNCE * 2).remove(0);
        let mut renamed = occ("A", 9);
        renamed.label = "Renamed".to_string();
        c.complete(reload.id, Ok(answer(&reload, vec![renamed])), t0 + DEBOUNCE * 3);

        assert_eq!(c.displayed(a).unwrap()[0].label, "Renamed");
        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 1);
        assert!(updates[0].patch.ops.is_empty());
        updates[0].patch.apply(&mut mirror);
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror[0].label, "Renamed");
    }

    #[test]
    fn test_unregistered_view_result_is_discarded() {
        let mut c = coordinator();
        let (a, rx) = view(&mut c, "agenda");
        let t0 = Instant::now();
        c.set_window(a, Some(d(1)), Some(d(3)), t0);
        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);
        c.unregister(a);
        drop(rx);

        c.complete(batch.id, Ok(answer(&batch, vec![occ("A", 9)])), t0 + DEBOUNCE);
        assert_eq!(c.view_count(), 0);
        assert!(c.loaded(&ScopeId::from("agenda")).unwrap().covers(&range(1, 3)));
    }

    #[test]
    fn test_dropped_receiver_unregisters_view() {
        let mut c = coordinator();
        let (a, rx) = view(&mut c, "agenda");
        drop(rx);
        let t0 = Instant::now();
        c.set_window(a, Some(d(20)), None, t0);
        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);
        c.complete(batch.id, Ok(answer(&batch, vec![occ("A", 9)])), t0 + DEBOUNCE);
        assert_eq!(c.view_count(), 0);
    }

    #[test]
    fn test_scopes_are_independent() {
        let mut c = coordinator();
        let (a, _rx_a) = view(&mut c, "agenda");
        let (s, _rx_s) = view(&mut c, "search");
        let t0 = Instant::now();
        c.set_window(a, Some(d(1)), Some(d(3)), t0);
        c.set_window(s, Some(d(1)), Some(d(3)), t0);

        let batches = c.poll_due(t0 + DEBOUNCE);
        assert_eq!(batches.len(), 2);
        assert_ne!(batches[0].scope, batches[1].scope);
    }

    #[test]
    fn test_filter_change_reserves_from_cache() {
        let mut c = coordinator();
        let (a, mut rx) = view(&mut c, "agenda");
        let t0 = Instant::now();
        c.set_window(a, Some(d(20)), None, t0);
        let batch = c.poll_due(t0 + DEBOUNCE).remove(0);
        c.complete(batch.id, Ok(answer(&batch, vec![occ("A", 9)])), t0 + DEBOUNCE);
        drain(&mut rx);

        c.set_filter(a, ViewFilter::all_day_only(), t0 + DEBOUNCE);
        assert!(c.poll_due(t0 + DEBOUNCE * 2).is_empty());
        assert!(c.displayed(a).unwrap().is_empty());
        assert_eq!(drain(&mut rx).len(), 1);
    }
}

//! Per-view bookkeeping and the binding handed to view models.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::mpsc;

use crate::coordinator::{CoordinatorHandle, ScopeId};
use crate::date_range::DateRange;
use crate::error::CalViewResult;
use crate::event::EventId;
use crate::filter::ViewFilter;
use crate::occurrence::Occurrence;
use crate::reconcile::{DisplayedSequence, ReconcilePatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub(crate) u64);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view-{}", self.0)
    }
}

/// What a view has asked to display.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewRequest {
    /// Registered but nothing requested yet.
    Unset,
    Window(DateRange),
    /// The last window had no start or ended before it started.
    InvalidWindow,
    Identifiers(Vec<EventId>),
}

/// Sent to a view whenever its displayed list or missing set changes.
#[derive(Debug, Clone)]
pub struct ViewUpdate {
    pub patch: ReconcilePatch,
    /// Requested identifiers the store does not have.
    pub missing: Vec<EventId>,
}

pub(crate) struct ViewState {
    pub scope: ScopeId,
    pub request: ViewRequest,
    pub filter: ViewFilter,
    pub displayed: DisplayedSequence,
    pub missing: Vec<EventId>,
    pub dirty: bool,
    pub last_served: Option<DateRange>,
    pub notifier: mpsc::UnboundedSender<ViewUpdate>,
}

impl ViewState {
    pub fn new(
        scope: ScopeId,
        filter: ViewFilter,
        notifier: mpsc::UnboundedSender<ViewUpdate>,
    ) -> Self {
        ViewState {
            scope,
            request: ViewRequest::Unset,
            filter,
            displayed: Vec::new(),
            missing: Vec::new(),
            dirty: false,
            last_served: None,
            notifier,
        }
    }

    /// Whether a new window would change nothing.
    pub fn already_serving(&self, window: &DateRange) -> bool {
        !self.dirty
            && self.last_served.as_ref() == Some(window)
            && self.request == ViewRequest::Window(*window)
    }
}

/// A registered view.
///
/// Mirrors the coordinator's displayed list by applying each received patch,
/// so the `Arc`s it holds are the coordinator's instances. Dropping the
/// binding unregisters the view.
pub struct ViewBinding {
    id: ViewId,
    handle: CoordinatorHandle,
    updates: mpsc::UnboundedReceiver<ViewUpdate>,
    occurrences: DisplayedSequence,
    missing: Vec<EventId>,
}

impl ViewBinding {
    pub(crate) fn new(
        id: ViewId,
        handle: CoordinatorHandle,
        updates: mpsc::UnboundedReceiver<ViewUpdate>,
    ) -> Self {
        ViewBinding {
            id,
            handle,
            updates,
            occurrences: Vec::new(),
            missing: Vec::new(),
        }
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    /// Show the days `[start, end]`. Without an end the window is one day.
    pub fn set_window(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> CalViewResult<()> {
        self.handle.set_window(self.id, start, end)
    }

    pub fn set_identifiers(&self, ids: Vec<EventId>) -> CalViewResult<()> {
        self.handle.set_identifiers(self.id, ids)
    }

    pub fn set_filter(&self, filter: ViewFilter) -> CalViewResult<()> {
        self.handle.set_filter(self.id, filter)
    }

    /// Wait for the next update and apply it to the local list.
    /// Returns `None` once the coordinator has shut down.
    pub async fn next_update(&mut self) -> Option<ViewUpdate> {
        let update = self.updates.recv().await?;
        self.absorb(&update);
        Some(update)
    }

    /// Apply every update that has already arrived.
    pub fn drain_updates(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.updates.try_recv() {
            self.absorb(&update);
            applied += 1;
        }
        applied
    }

    pub fn occurrences(&self) -> &[Arc<Occurrence>] {
        &self.occurrences
    }

    pub fn missing(&self) -> &[EventId] {
        &self.missing
    }

    fn absorb(&mut self, update: &ViewUpdate) {
        update.patch.apply(&mut self.occurrences);
        self.missing = update.missing.clone();
    }
}

impl Drop for ViewBinding {
    fn drop(&mut self) {
        // The coordinator may already be gone.
        let _ = self.handle.unregister(self.id);
    }
}

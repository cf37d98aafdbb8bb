//! Date-range load cache and occurrence reconciliation for calendar views.
//!
//! This crate sits between views that display calendar occurrences and a slow
//! event store:
//! - `range_set` tracks which days are already loaded and what is missing
//! - `reconcile` turns two sorted occurrence lists into minimal patches
//! - `coordinator` debounces view changes into one storage batch per scope
//!   and keeps every view of a scope in sync with the cache
//! - `storage` runs the store on its own thread behind an async handle

pub mod config;
pub mod coordinator;
pub mod date_range;
pub mod error;
pub mod event;
pub mod filter;
pub mod occurrence;
pub mod range_set;
pub mod reconcile;
pub mod recurrence;
pub mod storage;
pub mod view;

pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorHandle, CoordinatorService, LoadCoordinator, ScopeId, ScopePhase};
pub use date_range::DateRange;
pub use error::{CalViewError, CalViewResult};
pub use event::{Event, EventId, EventTime, Recurrence};
pub use filter::ViewFilter;
pub use occurrence::{Occurrence, OccurrenceId};
pub use range_set::RangeSet;
pub use reconcile::{DisplayedSequence, PatchOp, ReconcilePatch, reconcile};
pub use storage::{
    BatchId, EventStore, LoadRequest, LoadResult, MemoryStore, StorageHandle, StorageWorker,
};
pub use view::{ViewBinding, ViewId, ViewRequest, ViewUpdate};

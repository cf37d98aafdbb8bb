//! The coordinator task.
//!
//! A single tokio task owns the [`LoadCoordinator`] and multiplexes three
//! inputs: commands from handles and bindings, completions of dispatched
//! batches, and the next debounce or retry deadline. All coordinator state is
//! touched from this task only.

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace};

use super::{LoadCoordinator, ScopeId, ScopePhase};
use crate::config::CoordinatorConfig;
use crate::error::{CalViewError, CalViewResult};
use crate::event::EventId;
use crate::filter::ViewFilter;
use crate::occurrence::Occurrence;
use crate::storage::{BatchId, LoadRequest, LoadResult, StorageHandle};
use crate::view::{ViewBinding, ViewId, ViewUpdate};

enum Command {
    Register {
        scope: ScopeId,
        filter: ViewFilter,
        notifier: mpsc::UnboundedSender<ViewUpdate>,
        reply: oneshot::Sender<ViewId>,
    },
    SetWindow {
        view: ViewId,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
    SetIdentifiers {
        view: ViewId,
        ids: Vec<EventId>,
    },
    SetFilter {
        view: ViewId,
        filter: ViewFilter,
    },
    Unregister {
        view: ViewId,
    },
    Reset {
        scope: Option<ScopeId>,
    },
    Phase {
        scope: ScopeId,
        reply: oneshot::Sender<ScopePhase>,
    },
}

type Completion = (BatchId, CalViewResult<LoadResult>);

/// Cloneable entry point to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    storage: StorageHandle,
}

impl CoordinatorHandle {
    /// Register a view in `scope`. The binding starts with no window.
    pub async fn register(
        &self,
        scope: impl Into<ScopeId>,
        filter: ViewFilter,
    ) -> CalViewResult<ViewBinding> {
        let (notifier, updates) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            scope: scope.into(),
            filter,
            notifier,
            reply,
        })?;
        let id = rx.await.map_err(|_| CalViewError::CoordinatorClosed)?;
        Ok(ViewBinding::new(id, self.clone(), updates))
    }

    pub fn set_window(
        &self,
        view: ViewId,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> CalViewResult<()> {
        self.send(Command::SetWindow { view, start, end })
    }

    pub fn set_identifiers(&self, view: ViewId, ids: Vec<EventId>) -> CalViewResult<()> {
        self.send(Command::SetIdentifiers { view, ids })
    }

    pub fn set_filter(&self, view: ViewId, filter: ViewFilter) -> CalViewResult<()> {
        self.send(Command::SetFilter { view, filter })
    }

    pub fn unregister(&self, view: ViewId) -> CalViewResult<()> {
        self.send(Command::Unregister { view })
    }

    /// Signal a structural change in the store. `None` resets every scope.
    pub fn reset(&self, scope: Option<ScopeId>) -> CalViewResult<()> {
        self.send(Command::Reset { scope })
    }

    pub async fn phase(&self, scope: impl Into<ScopeId>) -> CalViewResult<ScopePhase> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Phase {
            scope: scope.into(),
            reply,
        })?;
        rx.await.map_err(|_| CalViewError::CoordinatorClosed)
    }

    /// Answered by the storage context directly; coordinator state is not
    /// consulted.
    pub async fn next_occurrence(
        &self,
        event_id: EventId,
        recurrence_id: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
    ) -> CalViewResult<Occurrence> {
        self.storage.next_occurrence(event_id, recurrence_id, after).await
    }

    fn send(&self, command: Command) -> CalViewResult<()> {
        self.commands
            .send(command)
            .map_err(|_| CalViewError::CoordinatorClosed)
    }
}

pub struct CoordinatorService {
    coordinator: LoadCoordinator,
    commands: mpsc::UnboundedReceiver<Command>,
    completions: mpsc::UnboundedReceiver<Completion>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    storage: StorageHandle,
}

impl CoordinatorService {
    /// Start the coordinator task on the current tokio runtime. It stops once
    /// every handle and binding has been dropped.
    pub fn spawn(config: CoordinatorConfig, storage: StorageHandle) -> CoordinatorHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (completion_tx, completions) = mpsc::unbounded_channel();

        let service = CoordinatorService {
            coordinator: LoadCoordinator::new(config),
            commands,
            completions,
            completion_tx,
            storage: storage.clone(),
        };
        tokio::spawn(service.run());

        CoordinatorHandle {
            commands: commands_tx,
            storage,
        }
    }

    async fn run(mut self) {
        debug!(debounce = ?self.coordinator.config().debounce, "coordinator started");
        loop {
            let deadline = self.coordinator.next_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some((batch, result)) = self.completions.recv() => {
                    self.coordinator.complete(batch, result, Instant::now());
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    for request in self.coordinator.poll_due(Instant::now()) {
                        self.dispatch(request);
                    }
                }
            }
        }
        debug!("coordinator stopped");
    }

    fn handle(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Register {
                scope,
                filter,
                notifier,
                reply,
            } => {
                let id = self.coordinator.register(scope, filter, notifier);
                if reply.send(id).is_err() {
                    // Caller gave up before the reply arrived.
                    self.coordinator.unregister(id);
                }
            }
            Command::SetWindow { view, start, end } => {
                self.coordinator.set_window(view, start, end, now)
            }
            Command::SetIdentifiers { view, ids } => {
                self.coordinator.set_identifiers(view, ids, now)
            }
            Command::SetFilter { view, filter } => self.coordinator.set_filter(view, filter, now),
            Command::Unregister { view } => self.coordinator.unregister(view),
            Command::Reset { scope } => self.coordinator.reset(scope.as_ref(), now),
            Command::Phase { scope, reply } => {
                let _ = reply.send(self.coordinator.phase(&scope));
            }
        }
    }

    fn dispatch(&mut self, request: LoadRequest) {
        let batch = request.id;
        self.coordinator.mark_dispatched(batch);
        trace!(batch = %batch, scope = %request.scope, "batch dispatched");

        let storage = self.storage.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = storage.load(request).await;
            let _ = completions.send((batch, result));
        });
    }
}

//! Storage execution context.
//!
//! The store is moved onto its own thread and driven through a request queue.
//! Callers talk to it through a cloneable [`StorageHandle`]; every call is
//! answered over a oneshot channel and bounded by a timeout.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{CalViewError, CalViewResult};
use crate::event::EventId;
use crate::occurrence::Occurrence;
use crate::storage::{EventStore, LoadRequest, LoadResult};

const WORKER_THREAD_NAME: &str = "calview-storage";

enum WorkerMessage {
    Load {
        request: LoadRequest,
        reply: oneshot::Sender<CalViewResult<LoadResult>>,
    },
    NextOccurrence {
        event_id: EventId,
        recurrence_id: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
        reply: oneshot::Sender<CalViewResult<Occurrence>>,
    },
}

pub struct StorageWorker;

impl StorageWorker {
    /// Move `store` onto a dedicated thread. The thread exits once every
    /// handle has been dropped.
    pub fn spawn<S: EventStore>(
        mut store: S,
        call_timeout: Duration,
    ) -> CalViewResult<StorageHandle> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();

        thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                while let Some(message) = rx.blocking_recv() {
                    match message {
                        WorkerMessage::Load { request, reply } => {
                            trace!(batch = %request.id, "storage load started");
                            let result = store.load(&request);
                            // The requester may have timed out and gone away.
                            let _ = reply.send(result);
                        }
                        WorkerMessage::NextOccurrence {
                            event_id,
                            recurrence_id,
                            after,
                            reply,
                        } => {
                            let found = store.next_occurrence(&event_id, recurrence_id, after);
                            let _ = reply.send(found);
                        }
                    }
                }
                debug!("storage worker stopped");
            })?;

        Ok(StorageHandle { tx, call_timeout })
    }
}

#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    call_timeout: Duration,
}

impl StorageHandle {
    pub async fn load(&self, request: LoadRequest) -> CalViewResult<LoadResult> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerMessage::Load { request, reply })
            .map_err(|_| CalViewError::WorkerUnavailable)?;
        self.wait(rx).await
    }

    pub async fn next_occurrence(
        &self,
        event_id: EventId,
        recurrence_id: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
    ) -> CalViewResult<Occurrence> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerMessage::NextOccurrence {
                event_id,
                recurrence_id,
                after,
                reply,
            })
            .map_err(|_| CalViewError::WorkerUnavailable)?;
        self.wait(rx).await
    }

    async fn wait<T>(&self, rx: oneshot::Receiver<CalViewResult<T>>) -> CalViewResult<T> {
        timeout(self.call_timeout, rx)
            .await
            .map_err(|_| CalViewError::StorageTimeout(self.call_timeout.as_secs()))?
            .map_err(|_| CalViewError::WorkerUnavailable)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ScopeId;
    use crate::date_range::DateRange;
    use crate::storage::BatchId;

    struct SlowStore {
        delay: Duration,
    }

    impl EventStore for SlowStore {
        fn load(&mut self, request: &LoadRequest) -> CalViewResult<LoadResult> {
            thread::sleep(self.delay);
            Ok(LoadResult {
                ranges: request.ranges.clone(),
                ..Default::default()
            })
        }

        fn next_occurrence(
            &mut self,
            event_id: &EventId,
            _recurrence_id: Option<DateTime<Utc>>,
            _after: Option<DateTime<Utc>>,
        ) -> CalViewResult<Occurrence> {
            Err(CalViewError::EventNotFound(event_id.clone()))
        }
    }

    fn request() -> LoadRequest {
        LoadRequest {
            id: BatchId(1),
            scope: ScopeId::from("agenda"),
            ranges: vec![DateRange::parse("2025-03-01", "2025-03-31").unwrap()],
            identifiers: vec![],
            full_reset: false,
        }
    }

    #[tokio::test]
    async fn test_load_round_trips_through_worker() {
        let handle = StorageWorker::spawn(
            SlowStore {
                delay: Duration::ZERO,
            },
            Duration::from_secs(5),
        )
        .unwrap();

        let result = handle.load(request()).await.unwrap();
        assert_eq!(result.ranges, request().ranges);

        let missing = handle.next_occurrence(EventId::from("nope"), None, None).await;
        assert!(matches!(missing, Err(CalViewError::EventNotFound(_))));
    }

    #[tokio::test]
    async fn test_slow_load_times_out() {
        let handle = StorageWorker::spawn(
            SlowStore {
                delay: Duration::from_millis(300),
            },
            Duration::from_millis(20),
        )
        .unwrap();

        let err = handle.load(request()).await.unwrap_err();
        assert!(matches!(err, CalViewError::StorageTimeout(_)));
        assert!(err.is_transient());
    }
}

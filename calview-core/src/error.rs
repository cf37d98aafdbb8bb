//! Error types for calview.

use thiserror::Error;

use crate::event::EventId;

/// Errors that can occur in calview operations.
#[derive(Error, Debug)]
pub enum CalViewError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Storage request timed out after {0}s")]
    StorageTimeout(u64),

    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    #[error("Storage worker is no longer running")]
    WorkerUnavailable,

    #[error("Load coordinator is no longer running")]
    CoordinatorClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CalViewError {
    /// Whether the failure is worth retrying on the next dirty cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CalViewError::StorageFailure(_) | CalViewError::StorageTimeout(_) | CalViewError::Io(_)
        )
    }
}

/// Result type alias for calview operations.
pub type CalViewResult<T> = Result<T, CalViewError>;

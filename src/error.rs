//! # Error Handling
//!
//! Error types shared by the queue, the state store and the lifecycle facade.
//! Workers and the scheduler never hand these to a caller; they log them and
//! surface failures through the repository state instead.

use sea_orm::DbErr;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Errors raised by a [`crate::queue::JobQueue`] implementation.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing storage could not be reached or rejected the operation.
    #[error("job queue unavailable: {0}")]
    Unavailable(#[from] DbErr),

    /// The lease expired and the job was handed to another worker.
    #[error("lease on job {job_id} is no longer held")]
    LeaseLost { job_id: Uuid },

    /// A stored job could not be decoded.
    #[error("job {job_id} is corrupt: {message}")]
    Corrupt { job_id: Uuid, message: String },

    #[error("dead-lettered job {id} not found")]
    DeadLetterNotFound { id: Uuid },
}

/// Errors raised by a [`crate::store::RepositoryStateStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("repository state store unavailable: {0}")]
    Unavailable(#[from] DbErr),

    /// A stored row could not be decoded into a repository state.
    #[error("repository state for {uri} is corrupt: {message}")]
    Corrupt { uri: String, message: String },
}

/// Rejected repository locator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid repository uri '{uri}': {reason}")]
pub struct InvalidRepositoryUri {
    pub uri: String,
    pub reason: String,
}

/// Errors surfaced by [`crate::service::RepositoryLifecycle`] to its callers.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    InvalidRepository(#[from] InvalidRepositoryUri),
}

impl QueueError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Log a database failure with its context and wrap it for the queue.
pub(crate) fn queue_db_err(context: &'static str, err: DbErr) -> QueueError {
    error!(error = ?err, context, "Job queue operation failed");
    QueueError::Unavailable(err)
}

/// Log a database failure with its context and wrap it for the state store.
pub(crate) fn store_db_err(context: &'static str, err: DbErr) -> StoreError {
    error!(error = ?err, context, "Repository state store operation failed");
    StoreError::Unavailable(err)
}

//! Queue error types.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    /// No entry with this task id is queued.
    #[error("task {0} is not queued")]
    NotQueued(Uuid),

    /// The presented receipt does not match the entry's current lease.
    #[error("lease {lease_id} does not hold task {task_id}")]
    LeaseMismatch { task_id: Uuid, lease_id: Uuid },

    /// The lease ran out; the entry is pollable by anyone again.
    #[error("lease {lease_id} on task {task_id} has expired")]
    LeaseExpired { task_id: Uuid, lease_id: Uuid },

    /// Backing store failure.
    #[error("queue backend error: {0}")]
    Backend(#[from] db::DbError),
}

impl QueueError {
    /// Whether the error is an infrastructure hiccup worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(err) if err.is_transient())
    }
}

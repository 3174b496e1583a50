//! The `TaskQueue` trait: the contract between the engine and a queue backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::QueueError;

/// A granted claim on one queued task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub task_id: Uuid,
    /// Receipt proving ownership; required to ack or extend.
    pub lease_id: Uuid,
    pub queue_name: String,
    pub expires_at: DateTime<Utc>,
}

/// Per-queue-name lease queue.
///
/// Ordering: higher `priority` first, FIFO among equal priorities. `poll`
/// never blocks; callers implement their own backoff.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Add `task_id` to `queue_name`. Idempotent: an already-queued task
    /// (leased or not) is left untouched.
    async fn enqueue(&self, queue_name: &str, task_id: Uuid, priority: i32) -> Result<(), QueueError>;

    /// Lease the next pollable entry for `lease`, or `None` when empty.
    async fn poll(&self, queue_name: &str, lease: Duration) -> Result<Option<Lease>, QueueError>;

    /// Remove an entry held under a live lease.
    async fn ack(&self, task_id: Uuid, lease_id: Uuid) -> Result<(), QueueError>;

    /// Reset a live lease to expire `duration` from now. Calling it
    /// repeatedly is a heartbeat, not an accumulation.
    async fn extend_lease(
        &self,
        task_id: Uuid,
        lease_id: Uuid,
        duration: Duration,
    ) -> Result<DateTime<Utc>, QueueError>;

    /// Drop an entry regardless of its lease. Returns whether it existed.
    async fn remove(&self, task_id: Uuid) -> Result<bool, QueueError>;

    /// Number of entries (leased or not) in `queue_name`.
    async fn depth(&self, queue_name: &str) -> Result<usize, QueueError>;
}

//! [`TaskQueue`] over the `task_queue` table.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use db::repository::queue as queue_repo;
use db::DbPool;

use crate::{Lease, QueueError, TaskQueue};

/// Postgres-backed lease queue.
///
/// Lease expiry is computed and checked on the database clock, so every
/// server agrees on it inside the queue. The engine compares the expiry it
/// records on an execution against its own clock when sweeping and
/// re-polling, which assumes server clocks stay NTP-synchronised to well
/// under the lease duration. Skew beyond that can time out a live lease
/// early or refuse the re-poll of an expired one until the sweeper runs.
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: DbPool,
}

impl PgTaskQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Why a receipt was refused: the entry is gone, or it is held under
    /// another (or an expired) lease.
    async fn refusal(&self, task_id: Uuid, lease_id: Uuid) -> QueueError {
        match queue_repo::is_queued(&self.pool, task_id).await {
            Ok(false) => QueueError::NotQueued(task_id),
            Ok(true) => QueueError::LeaseMismatch { task_id, lease_id },
            Err(err) => err.into(),
        }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, queue_name: &str, task_id: Uuid, priority: i32) -> Result<(), QueueError> {
        let inserted = queue_repo::enqueue_task(&self.pool, queue_name, task_id, priority).await?;
        if !inserted {
            debug!(%task_id, queue = queue_name, "task already queued");
        }
        Ok(())
    }

    async fn poll(&self, queue_name: &str, lease: Duration) -> Result<Option<Lease>, QueueError> {
        let row = queue_repo::lease_next_task(&self.pool, queue_name, lease.as_secs_f64()).await?;

        Ok(row.and_then(|row| match (row.lease_id, row.lease_expires_at) {
            (Some(lease_id), Some(expires_at)) => Some(Lease {
                task_id: row.task_id,
                lease_id,
                queue_name: row.queue_name,
                expires_at,
            }),
            _ => None,
        }))
    }

    async fn ack(&self, task_id: Uuid, lease_id: Uuid) -> Result<(), QueueError> {
        if queue_repo::ack_task(&self.pool, task_id, lease_id).await? {
            Ok(())
        } else {
            Err(self.refusal(task_id, lease_id).await)
        }
    }

    async fn extend_lease(
        &self,
        task_id: Uuid,
        lease_id: Uuid,
        duration: Duration,
    ) -> Result<DateTime<Utc>, QueueError> {
        match queue_repo::extend_lease(&self.pool, task_id, lease_id, duration.as_secs_f64()).await? {
            Some(expires_at) => Ok(expires_at),
            None => Err(self.refusal(task_id, lease_id).await),
        }
    }

    async fn remove(&self, task_id: Uuid) -> Result<bool, QueueError> {
        Ok(queue_repo::remove_task(&self.pool, task_id).await?)
    }

    async fn depth(&self, queue_name: &str) -> Result<usize, QueueError> {
        let depth = queue_repo::queue_depth(&self.pool, queue_name).await?;
        Ok(usize::try_from(depth).unwrap_or_default())
    }
}

//! Lease queue operations.
//!
//! The queue is backed by the `task_queue` table. Pollers use
//! `SELECT … FOR UPDATE SKIP LOCKED` so concurrent workers never lease the
//! same row, and lease expiry is computed from the database clock, never the
//! caller's.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, models::QueueEntryRow};

/// Add a task to a queue. Re-enqueueing an existing task is a no-op.
///
/// Returns `true` when a new row was inserted.
pub async fn enqueue_task(
    pool: &PgPool,
    queue_name: &str,
    task_id: Uuid,
    priority: i32,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        INSERT INTO task_queue (task_id, queue_name, priority)
        VALUES ($1, $2, $3)
        ON CONFLICT (task_id) DO NOTHING
        "#,
    )
    .bind(task_id)
    .bind(queue_name)
    .bind(priority)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Atomically lease the best pollable entry of `queue_name`.
///
/// Highest priority wins, FIFO among equals. Entries whose lease expired are
/// pollable again. Returns `None` when nothing is pollable.
pub async fn lease_next_task(
    pool: &PgPool,
    queue_name: &str,
    lease_seconds: f64,
) -> Result<Option<QueueEntryRow>, DbError> {
    let mut tx = pool.begin().await?;

    let candidate: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT task_id
        FROM task_queue
        WHERE queue_name = $1
          AND (lease_expires_at IS NULL OR lease_expires_at <= now())
        ORDER BY priority DESC, seq ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(queue_name)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(task_id) = candidate else {
        tx.rollback().await?;
        return Ok(None);
    };

    let row = sqlx::query_as::<_, QueueEntryRow>(
        r#"
        UPDATE task_queue
        SET lease_id = $1, lease_expires_at = now() + make_interval(secs => $2)
        WHERE task_id = $3
        RETURNING task_id, queue_name, priority, seq, lease_id, lease_expires_at, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(lease_seconds)
    .bind(task_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(row))
}

/// Delete an entry held under an unexpired lease.
///
/// Returns `false` when the lease is unknown, stale or expired.
pub async fn ack_task(pool: &PgPool, task_id: Uuid, lease_id: Uuid) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        DELETE FROM task_queue
        WHERE task_id = $1 AND lease_id = $2 AND lease_expires_at > now()
        "#,
    )
    .bind(task_id)
    .bind(lease_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Push an unexpired lease's expiry to `now + lease_seconds`.
///
/// Returns the new expiry, or `None` when the lease is unknown, stale or
/// already expired.
pub async fn extend_lease(
    pool: &PgPool,
    task_id: Uuid,
    lease_id: Uuid,
    lease_seconds: f64,
) -> Result<Option<DateTime<Utc>>, DbError> {
    let expiry = sqlx::query_scalar(
        r#"
        UPDATE task_queue
        SET lease_expires_at = now() + make_interval(secs => $3)
        WHERE task_id = $1 AND lease_id = $2 AND lease_expires_at > now()
        RETURNING lease_expires_at
        "#,
    )
    .bind(task_id)
    .bind(lease_id)
    .bind(lease_seconds)
    .fetch_optional(pool)
    .await?;

    Ok(expiry)
}

/// Whether `task_id` has an entry, leased or not.
pub async fn is_queued(pool: &PgPool, task_id: Uuid) -> Result<bool, DbError> {
    let queued = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM task_queue WHERE task_id = $1)")
        .bind(task_id)
        .fetch_one(pool)
        .await?;
    Ok(queued)
}

/// Drop an entry regardless of its lease.
pub async fn remove_task(pool: &PgPool, task_id: Uuid) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM task_queue WHERE task_id = $1")
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Number of entries (leased or not) in a queue.
pub async fn queue_depth(pool: &PgPool, queue_name: &str) -> Result<i64, DbError> {
    let depth = sqlx::query_scalar("SELECT COUNT(*) FROM task_queue WHERE queue_name = $1")
        .bind(queue_name)
        .fetch_one(pool)
        .await?;
    Ok(depth)
}

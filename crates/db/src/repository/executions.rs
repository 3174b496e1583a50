//! Execution snapshot operations.
//!
//! An execution is stored as one JSONB snapshot plus a version counter.
//! Writers replace the snapshot only if the version they read is still
//! current (compare-and-swap); a lost race returns `Ok(None)` and the caller
//! re-reads and recomputes.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, models::ExecutionRow};

/// Insert a new execution at version 0.
///
/// Returns `false` if a row with the same id already exists, which makes
/// creation idempotent for callers that derive ids deterministically.
pub async fn insert_execution(
    pool: &PgPool,
    id: Uuid,
    workflow_name: &str,
    status: &str,
    snapshot: serde_json::Value,
    parent_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    task_ids: &[Uuid],
) -> Result<bool, DbError> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r#"
        INSERT INTO workflow_executions
            (id, workflow_name, status, snapshot, version, parent_id, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 0, $5, $6, $6)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(id)
    .bind(workflow_name)
    .bind(status)
    .bind(snapshot)
    .bind(parent_id)
    .bind(created_at)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    index_tasks(&mut tx, id, task_ids).await?;
    tx.commit().await?;
    Ok(true)
}

/// Fetch a single execution row.
pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<ExecutionRow, DbError> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, workflow_name, status, snapshot, version, parent_id, created_at, updated_at
        FROM workflow_executions
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Replace the snapshot if `expected_version` is still current.
///
/// Returns the new version on success and `None` when another writer got
/// there first. `task_ids` are (re-)indexed in the same transaction so task
/// lookups never observe a task the snapshot does not contain.
pub async fn compare_and_swap_execution(
    pool: &PgPool,
    id: Uuid,
    expected_version: i64,
    status: &str,
    snapshot: serde_json::Value,
    updated_at: DateTime<Utc>,
    task_ids: &[Uuid],
) -> Result<Option<i64>, DbError> {
    let mut tx = pool.begin().await?;

    let new_version: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE workflow_executions
        SET snapshot = $1, status = $2, updated_at = $3, version = version + 1
        WHERE id = $4 AND version = $5
        RETURNING version
        "#,
    )
    .bind(snapshot)
    .bind(status)
    .bind(updated_at)
    .bind(id)
    .bind(expected_version)
    .fetch_optional(&mut *tx)
    .await?;

    match new_version {
        Some(version) => {
            index_tasks(&mut tx, id, task_ids).await?;
            tx.commit().await?;
            Ok(Some(version))
        }
        None => {
            tx.rollback().await?;
            Ok(None)
        }
    }
}

/// Ids of every execution currently in `status`.
pub async fn list_execution_ids_by_status(
    pool: &PgPool,
    status: &str,
) -> Result<Vec<Uuid>, DbError> {
    let ids = sqlx::query_scalar(
        r#"SELECT id FROM workflow_executions WHERE status = $1 ORDER BY created_at ASC"#,
    )
    .bind(status)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// Resolve the execution owning a task attempt.
pub async fn find_execution_for_task(
    pool: &PgPool,
    task_id: Uuid,
) -> Result<Option<Uuid>, DbError> {
    let id = sqlx::query_scalar(r#"SELECT execution_id FROM task_index WHERE task_id = $1"#)
        .bind(task_id)
        .fetch_optional(pool)
        .await?;

    Ok(id)
}

async fn index_tasks(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    execution_id: Uuid,
    task_ids: &[Uuid],
) -> Result<(), DbError> {
    if task_ids.is_empty() {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO task_index (task_id, execution_id)
        SELECT task_id, $2 FROM UNNEST($1::uuid[]) AS t(task_id)
        ON CONFLICT (task_id) DO NOTHING
        "#,
    )
    .bind(task_ids)
    .bind(execution_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

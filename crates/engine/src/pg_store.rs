//! Postgres-backed [`ExecutionStore`].
//!
//! Executions are stored as JSONB snapshots next to a version counter; the
//! row's `status` column is kept in step so the sweeper can list running
//! executions without decoding snapshots.

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use db::repository::{definitions, executions};
use db::{DbError, DbPool};

use crate::execution::{Execution, ExecutionStatus};
use crate::models::WorkflowDefinition;
use crate::store::{ApplyOutcome, ExecutionStore, StoreError, VersionToken};
use crate::transition::TransitionSet;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn task_ids(execution: &Execution) -> Vec<Uuid> {
    execution.tasks.iter().map(|task| task.id).collect()
}

fn to_token(version: i64) -> VersionToken {
    u64::try_from(version).unwrap_or_default()
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let version = i32::try_from(definition.version).unwrap_or(i32::MAX);
        let body = serde_json::to_value(definition)?;
        match definitions::insert_definition(&self.pool, &definition.name, version, body).await {
            Ok(_) => Ok(()),
            Err(DbError::AlreadyExists) => Err(StoreError::DefinitionExists {
                name: definition.name.clone(),
                version: definition.version,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_definition(
        &self,
        name: &str,
        version: Option<u32>,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = match version {
            Some(version) => {
                let Ok(version) = i32::try_from(version) else {
                    return Ok(None);
                };
                definitions::get_definition(&self.pool, name, version).await?
            }
            None => definitions::get_latest_definition(&self.pool, name).await?,
        };
        row.map(|row| serde_json::from_value(row.definition))
            .transpose()
            .map_err(Into::into)
    }

    async fn create_execution(&self, execution: &Execution) -> Result<bool, StoreError> {
        let snapshot = serde_json::to_value(execution)?;
        let created = executions::insert_execution(
            &self.pool,
            execution.id,
            &execution.workflow_name,
            execution.status.as_str(),
            snapshot,
            execution.parent.map(|parent| parent.execution_id),
            execution.created_at,
            &task_ids(execution),
        )
        .await?;
        Ok(created)
    }

    async fn read_execution(&self, id: Uuid) -> Result<(Execution, VersionToken), StoreError> {
        let row = match executions::get_execution(&self.pool, id).await {
            Ok(row) => row,
            Err(DbError::NotFound) => return Err(StoreError::ExecutionNotFound(id)),
            Err(err) => return Err(err.into()),
        };
        let execution: Execution = serde_json::from_value(row.snapshot)?;
        Ok((execution, to_token(row.version)))
    }

    async fn apply_transitions(
        &self,
        id: Uuid,
        expected: VersionToken,
        set: &TransitionSet,
    ) -> Result<ApplyOutcome, StoreError> {
        let (mut execution, current) = self.read_execution(id).await?;
        if current != expected {
            debug!(execution_id = %id, expected, actual = current, "version conflict");
            return Ok(ApplyOutcome::Conflict);
        }

        execution.apply(set);
        let snapshot = serde_json::to_value(&execution)?;
        let swapped = executions::compare_and_swap_execution(
            &self.pool,
            id,
            i64::try_from(expected).unwrap_or(i64::MAX),
            execution.status.as_str(),
            snapshot,
            execution.updated_at,
            &task_ids(&execution),
        )
        .await?;

        Ok(match swapped {
            Some(version) => ApplyOutcome::Applied(to_token(version)),
            None => ApplyOutcome::Conflict,
        })
    }

    async fn running_executions(&self) -> Result<Vec<Uuid>, StoreError> {
        let ids = executions::list_execution_ids_by_status(&self.pool, ExecutionStatus::Running.as_str()).await?;
        Ok(ids)
    }

    async fn execution_for_task(&self, task_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        Ok(executions::find_execution_for_task(&self.pool, task_id).await?)
    }
}

//! Execution store contract and the in-memory implementation.
//!
//! The store owns definitions and execution snapshots. Every write to an
//! execution goes through [`ExecutionStore::apply_transitions`], a
//! compare-and-swap on the version token returned by the last read.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::execution::{Execution, ExecutionStatus};
use crate::models::WorkflowDefinition;
use crate::transition::TransitionSet;

/// Opaque optimistic-concurrency token. Bumped by every applied write.
pub type VersionToken = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(VersionToken),
    /// Someone else wrote first; re-read and decide again.
    Conflict,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("workflow definition '{name}' version {version} already exists")]
    DefinitionExists { name: String, version: u32 },

    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("snapshot (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(err) if err.is_transient())
    }
}

/// Persistence for definitions and execution snapshots.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Definitions are immutable: saving an existing `(name, version)` fails.
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;

    /// `version = None` loads the highest registered version.
    async fn load_definition(
        &self,
        name: &str,
        version: Option<u32>,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Returns `false` if an execution with the same id already exists.
    async fn create_execution(&self, execution: &Execution) -> Result<bool, StoreError>;

    async fn read_execution(&self, id: Uuid) -> Result<(Execution, VersionToken), StoreError>;

    /// Apply `set` atomically if the stored version still equals `expected`.
    async fn apply_transitions(
        &self,
        id: Uuid,
        expected: VersionToken,
        set: &TransitionSet,
    ) -> Result<ApplyOutcome, StoreError>;

    /// Ids of every execution in RUNNING status.
    async fn running_executions(&self) -> Result<Vec<Uuid>, StoreError>;

    /// The execution a task record belongs to.
    async fn execution_for_task(&self, task_id: Uuid) -> Result<Option<Uuid>, StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    definitions: BTreeMap<String, BTreeMap<u32, WorkflowDefinition>>,
    executions: HashMap<Uuid, (Execution, VersionToken)>,
    task_index: HashMap<Uuid, Uuid>,
}

impl MemoryState {
    fn index_tasks(&mut self, execution: &Execution) {
        for task in &execution.tasks {
            self.task_index.insert(task.id, execution.id);
        }
    }
}

/// Process-local store for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let versions = state.definitions.entry(definition.name.clone()).or_default();
        if versions.contains_key(&definition.version) {
            return Err(StoreError::DefinitionExists {
                name: definition.name.clone(),
                version: definition.version,
            });
        }
        versions.insert(definition.version, definition.clone());
        Ok(())
    }

    async fn load_definition(
        &self,
        name: &str,
        version: Option<u32>,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let state = self.state.read().await;
        let Some(versions) = state.definitions.get(name) else {
            return Ok(None);
        };
        let found = match version {
            Some(version) => versions.get(&version),
            None => versions.values().next_back(),
        };
        Ok(found.cloned())
    }

    async fn create_execution(&self, execution: &Execution) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if state.executions.contains_key(&execution.id) {
            return Ok(false);
        }
        state.index_tasks(execution);
        state.executions.insert(execution.id, (execution.clone(), 1));
        Ok(true)
    }

    async fn read_execution(&self, id: Uuid) -> Result<(Execution, VersionToken), StoreError> {
        let state = self.state.read().await;
        state
            .executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn apply_transitions(
        &self,
        id: Uuid,
        expected: VersionToken,
        set: &TransitionSet,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut state = self.state.write().await;
        let (current, version) = state
            .executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))?;
        if version != expected {
            debug!(execution_id = %id, expected, actual = version, "version conflict");
            return Ok(ApplyOutcome::Conflict);
        }

        let mut updated = current;
        updated.apply(set);
        state.index_tasks(&updated);
        let next = version + 1;
        state.executions.insert(id, (updated, next));
        Ok(ApplyOutcome::Applied(next))
    }

    async fn running_executions(&self) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.read().await;
        let mut ids: Vec<(chrono::DateTime<chrono::Utc>, Uuid)> = state
            .executions
            .values()
            .filter(|(execution, _)| execution.status == ExecutionStatus::Running)
            .map(|(execution, _)| (execution.created_at, execution.id))
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn execution_for_task(&self, task_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        Ok(self.state.read().await.task_index.get(&task_id).copied())
    }
}

//! Sub-workflow linking and domain routing.
//!
//! A SUB_WORKFLOW task becomes a child execution whose id is derived from the
//! task id, so spawning is idempotent: a crash between creating the child and
//! recording it on the parent is repaired by the next spawn attempt, which
//! finds the child already there.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::execution::{Execution, ExecutionStatus};
use crate::store::{ExecutionStore, StoreError};
use crate::transition::{SpawnRequest, TaskUpdate, Transition};

/// Id of the child execution spawned for SUB_WORKFLOW task `task_id`.
pub fn child_execution_id(task_id: Uuid) -> Uuid {
    Uuid::new_v5(&task_id, b"sub-workflow")
}

/// Queue a SIMPLE task named `task_name` is dispatched on, and its domain.
///
/// An entry for the task name wins over the `*` wildcard. Without a domain
/// the queue is the task name itself, otherwise `<task_name>:<domain>`.
pub fn queue_name_for(
    task_name: &str,
    task_to_domain: &BTreeMap<String, String>,
) -> (String, Option<String>) {
    let domain = task_to_domain
        .get(task_name)
        .or_else(|| task_to_domain.get("*"))
        .filter(|domain| !domain.is_empty())
        .cloned();
    match domain {
        Some(domain) => (format!("{task_name}:{domain}"), Some(domain)),
        None => (task_name.to_owned(), None),
    }
}

/// The parent-side transition mirroring a child's terminal status, if the
/// parent task is still waiting for it.
pub fn child_outcome(parent: &Execution, child: &Execution) -> Option<Transition> {
    let link = child.parent?;
    let task = parent.task(link.task_id)?;
    if task.status.is_terminal() || !child.status.is_terminal() {
        return None;
    }
    let update = match child.status {
        ExecutionStatus::Completed => TaskUpdate::completed(task.id, child.output.clone()),
        ExecutionStatus::Failed => TaskUpdate::failed(
            task.id,
            format!(
                "sub-workflow {} failed: {}",
                child.id,
                child.reason.as_deref().unwrap_or("no reason given")
            ),
            true,
        ),
        _ => TaskUpdate::failed(task.id, format!("sub-workflow {} was terminated", child.id), false),
    };
    Some(Transition::UpdateTask(update))
}

/// Result of [`SubWorkflowLinker::spawn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spawned {
    pub child_id: Uuid,
    pub version: u32,
}

/// Creates child executions for SUB_WORKFLOW tasks.
pub struct SubWorkflowLinker {
    store: Arc<dyn ExecutionStore>,
}

impl SubWorkflowLinker {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Resolve the requested version, then create the child execution unless
    /// it already exists.
    ///
    /// # Errors
    /// [`EngineError::InvalidDefinition`] for an unparseable version,
    /// [`EngineError::DefinitionNotFound`] if no matching definition is
    /// registered, or any store error.
    pub async fn spawn(&self, request: &SpawnRequest, now: DateTime<Utc>) -> Result<Spawned, EngineError> {
        match self.store.read_execution(request.child_id).await {
            Ok((existing, _)) => {
                debug!(child_id = %request.child_id, "sub-workflow already spawned");
                return Ok(Spawned {
                    child_id: existing.id,
                    version: existing.workflow_version,
                });
            }
            Err(StoreError::ExecutionNotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let params = &request.params;
        let wanted = params.version.resolve()?;
        let definition = self
            .store
            .load_definition(&params.name, wanted.exact())
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound {
                name: params.name.clone(),
                version: wanted.to_string(),
            })?;

        let mut child = Execution::new(request.child_id, &definition, request.input.clone(), now);
        child.parent = Some(request.parent);
        child.task_to_domain = params
            .task_to_domain
            .clone()
            .unwrap_or_else(|| request.inherited_domains.clone());
        child.correlation_id = request.correlation_id.clone();
        child.priority = request.priority;

        if !self.store.create_execution(&child).await? {
            let (existing, _) = self.store.read_execution(request.child_id).await?;
            return Ok(Spawned {
                child_id: existing.id,
                version: existing.workflow_version,
            });
        }

        info!(
            parent_id = %request.parent.execution_id,
            child_id = %child.id,
            workflow = %definition.name,
            version = definition.version,
            "spawned sub-workflow"
        );
        Ok(Spawned {
            child_id: child.id,
            version: definition.version,
        })
    }
}

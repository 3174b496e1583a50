//! Transitions and effects: the decider's output vocabulary.
//!
//! Transitions describe state changes to one execution and are applied
//! atomically. Effects are side effects (enqueueing, spawning, notifying)
//! performed only after the transitions that produced them have committed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::execution::{ExecutionStatus, ParentRef, TaskExecution, TaskStatus};
use crate::models::SubWorkflowParams;

/// New status (and optionally output/reason) for a non-terminal task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub reason: Option<String>,
    pub retryable: Option<bool>,
}

impl TaskUpdate {
    pub fn new(task_id: Uuid, status: TaskStatus) -> Self {
        Self {
            task_id,
            status,
            output: None,
            reason: None,
            retryable: None,
        }
    }

    pub fn completed(task_id: Uuid, output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::new(task_id, TaskStatus::Completed)
        }
    }

    pub fn failed(task_id: Uuid, reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            reason: Some(reason.into()),
            retryable: Some(retryable),
            ..Self::new(task_id, TaskStatus::Failed)
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// Insert a task record unless one with the same id already exists.
    Schedule(TaskExecution),
    /// Ignored once the task is terminal.
    UpdateTask(TaskUpdate),
    /// A later attempt now exists for this failed one.
    MarkRetried { task_id: Uuid },
    StartLease {
        task_id: Uuid,
        lease_id: Uuid,
        expires_at: DateTime<Utc>,
        worker_id: Option<String>,
    },
    ExtendLease {
        task_id: Uuid,
        lease_id: Uuid,
        expires_at: DateTime<Utc>,
    },
    /// Record the child execution created for a SUB_WORKFLOW task.
    LinkSubWorkflow {
        task_id: Uuid,
        child_id: Uuid,
        version: u32,
    },
    /// Ignored once the execution is terminal.
    SetStatus {
        status: ExecutionStatus,
        reason: Option<String>,
        output: Option<Value>,
    },
}

/// Everything needed to create a child execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub parent: ParentRef,
    pub child_id: Uuid,
    pub params: SubWorkflowParams,
    pub input: Value,
    /// The parent's domain map, used when `params` carries none.
    pub inherited_domains: BTreeMap<String, String>,
    pub correlation_id: Option<String>,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Effect {
    Enqueue {
        queue_name: String,
        task_id: Uuid,
        priority: i32,
    },
    SpawnSubWorkflow(SpawnRequest),
    TerminateSubWorkflow { child_id: Uuid, reason: String },
    /// A child reached a terminal status; its parent should re-decide.
    NotifyParent { parent: ParentRef, child_id: Uuid },
}

/// Transitions plus the effects they imply, stamped with one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionSet {
    pub at: DateTime<Utc>,
    pub transitions: Vec<Transition>,
    pub effects: Vec<Effect>,
}

impl TransitionSet {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            transitions: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.effects.is_empty()
    }
}

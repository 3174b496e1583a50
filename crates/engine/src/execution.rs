//! Execution snapshots.
//!
//! An [`Execution`] is the single mutable record of a running workflow. It
//! only ever changes through [`Execution::apply`], and applying the same
//! [`TransitionSet`] twice leaves it exactly as applying it once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{TaskType, WorkflowDefinition};
use crate::transition::{TaskUpdate, Transition, TransitionSet};

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Terminated,
}

impl ExecutionStatus {
    /// Once terminal, an execution never changes status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Scheduled,
    InProgress,
    Completed,
    Failed,
    TimedOut,
    Canceled,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Scheduled | Self::InProgress)
    }

    /// FAILED or TIMED_OUT: the attempt may be retried.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Canceled => "CANCELED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskExecution
// ---------------------------------------------------------------------------

/// Deterministic id of attempt `attempt` of task `reference` in an execution.
///
/// Re-deciding the same snapshot therefore produces the same records, which
/// is what makes re-applying a decision a no-op.
pub fn task_id_for(execution_id: Uuid, reference: &str, attempt: u32) -> Uuid {
    Uuid::new_v5(&execution_id, format!("{reference}#{attempt}").as_bytes())
}

/// One attempt of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub reference_name: String,
    pub task_name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// 1-based.
    pub attempt: u32,
    /// Set once a later attempt has been scheduled for this one.
    pub retried: bool,
    pub retryable: bool,
    /// Queue the task is dispatched on (SIMPLE tasks only).
    pub queue_name: Option<String>,
    pub domain: Option<String>,
    pub input: Value,
    pub output: Value,
    pub reason: Option<String>,
    pub lease_id: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub poll_count: u32,
    pub scheduled_at: DateTime<Utc>,
    /// Not dispatched before this instant (retry backoff).
    pub not_before: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub sub_workflow_id: Option<Uuid>,
    pub sub_workflow_version: Option<u32>,
}

impl TaskExecution {
    pub fn new(
        execution_id: Uuid,
        reference: &str,
        task_name: &str,
        task_type: TaskType,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: task_id_for(execution_id, reference, attempt),
            reference_name: reference.to_owned(),
            task_name: task_name.to_owned(),
            task_type,
            status: TaskStatus::Scheduled,
            attempt,
            retried: false,
            retryable: true,
            queue_name: None,
            domain: None,
            input: Value::Object(Default::default()),
            output: Value::Object(Default::default()),
            reason: None,
            lease_id: None,
            lease_expires_at: None,
            worker_id: None,
            poll_count: 0,
            scheduled_at: now,
            not_before: None,
            started_at: None,
            ended_at: None,
            sub_workflow_id: None,
            sub_workflow_version: None,
        }
    }

    /// Move the record to `status`, stamping start and end times.
    pub fn with_status(mut self, status: TaskStatus, now: DateTime<Utc>) -> Self {
        self.status = status;
        if status != TaskStatus::Scheduled {
            self.started_at.get_or_insert(now);
        }
        if status.is_terminal() {
            self.ended_at = Some(now);
        }
        self
    }

    /// Whether the record may be handed to a worker at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|at| at <= now)
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Link from a child execution back to the SUB_WORKFLOW task that spawned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub execution_id: Uuid,
    pub task_id: Uuid,
}

impl ParentRef {
    pub fn new(execution_id: Uuid, task_id: Uuid) -> Self {
        Self { execution_id, task_id }
    }
}

/// One run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_name: String,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Value,
    pub tasks: Vec<TaskExecution>,
    pub parent: Option<ParentRef>,
    #[serde(default)]
    pub task_to_domain: BTreeMap<String, String>,
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(id: Uuid, definition: &WorkflowDefinition, input: Value, now: DateTime<Utc>) -> Self {
        Self {
            id,
            workflow_name: definition.name.clone(),
            workflow_version: definition.version,
            status: ExecutionStatus::Running,
            input,
            output: Value::Object(Default::default()),
            tasks: Vec::new(),
            parent: None,
            task_to_domain: BTreeMap::new(),
            correlation_id: None,
            priority: 0,
            reason: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    pub fn task(&self, task_id: Uuid) -> Option<&TaskExecution> {
        self.tasks.iter().find(|task| task.id == task_id)
    }

    fn task_mut(&mut self, task_id: Uuid) -> Option<&mut TaskExecution> {
        self.tasks.iter_mut().find(|task| task.id == task_id)
    }

    /// The highest attempt of every task reference. Earlier attempts are
    /// history and take no part in readiness.
    pub fn latest_attempts(&self) -> HashMap<&str, &TaskExecution> {
        let mut latest: HashMap<&str, &TaskExecution> = HashMap::new();
        for task in &self.tasks {
            latest
                .entry(task.reference_name.as_str())
                .and_modify(|current| {
                    if task.attempt > current.attempt {
                        *current = task;
                    }
                })
                .or_insert(task);
        }
        latest
    }

    pub fn open_tasks(&self) -> impl Iterator<Item = &TaskExecution> {
        self.tasks.iter().filter(|task| !task.status.is_terminal())
    }

    /// Apply a transition set. Returns whether anything changed.
    pub fn apply(&mut self, set: &TransitionSet) -> bool {
        self.apply_all(&set.transitions, set.at)
    }

    pub fn apply_all(&mut self, transitions: &[Transition], at: DateTime<Utc>) -> bool {
        let mut changed = false;
        for transition in transitions {
            changed |= self.apply_one(transition, at);
        }
        if changed {
            self.updated_at = at;
        }
        changed
    }

    fn apply_one(&mut self, transition: &Transition, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        match transition {
            Transition::Schedule(task) => {
                if self.task(task.id).is_some() {
                    return false;
                }
                self.tasks.push(task.clone());
                true
            }
            Transition::UpdateTask(update) => self.update_task(update, at),
            Transition::MarkRetried { task_id } => match self.task_mut(*task_id) {
                Some(task) if !task.retried => {
                    task.retried = true;
                    true
                }
                _ => false,
            },
            Transition::StartLease {
                task_id,
                lease_id,
                expires_at,
                worker_id,
            } => match self.task_mut(*task_id) {
                Some(task) if !task.status.is_terminal() && task.lease_id != Some(*lease_id) => {
                    task.status = TaskStatus::InProgress;
                    task.lease_id = Some(*lease_id);
                    task.lease_expires_at = Some(*expires_at);
                    task.worker_id = worker_id.clone();
                    task.poll_count += 1;
                    task.started_at.get_or_insert(at);
                    true
                }
                _ => false,
            },
            Transition::ExtendLease {
                task_id,
                lease_id,
                expires_at,
            } => match self.task_mut(*task_id) {
                Some(task)
                    if task.status == TaskStatus::InProgress
                        && task.lease_id == Some(*lease_id)
                        && task.lease_expires_at != Some(*expires_at) =>
                {
                    task.lease_expires_at = Some(*expires_at);
                    true
                }
                _ => false,
            },
            Transition::LinkSubWorkflow {
                task_id,
                child_id,
                version,
            } => match self.task_mut(*task_id) {
                Some(task) if !task.status.is_terminal() && task.sub_workflow_id.is_none() => {
                    task.sub_workflow_id = Some(*child_id);
                    task.sub_workflow_version = Some(*version);
                    task.status = TaskStatus::InProgress;
                    task.started_at.get_or_insert(at);
                    true
                }
                _ => false,
            },
            Transition::SetStatus {
                status,
                reason,
                output,
            } => {
                if self.status == *status {
                    return false;
                }
                self.status = *status;
                if reason.is_some() {
                    self.reason = reason.clone();
                }
                if let Some(output) = output {
                    self.output = output.clone();
                }
                if status.is_terminal() {
                    self.ended_at = Some(at);
                }
                true
            }
        }
    }

    fn update_task(&mut self, update: &TaskUpdate, at: DateTime<Utc>) -> bool {
        let Some(task) = self.task_mut(update.task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }

        let before = task.clone();
        task.status = update.status;
        if let Some(output) = &update.output {
            task.output = output.clone();
        }
        if update.reason.is_some() {
            task.reason = update.reason.clone();
        }
        if let Some(retryable) = update.retryable {
            task.retryable = retryable;
        }
        if update.status != TaskStatus::Scheduled {
            task.started_at.get_or_insert(at);
        }
        if update.status.is_terminal() {
            task.ended_at = Some(at);
            task.lease_expires_at = None;
        }
        *task != before
    }
}

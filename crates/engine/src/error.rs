//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use crate::execution::{ExecutionStatus, TaskStatus};
use crate::payload::PayloadKind;
use crate::store::StoreError;

/// A workflow definition violates a structural invariant.
///
/// Detected when a definition is registered and again every time the decider
/// indexes it; an execution whose definition fails here is failed with the
/// error as its reason and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// The top-level task list is empty.
    #[error("workflow '{0}' has no tasks")]
    EmptyWorkflow(String),

    /// Two or more tasks share the same reference name.
    #[error("duplicate task reference name: '{0}'")]
    DuplicateReference(String),

    /// An input or output mapping names a task that doesn't exist.
    #[error("'{referenced_by}' references unknown task '{reference}'")]
    UnknownReference {
        reference: String,
        referenced_by: String,
    },

    /// The combined structural and data-dependency graph has a cycle.
    #[error("workflow graph contains a cycle through task '{0}'")]
    CycleDetected(String),

    /// A FORK is not immediately followed by its JOIN.
    #[error("fork '{0}' is not immediately followed by a join")]
    MissingJoin(String),

    /// A JOIN does not directly follow a FORK.
    #[error("join '{0}' does not follow a fork")]
    OrphanJoin(String),

    #[error("fork '{fork}' branch {branch} is empty")]
    EmptyForkBranch { fork: String, branch: usize },

    /// The JOIN names no task of one of the forked branches.
    #[error("join '{join}' does not wait on any task of fork '{fork}' branch {branch}")]
    UnjoinedBranch {
        join: String,
        fork: String,
        branch: usize,
    },

    #[error("join '{join}' waits on '{reference}', which is not inside fork '{fork}'")]
    JoinOutsideFork {
        join: String,
        fork: String,
        reference: String,
    },

    #[error("task '{reference}': {message}")]
    InvalidTask { reference: String, message: String },

    #[error("invalid workflow version '{0}'")]
    InvalidVersion(String),
}

/// Errors produced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    #[error("workflow definition '{name}' version {version} not found")]
    DefinitionNotFound { name: String, version: String },

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    /// The queue delivered a task whose record no longer accepts a lease.
    #[error("task {task_id} is {status} and cannot be leased")]
    TaskNotPollable { task_id: Uuid, status: TaskStatus },

    /// A result arrived for a task that already finished.
    #[error("task {0} already reached a terminal status")]
    TaskAlreadyTerminal(Uuid),

    /// The reporter does not hold the task's current lease.
    #[error("lease does not hold task {0}")]
    StaleLease(Uuid),

    #[error("cannot {action} execution {execution_id} in status {status}")]
    InvalidState {
        execution_id: Uuid,
        status: ExecutionStatus,
        action: &'static str,
    },

    #[error("missing workflow input '{0}'")]
    MissingInput(String),

    #[error("{kind} payload of {size_kb} KB exceeds the {max_kb} KB maximum")]
    PayloadTooLarge {
        kind: PayloadKind,
        size_kb: u64,
        max_kb: u64,
    },

    /// The compare-and-swap lost every race it entered.
    #[error("execution {execution_id} was modified concurrently {attempts} times in a row")]
    Conflict { execution_id: Uuid, attempts: u32 },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),
}

impl EngineError {
    /// Infrastructure errors the caller may retry; the next sweep retries
    /// them regardless.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Store(err) => err.is_transient(),
            Self::Queue(err) => err.is_transient(),
            _ => false,
        }
    }
}

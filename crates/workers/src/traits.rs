//! The `TaskHandler` trait: the contract every in-process worker fulfils.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::HandlerError;

/// Identity of the task attempt being executed.
///
/// Handed to every handler so it can log, deduplicate side effects, or
/// heartbeat. Execution is at-least-once: the same `task_id` may be delivered
/// again after a lease expires.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// ID of the owning workflow execution.
    pub execution_id: Uuid,
    /// ID of this task attempt.
    pub task_id: Uuid,
    /// Reference name of the task inside its workflow definition.
    pub reference_name: String,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Receipt of the lease held while executing.
    pub lease_id: Uuid,
}

/// The core handler trait.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task with its resolved `input` and return its JSON output.
    async fn execute(&self, input: Value, ctx: &TaskContext) -> Result<Value, HandlerError>;
}

//! `engine` crate: workflow definitions, the decider, and the machinery that
//! applies its decisions.
//!
//! Layering, leaf-first:
//! - [`retry`], [`payload`], [`input`], [`dag`]: pure helpers.
//! - [`decider`]: pure `decide(definition, snapshot, now) -> TransitionSet`.
//! - [`linker`]: turns sub-workflow tasks into child executions.
//! - [`executor`]: the applying layer: read, decide, compare-and-swap, fan out.
//! - [`sweeper`]: periodic re-evaluation guaranteeing liveness.
//! - [`runner`]: in-process workers polling the queue.

pub mod config;
pub mod dag;
pub mod decider;
pub mod error;
pub mod execution;
pub mod executor;
pub mod input;
pub mod linker;
pub mod models;
pub mod modules;
pub mod payload;
pub mod pg_store;
pub mod retry;
pub mod runner;
pub mod store;
pub mod sweeper;
pub mod transition;

pub use config::{EngineConfig, PayloadThresholds, ServerIdentity};
pub use decider::Decider;
pub use error::{DefinitionError, EngineError};
pub use execution::{Execution, ExecutionStatus, ParentRef, TaskExecution, TaskStatus};
pub use executor::{
    PolledTask, StartRequest, SweepOutcome, TaskResult, TaskResultStatus, UpdateOutcome, WorkflowExecutor,
};
pub use models::{TaskDefinition, TaskKind, TaskType, WorkflowDefinition, WorkflowVersion};
pub use pg_store::PgStore;
pub use runner::WorkerPool;
pub use store::{ExecutionStore, MemoryStore};
pub use sweeper::{SweepReport, Sweeper};
pub use transition::{Effect, Transition, TransitionSet};

#[cfg(test)]
mod executor_tests;

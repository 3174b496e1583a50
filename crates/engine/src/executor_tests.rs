//! End-to-end tests for the executor, sweeper and worker pool.
//!
//! Everything runs against `MemoryStore` and `MemoryQueue` sharing one
//! `ManualClock`, so lease expiry and retry delays are driven explicitly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use queue::{ManualClock, MemoryQueue, QueueError, TaskQueue};
use workers::mock::MockHandler;
use workers::TaskHandler;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::execution::{Execution, ExecutionStatus, TaskExecution, TaskStatus};
use crate::executor::{PolledTask, StartRequest, TaskResult, TaskResultStatus, UpdateOutcome, WorkflowExecutor};
use crate::models::{SubWorkflowParams, TaskDefinition, TaskKind, WorkflowDefinition, WorkflowVersion};
use crate::modules::ExecutionListener;
use crate::retry::{BackoffKind, RetryPolicy};
use crate::runner::WorkerPool;
use crate::store::{ApplyOutcome, ExecutionStore, MemoryStore, StoreError, VersionToken};
use crate::sweeper::Sweeper;
use crate::transition::TransitionSet;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    executor: Arc<WorkflowExecutor>,
    clock: Arc<ManualClock>,
    queue: Arc<MemoryQueue>,
}

fn harness_with(store: Arc<dyn ExecutionStore>, config: EngineConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = Arc::new(MemoryQueue::with_clock(clock.clone()));
    let executor = WorkflowExecutor::new(store, queue.clone(), config).with_clock(clock.clone());
    Harness {
        executor: Arc::new(executor),
        clock,
        queue,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new()), EngineConfig::default())
}

fn linear() -> WorkflowDefinition {
    let mut definition = WorkflowDefinition::new(
        "linear",
        1,
        vec![
            TaskDefinition::simple("a").with_input("who", json!("${workflow.input.who}")),
            TaskDefinition::simple("b").with_input("prev", json!("${a.output.value}")),
        ],
    );
    definition.output_parameters.insert("result".into(), json!("${b.output.done}"));
    definition
}

fn single(name: &str, retry: RetryPolicy) -> WorkflowDefinition {
    WorkflowDefinition::new(name, 1, vec![TaskDefinition::simple("a").with_retry(retry)])
}

fn billing() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "billing",
        1,
        vec![TaskDefinition::simple("charge").with_input("amount", json!("${workflow.input.amount}"))],
    )
}

fn checkout() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "checkout",
        1,
        vec![TaskDefinition::new(
            "pay",
            "pay",
            TaskKind::SubWorkflow {
                sub_workflow_param: SubWorkflowParams {
                    name: "billing".into(),
                    version: WorkflowVersion::Unspecified,
                    task_to_domain: None,
                },
            },
        )
        .with_input("amount", json!("${workflow.input.amount}"))],
    )
}

async fn poll(harness: &Harness, queue_name: &str) -> PolledTask {
    harness
        .executor
        .poll_task(queue_name, None, "worker-1")
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("expected a task on '{queue_name}'"))
}

async fn complete(harness: &Harness, polled: &PolledTask, output: Value) -> UpdateOutcome {
    harness
        .executor
        .update_task(TaskResult::completed(polled.task.id, Some(polled.lease.lease_id), output))
        .await
        .unwrap()
}

fn latest<'e>(execution: &'e Execution, reference: &str) -> &'e TaskExecution {
    execution.latest_attempts()[reference]
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_workflow_runs_end_to_end() {
    let h = harness();
    h.executor.register_definition(&linear()).await.unwrap();
    let id = h
        .executor
        .start_workflow(StartRequest::new("linear", json!({ "who": "ada" })))
        .await
        .unwrap();

    let a = poll(&h, "a").await;
    assert_eq!(a.execution_id, id);
    assert_eq!(a.task.status, TaskStatus::InProgress);
    assert_eq!(a.task.input, json!({ "who": "ada" }));
    assert!(h.executor.poll_task("b", None, "worker-1").await.unwrap().is_none());

    assert_eq!(complete(&h, &a, json!({ "value": 1 })).await, UpdateOutcome::Applied);

    let b = poll(&h, "b").await;
    assert_eq!(b.task.input, json!({ "prev": 1 }));
    complete(&h, &b, json!({ "done": true })).await;

    let execution = h.executor.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, json!({ "result": true }));
    assert_eq!(h.queue.depth("a").await.unwrap(), 0);
    assert_eq!(h.queue.depth("b").await.unwrap(), 0);
}

#[tokio::test]
async fn start_rejects_unknown_workflows_and_missing_input() {
    let h = harness();
    let err = h
        .executor
        .start_workflow(StartRequest::new("nope", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DefinitionNotFound { .. }));

    let mut definition = linear();
    definition.input_parameters = vec!["who".into()];
    h.executor.register_definition(&definition).await.unwrap();
    let err = h
        .executor
        .start_workflow(StartRequest::new("linear", json!({ "other": 1 })))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingInput(key) if key == "who"));
}

#[tokio::test]
async fn invalid_definitions_are_not_registered() {
    let h = harness();
    let broken = WorkflowDefinition::new(
        "broken",
        1,
        vec![TaskDefinition::simple("a").with_input("x", json!("${missing.output.y}"))],
    );
    let err = h.executor.register_definition(&broken).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidDefinition(_)));
    assert!(h.executor.get_definition("broken", None).await.is_err());
}

#[tokio::test]
async fn oversized_task_output_is_rejected() {
    let mut config = EngineConfig::default();
    config.payload.task_output_kb = 1;
    config.payload.max_task_output_kb = 1;
    let h = harness_with(Arc::new(MemoryStore::new()), config);
    h.executor.register_definition(&linear()).await.unwrap();
    h.executor
        .start_workflow(StartRequest::new("linear", json!({ "who": "ada" })))
        .await
        .unwrap();

    let a = poll(&h, "a").await;
    let err = h
        .executor
        .update_task(TaskResult::completed(
            a.task.id,
            Some(a.lease.lease_id),
            json!({ "blob": "x".repeat(4096) }),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PayloadTooLarge { .. }));
}

// ---------------------------------------------------------------------------
// Failures, retries, leases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retryable_failures_wait_for_the_backoff_then_exhaust() {
    let h = harness();
    h.executor
        .register_definition(&single("flaky", RetryPolicy::new(2, BackoffKind::Fixed, 1)))
        .await
        .unwrap();
    let id = h
        .executor
        .start_workflow(StartRequest::new("flaky", json!({})))
        .await
        .unwrap();

    let first = poll(&h, "a").await;
    h.executor
        .update_task(TaskResult::failed(first.task.id, Some(first.lease.lease_id), "boom", true))
        .await
        .unwrap();

    let execution = h.executor.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(latest(&execution, "a").attempt, 2);
    assert!(h.executor.poll_task("a", None, "worker-1").await.unwrap().is_none());

    h.clock.advance(Duration::from_secs(1));
    h.executor.decide(id).await.unwrap();
    let second = poll(&h, "a").await;
    assert_eq!(second.task.attempt, 2);
    h.executor
        .update_task(TaskResult::failed(second.task.id, Some(second.lease.lease_id), "boom again", true))
        .await
        .unwrap();

    let execution = h.executor.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.reason.unwrap_or_default().contains("boom again"));
}

#[tokio::test]
async fn terminal_error_fails_without_retry() {
    let h = harness();
    h.executor
        .register_definition(&single("strict", RetryPolicy::new(5, BackoffKind::Fixed, 1)))
        .await
        .unwrap();
    let id = h
        .executor
        .start_workflow(StartRequest::new("strict", json!({})))
        .await
        .unwrap();

    let polled = poll(&h, "a").await;
    h.executor
        .update_task(TaskResult::failed(polled.task.id, Some(polled.lease.lease_id), "bad input", false))
        .await
        .unwrap();

    let execution = h.executor.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.tasks.len(), 1);
}

#[tokio::test]
async fn expired_lease_is_swept_and_late_reports_are_ignored() {
    let h = harness();
    h.executor
        .register_definition(&single("slow", RetryPolicy::new(3, BackoffKind::Fixed, 1)))
        .await
        .unwrap();
    let id = h
        .executor
        .start_workflow(StartRequest::new("slow", json!({})))
        .await
        .unwrap();
    let sweeper = Sweeper::new(h.executor.clone(), h.executor.config());

    let first = poll(&h, "a").await;
    h.clock.advance(Duration::from_secs(61));
    let report = sweeper.sweep_once().await;
    assert_eq!(report.swept, 1);

    let execution = h.executor.get_execution(id).await.unwrap();
    assert_eq!(execution.task(first.task.id).unwrap().status, TaskStatus::TimedOut);
    assert_eq!(latest(&execution, "a").attempt, 2);

    let late = complete(&h, &first, json!({ "late": true })).await;
    assert_eq!(late, UpdateOutcome::Ignored);

    h.clock.advance(Duration::from_secs(1));
    sweeper.sweep_once().await;
    let second = poll(&h, "a").await;
    assert_eq!(second.task.attempt, 2);
    assert!(h.executor.ack_task(first.task.id, first.lease.lease_id).await.is_err());

    complete(&h, &second, json!({ "ok": true })).await;
    let execution = h.executor.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn superseded_lease_cannot_report() {
    let h = harness();
    h.executor.register_definition(&linear()).await.unwrap();
    h.executor
        .start_workflow(StartRequest::new("linear", json!({ "who": "ada" })))
        .await
        .unwrap();

    let first = poll(&h, "a").await;
    h.clock.advance(Duration::from_secs(61));
    let second = h
        .executor
        .poll_task("a", None, "worker-2")
        .await
        .unwrap()
        .expect("expired lease is re-delivered");
    assert_eq!(second.task.id, first.task.id);
    assert_ne!(second.lease.lease_id, first.lease.lease_id);
    assert_eq!(second.task.poll_count, 2);

    let err = h
        .executor
        .update_task(TaskResult::completed(first.task.id, Some(first.lease.lease_id), json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StaleLease(_)));
    assert_eq!(complete(&h, &second, json!({ "value": 2 })).await, UpdateOutcome::Applied);
}

#[tokio::test]
async fn heartbeat_keeps_the_lease_alive() {
    let h = harness();
    h.executor.register_definition(&linear()).await.unwrap();
    h.executor
        .start_workflow(StartRequest::new("linear", json!({ "who": "ada" })))
        .await
        .unwrap();
    let sweeper = Sweeper::new(h.executor.clone(), h.executor.config());

    let polled = poll(&h, "a").await;
    h.clock.advance(Duration::from_secs(50));
    h.executor
        .extend_lease(polled.task.id, polled.lease.lease_id)
        .await
        .unwrap();
    h.clock.advance(Duration::from_secs(50));
    assert_eq!(sweeper.sweep_once().await.swept, 0);

    assert_eq!(complete(&h, &polled, json!({ "value": 1 })).await, UpdateOutcome::Applied);
}

#[tokio::test]
async fn acked_task_can_still_heartbeat() {
    let h = harness();
    h.executor.register_definition(&linear()).await.unwrap();
    h.executor
        .start_workflow(StartRequest::new("linear", json!({ "who": "ada" })))
        .await
        .unwrap();
    let sweeper = Sweeper::new(h.executor.clone(), h.executor.config());

    let polled = poll(&h, "a").await;
    h.executor.ack_task(polled.task.id, polled.lease.lease_id).await.unwrap();
    assert_eq!(h.queue.depth("a").await.unwrap(), 0);

    h.clock.advance(Duration::from_secs(50));
    h.executor
        .extend_lease(polled.task.id, polled.lease.lease_id)
        .await
        .unwrap();
    h.clock.advance(Duration::from_secs(20));
    assert_eq!(sweeper.sweep_once().await.swept, 0);

    // A progress report renews the lease the same way.
    h.clock.advance(Duration::from_secs(30));
    let progress = TaskResult {
        status: TaskResultStatus::InProgress,
        ..TaskResult::completed(polled.task.id, Some(polled.lease.lease_id), json!({}))
    };
    assert_eq!(h.executor.update_task(progress).await.unwrap(), UpdateOutcome::Applied);
    h.clock.advance(Duration::from_secs(40));
    assert_eq!(sweeper.sweep_once().await.swept, 0);

    assert_eq!(complete(&h, &polled, json!({ "value": 1 })).await, UpdateOutcome::Applied);
    assert_eq!(poll(&h, "b").await.task.input["prev"], json!(1));
}

#[tokio::test]
async fn acked_task_without_heartbeat_times_out() {
    let h = harness();
    h.executor.register_definition(&linear()).await.unwrap();
    h.executor
        .start_workflow(StartRequest::new("linear", json!({ "who": "ada" })))
        .await
        .unwrap();
    let sweeper = Sweeper::new(h.executor.clone(), h.executor.config());

    let polled = poll(&h, "a").await;
    h.executor.ack_task(polled.task.id, polled.lease.lease_id).await.unwrap();
    h.clock.advance(Duration::from_secs(61));

    assert!(matches!(
        h.executor.extend_lease(polled.task.id, polled.lease.lease_id).await,
        Err(EngineError::Queue(QueueError::LeaseExpired { .. }))
    ));
    assert_eq!(sweeper.sweep_once().await.swept, 1);
    assert_eq!(complete(&h, &polled, json!({ "value": 1 })).await, UpdateOutcome::Ignored);
}

// ---------------------------------------------------------------------------
// Pause, resume, terminate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn paused_executions_hand_out_nothing_until_resumed() {
    let h = harness();
    h.executor.register_definition(&linear()).await.unwrap();
    let id = h
        .executor
        .start_workflow(StartRequest::new("linear", json!({ "who": "ada" })))
        .await
        .unwrap();

    h.executor.pause(id).await.unwrap();
    assert!(matches!(
        h.executor.pause(id).await,
        Err(EngineError::InvalidState { action: "pause", .. })
    ));
    assert!(h.executor.poll_task("a", None, "worker-1").await.unwrap().is_none());

    let resumed = h.executor.resume(id).await.unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Running);
    let a = poll(&h, "a").await;
    assert_eq!(a.execution_id, id);
}

#[tokio::test]
async fn terminate_cancels_open_tasks() {
    let h = harness();
    h.executor.register_definition(&linear()).await.unwrap();
    let id = h
        .executor
        .start_workflow(StartRequest::new("linear", json!({ "who": "ada" })))
        .await
        .unwrap();
    let a = poll(&h, "a").await;

    let execution = h.executor.terminate(id, "operator request").await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Terminated);
    assert_eq!(execution.reason.as_deref(), Some("operator request"));
    assert_eq!(latest(&execution, "a").status, TaskStatus::Canceled);

    assert_eq!(complete(&h, &a, json!({})).await, UpdateOutcome::Ignored);
    assert!(matches!(
        h.executor.terminate(id, "again").await,
        Err(EngineError::InvalidState { .. })
    ));
}

// ---------------------------------------------------------------------------
// Sub-workflows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sub_workflow_completion_completes_the_parent_task() {
    let h = harness();
    h.executor.register_definition(&billing()).await.unwrap();
    h.executor.register_definition(&checkout()).await.unwrap();
    let parent_id = h
        .executor
        .start_workflow(StartRequest::new("checkout", json!({ "amount": 5 })))
        .await
        .unwrap();

    let parent = h.executor.get_execution(parent_id).await.unwrap();
    let pay = latest(&parent, "pay");
    assert_eq!(pay.status, TaskStatus::InProgress);
    let child_id = pay.sub_workflow_id.expect("child linked");
    assert_eq!(pay.sub_workflow_version, Some(1));

    let child = h.executor.get_execution(child_id).await.unwrap();
    assert_eq!(child.parent.map(|p| p.execution_id), Some(parent_id));
    assert_eq!(child.input, json!({ "amount": 5 }));

    let charge = poll(&h, "charge").await;
    assert_eq!(charge.execution_id, child_id);
    assert_eq!(charge.task.input, json!({ "amount": 5 }));
    complete(&h, &charge, json!({ "charged": 5 })).await;

    let child = h.executor.get_execution(child_id).await.unwrap();
    assert_eq!(child.status, ExecutionStatus::Completed);
    let parent = h.executor.get_execution(parent_id).await.unwrap();
    assert_eq!(latest(&parent, "pay").output, json!({ "charged": 5 }));
    assert_eq!(parent.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn failed_child_fails_the_parent_task() {
    let h = harness();
    h.executor.register_definition(&billing()).await.unwrap();
    let mut definition = checkout();
    definition.retry = Some(RetryPolicy::none());
    h.executor.register_definition(&definition).await.unwrap();
    let parent_id = h
        .executor
        .start_workflow(StartRequest::new("checkout", json!({ "amount": 5 })))
        .await
        .unwrap();

    let charge = poll(&h, "charge").await;
    h.executor
        .update_task(TaskResult::failed(charge.task.id, Some(charge.lease.lease_id), "card declined", false))
        .await
        .unwrap();

    let parent = h.executor.get_execution(parent_id).await.unwrap();
    assert_eq!(latest(&parent, "pay").status, TaskStatus::Failed);
    assert_eq!(parent.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn terminating_the_parent_terminates_the_child() {
    let h = harness();
    h.executor.register_definition(&billing()).await.unwrap();
    h.executor.register_definition(&checkout()).await.unwrap();
    let parent_id = h
        .executor
        .start_workflow(StartRequest::new("checkout", json!({ "amount": 5 })))
        .await
        .unwrap();
    let child_id = {
        let parent = h.executor.get_execution(parent_id).await.unwrap();
        latest(&parent, "pay").sub_workflow_id.unwrap()
    };

    h.executor.terminate(parent_id, "customer left").await.unwrap();

    let child = h.executor.get_execution(child_id).await.unwrap();
    assert_eq!(child.status, ExecutionStatus::Terminated);
    assert_eq!(latest(&child, "charge").status, TaskStatus::Canceled);
    assert!(h.executor.poll_task("charge", None, "worker-1").await.unwrap().is_none());
}

#[tokio::test]
async fn missing_child_definition_fails_the_parent() {
    let h = harness();
    h.executor.register_definition(&checkout()).await.unwrap();
    let parent_id = h
        .executor
        .start_workflow(StartRequest::new("checkout", json!({ "amount": 5 })))
        .await
        .unwrap();

    let parent = h.executor.get_execution(parent_id).await.unwrap();
    assert_eq!(latest(&parent, "pay").status, TaskStatus::Failed);
    assert_eq!(parent.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn sub_workflow_domain_map_routes_child_tasks() {
    let h = harness();
    let mut child = billing();
    child.tasks.push(TaskDefinition::simple("receipt"));
    h.executor.register_definition(&child).await.unwrap();
    let mut parent = checkout();
    if let TaskKind::SubWorkflow { sub_workflow_param } = &mut parent.tasks[0].kind {
        sub_workflow_param.task_to_domain = Some([("charge".to_owned(), "teamA".to_owned())].into());
    }
    h.executor.register_definition(&parent).await.unwrap();
    h.executor
        .start_workflow(StartRequest::new("checkout", json!({ "amount": 5 })))
        .await
        .unwrap();

    assert!(h.executor.poll_task("charge", None, "worker-1").await.unwrap().is_none());
    let charge = h
        .executor
        .poll_task("charge", Some("teamA"), "worker-1")
        .await
        .unwrap()
        .expect("routed to the teamA queue");
    assert_eq!(charge.lease.queue_name, "charge:teamA");
    complete(&h, &charge, json!({})).await;

    let receipt = poll(&h, "receipt").await;
    assert_eq!(receipt.lease.queue_name, "receipt");
}

// ---------------------------------------------------------------------------
// Sweeper, listeners, worker pool
// ---------------------------------------------------------------------------

/// Delegates to a `MemoryStore` but fails every read of one execution.
struct FlakyStore {
    inner: MemoryStore,
    broken: Mutex<Option<Uuid>>,
}

impl FlakyStore {
    fn is_broken(&self, id: Uuid) -> bool {
        self.broken.lock().map(|b| *b == Some(id)).unwrap_or(false)
    }
}

#[async_trait]
impl ExecutionStore for FlakyStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        self.inner.save_definition(definition).await
    }

    async fn load_definition(&self, name: &str, version: Option<u32>) -> Result<Option<WorkflowDefinition>, StoreError> {
        self.inner.load_definition(name, version).await
    }

    async fn create_execution(&self, execution: &Execution) -> Result<bool, StoreError> {
        self.inner.create_execution(execution).await
    }

    async fn read_execution(&self, id: Uuid) -> Result<(Execution, VersionToken), StoreError> {
        if self.is_broken(id) {
            return Err(StoreError::Database(db::DbError::NotFound));
        }
        self.inner.read_execution(id).await
    }

    async fn apply_transitions(
        &self,
        id: Uuid,
        expected: VersionToken,
        set: &TransitionSet,
    ) -> Result<ApplyOutcome, StoreError> {
        self.inner.apply_transitions(id, expected, set).await
    }

    async fn running_executions(&self) -> Result<Vec<Uuid>, StoreError> {
        self.inner.running_executions().await
    }

    async fn execution_for_task(&self, task_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        self.inner.execution_for_task(task_id).await
    }
}

#[tokio::test]
async fn one_broken_execution_does_not_stop_the_sweep() {
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        broken: Mutex::new(None),
    });
    let h = harness_with(store.clone(), EngineConfig::default());
    h.executor.register_definition(&linear()).await.unwrap();
    let healthy = h
        .executor
        .start_workflow(StartRequest::new("linear", json!({ "who": "a" })))
        .await
        .unwrap();
    let broken = h
        .executor
        .start_workflow(StartRequest::new("linear", json!({ "who": "b" })))
        .await
        .unwrap();
    *store.broken.lock().unwrap() = Some(broken);

    let sweeper = Sweeper::new(h.executor.clone(), h.executor.config());
    let report = sweeper.sweep_once().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.swept + report.skipped, 1);
    assert_eq!(
        h.executor.get_execution(healthy).await.unwrap().status,
        ExecutionStatus::Running
    );
}

/// Delegates to a `MemoryStore` but loses the next `conflicts` writes, as if
/// another server kept writing first.
struct ContendedStore {
    inner: MemoryStore,
    conflicts: AtomicUsize,
    writes: AtomicUsize,
}

impl ContendedStore {
    fn losing(conflicts: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            conflicts: AtomicUsize::new(conflicts),
            writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ExecutionStore for ContendedStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        self.inner.save_definition(definition).await
    }

    async fn load_definition(&self, name: &str, version: Option<u32>) -> Result<Option<WorkflowDefinition>, StoreError> {
        self.inner.load_definition(name, version).await
    }

    async fn create_execution(&self, execution: &Execution) -> Result<bool, StoreError> {
        self.inner.create_execution(execution).await
    }

    async fn read_execution(&self, id: Uuid) -> Result<(Execution, VersionToken), StoreError> {
        self.inner.read_execution(id).await
    }

    async fn apply_transitions(
        &self,
        id: Uuid,
        expected: VersionToken,
        set: &TransitionSet,
    ) -> Result<ApplyOutcome, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let lost = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if lost {
            return Ok(ApplyOutcome::Conflict);
        }
        self.inner.apply_transitions(id, expected, set).await
    }

    async fn running_executions(&self) -> Result<Vec<Uuid>, StoreError> {
        self.inner.running_executions().await
    }

    async fn execution_for_task(&self, task_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        self.inner.execution_for_task(task_id).await
    }
}

#[tokio::test]
async fn lost_writes_are_retried_until_one_lands() {
    let store = Arc::new(ContendedStore::losing(3));
    let h = harness_with(store.clone(), EngineConfig::default());
    h.executor.register_definition(&linear()).await.unwrap();
    let id = h
        .executor
        .start_workflow(StartRequest::new("linear", json!({ "who": "ada" })))
        .await
        .unwrap();

    assert_eq!(store.writes.load(Ordering::SeqCst), 4);
    let a = poll(&h, "a").await;
    assert_eq!(a.execution_id, id);
    assert_eq!(a.task.attempt, 1);
    assert_eq!(h.executor.get_execution(id).await.unwrap().tasks.len(), 1);
}

#[tokio::test]
async fn endless_write_conflicts_surface_as_transient() {
    let store = Arc::new(ContendedStore::losing(usize::MAX));
    let h = harness_with(store.clone(), EngineConfig::default());
    h.executor.register_definition(&linear()).await.unwrap();

    let err = h
        .executor
        .start_workflow(StartRequest::new("linear", json!({ "who": "ada" })))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { attempts: 5, .. }));
    assert!(err.is_transient());
    assert_eq!(store.writes.load(Ordering::SeqCst), 5);
    assert!(h.executor.poll_task("a", None, "worker-1").await.unwrap().is_none());
}

#[derive(Default)]
struct CountingListener {
    finished: AtomicUsize,
}

#[async_trait]
impl ExecutionListener for CountingListener {
    async fn on_terminal(&self, _execution: &Execution) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn worker_pool_drives_a_workflow_and_listeners_hear_the_end() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = Arc::new(MemoryQueue::with_clock(clock.clone()));
    let listener = Arc::new(CountingListener::default());
    let as_listener: Arc<dyn ExecutionListener> = listener.clone();
    let executor = Arc::new(
        WorkflowExecutor::new(Arc::new(MemoryStore::new()), queue, EngineConfig::default())
            .with_clock(clock)
            .with_listeners(vec![as_listener]),
    );
    executor.register_definition(&linear()).await.unwrap();
    let id = executor
        .start_workflow(StartRequest::new("linear", json!({ "who": "ada" })))
        .await
        .unwrap();

    let a: Arc<dyn TaskHandler> = Arc::new(MockHandler::returning("a", json!({ "value": 7 })));
    let b = Arc::new(MockHandler::returning("b", json!({ "done": "yes" })));
    let mut handlers: HashMap<String, Arc<dyn TaskHandler>> = HashMap::new();
    handlers.insert("a".into(), a.clone());
    handlers.insert("b".into(), b.clone());
    let pool = WorkerPool::new(executor.clone(), handlers, "pool-1");

    assert!(!pool.run_once("b", b.as_ref()).await.unwrap());
    assert!(pool.run_once("a", a.as_ref()).await.unwrap());
    assert!(pool.run_once("b", b.as_ref()).await.unwrap());
    assert_eq!(b.call_count(), 1);
    assert_eq!(b.calls.lock().unwrap()[0], json!({ "prev": 7 }));

    let execution = executor.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, json!({ "result": "yes" }));
    assert_eq!(listener.finished.load(Ordering::SeqCst), 1);
}

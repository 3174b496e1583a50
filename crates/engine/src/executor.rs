//! Workflow execution engine.
//!
//! `WorkflowExecutor` is the applying layer around the pure [`Decider`]:
//! 1. Reads the execution snapshot and its version token.
//! 2. Applies the triggering event (task result, lease, terminate, ...) to a
//!    working copy and lets the decider react to it.
//! 3. Writes the combined transition set with a compare-and-swap, re-reading
//!    and re-deciding on conflict (bounded by `max_apply_attempts`).
//! 4. Only after the write commits, performs the effects: enqueueing tasks,
//!    spawning sub-workflows, terminating children, notifying parents.
//!
//! Effects that touch other executions are processed from a worklist rather
//! than recursively, so a parent/child chain never nests async calls.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use queue::clock::after;
use queue::{Clock, Lease, QueueError, SystemClock, TaskQueue};

use crate::config::EngineConfig;
use crate::dag::DefinitionIndex;
use crate::decider::{terminal_transitions, Decider};
use crate::error::EngineError;
use crate::execution::{Execution, ExecutionStatus, ParentRef, TaskExecution, TaskStatus};
use crate::linker::{child_outcome, SubWorkflowLinker};
use crate::models::{TaskType, TimeoutPolicy, WorkflowDefinition};
use crate::modules::ExecutionListener;
use crate::payload::{PayloadGuard, PayloadKind};
use crate::store::{ApplyOutcome, ExecutionStore, StoreError};
use crate::sweeper::expired_tasks;
use crate::transition::{Effect, SpawnRequest, TaskUpdate, Transition, TransitionSet};

/// Upper bound on queue entries discarded by a single poll before giving up.
const MAX_DISCARDS_PER_POLL: usize = 16;

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// Parameters for starting an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub name: String,
    /// `None` starts the latest registered version.
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// 0-99, higher is polled first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub task_to_domain: BTreeMap<String, String>,
}

impl StartRequest {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            name: name.into(),
            version: None,
            input,
            correlation_id: None,
            priority: 0,
            task_to_domain: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResultStatus {
    /// Still working; extends the lease and records interim output.
    InProgress,
    Completed,
    /// Retryable failure.
    Failed,
    /// Fails without consulting the retry policy.
    FailedWithTerminalError,
}

impl TaskResultStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::InProgress
    }
}

/// A worker's report for one task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    /// Receipt of the lease the worker holds; required for leased tasks.
    #[serde(default)]
    pub lease_id: Option<Uuid>,
    pub status: TaskResultStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl TaskResult {
    pub fn completed(task_id: Uuid, lease_id: Option<Uuid>, output: Value) -> Self {
        Self {
            task_id,
            lease_id,
            status: TaskResultStatus::Completed,
            output: Some(output),
            reason: None,
        }
    }

    pub fn failed(task_id: Uuid, lease_id: Option<Uuid>, reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            task_id,
            lease_id,
            status: if retryable {
                TaskResultStatus::Failed
            } else {
                TaskResultStatus::FailedWithTerminalError
            },
            output: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Applied,
    /// The task (or its execution) had already finished; nothing changed.
    Ignored,
}

/// A task handed to a worker, with the lease it holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolledTask {
    pub execution_id: Uuid,
    pub task: TaskExecution,
    pub lease: Lease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Swept { changed: bool },
    /// The execution was no longer running.
    Skipped,
}

/// Work on other executions produced by a committed write.
#[derive(Debug)]
enum FollowUp {
    Decide(Uuid),
    Spawn(SpawnRequest),
    ChildTerminal { parent: ParentRef, child_id: Uuid },
    Terminate { execution_id: Uuid, reason: String },
}

/// Result of one committed read-decide-write cycle.
struct Evaluation {
    execution: Execution,
    changed: bool,
    follow_ups: Vec<FollowUp>,
}

fn no_event(
    _: &WorkflowDefinition,
    _: &Execution,
    _: DateTime<Utc>,
) -> Result<Vec<Transition>, EngineError> {
    Ok(Vec::new())
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Shared orchestrator. Construct one per process and hand it around in an
/// `Arc`; every method is safe to call concurrently.
pub struct WorkflowExecutor {
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn TaskQueue>,
    decider: Decider,
    linker: SubWorkflowLinker,
    payload: PayloadGuard,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    listeners: Vec<Arc<dyn ExecutionListener>>,
}

impl WorkflowExecutor {
    pub fn new(store: Arc<dyn ExecutionStore>, queue: Arc<dyn TaskQueue>, config: EngineConfig) -> Self {
        Self {
            linker: SubWorkflowLinker::new(store.clone()),
            decider: Decider::from_config(&config),
            payload: PayloadGuard::new(config.payload.clone()),
            store,
            queue,
            clock: Arc::new(SystemClock),
            config,
            listeners: Vec::new(),
        }
    }

    /// Replace the system clock; the queue should share the same one.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_listeners(mut self, listeners: Vec<Arc<dyn ExecutionListener>>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and store a new definition version.
    #[instrument(skip(self, definition), fields(workflow = %definition.name, version = definition.version))]
    pub async fn register_definition(&self, definition: &WorkflowDefinition) -> Result<(), EngineError> {
        DefinitionIndex::build(definition)?;
        self.store.save_definition(definition).await?;
        info!("registered workflow definition");
        Ok(())
    }

    pub async fn get_definition(&self, name: &str, version: Option<u32>) -> Result<WorkflowDefinition, EngineError> {
        self.store
            .load_definition(name, version)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound {
                name: name.to_owned(),
                version: version.map_or_else(|| "latest".to_owned(), |v| v.to_string()),
            })
    }

    // -----------------------------------------------------------------------
    // Execution lifecycle
    // -----------------------------------------------------------------------

    /// Create an execution and run its first decision.
    ///
    /// # Errors
    /// [`EngineError::PayloadTooLarge`] above the hard input limit,
    /// [`EngineError::DefinitionNotFound`], [`EngineError::MissingInput`], or
    /// storage errors.
    #[instrument(skip(self, request), fields(workflow = %request.name))]
    pub async fn start_workflow(&self, request: StartRequest) -> Result<Uuid, EngineError> {
        let input = if request.input.is_null() { json!({}) } else { request.input };
        self.payload.check(PayloadKind::WorkflowInput, &input)?;

        let definition = self.get_definition(&request.name, request.version).await?;
        if let Some(missing) = definition.input_parameters.iter().find(|key| input.get(key.as_str()).is_none()) {
            return Err(EngineError::MissingInput(missing.clone()));
        }

        let id = Uuid::new_v4();
        let mut execution = Execution::new(id, &definition, input, self.clock.now());
        execution.correlation_id = request.correlation_id;
        execution.priority = request.priority.clamp(0, 99);
        execution.task_to_domain = request.task_to_domain;
        self.store.create_execution(&execution).await?;
        info!(execution_id = %id, version = definition.version, "started workflow");

        let evaluation = self.evaluate(id, no_event).await?;
        self.run_follow_ups(evaluation.follow_ups).await;
        Ok(id)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Execution, EngineError> {
        self.read(id).await.map(|(execution, _)| execution)
    }

    /// Re-run the decider for one execution.
    #[instrument(skip(self))]
    pub async fn decide(&self, id: Uuid) -> Result<Execution, EngineError> {
        let evaluation = self.evaluate(id, no_event).await?;
        self.run_follow_ups(evaluation.follow_ups).await;
        Ok(evaluation.execution)
    }

    /// Terminate a non-terminal execution, its open tasks and its running
    /// children.
    #[instrument(skip(self))]
    pub async fn terminate(&self, id: Uuid, reason: &str) -> Result<Execution, EngineError> {
        let evaluation = self.terminate_one(id, reason).await?;
        self.run_follow_ups(evaluation.follow_ups).await;
        Ok(evaluation.execution)
    }

    /// Stop scheduling new tasks. In-flight tasks may still report.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: Uuid) -> Result<Execution, EngineError> {
        self.change_status(id, ExecutionStatus::Running, ExecutionStatus::Paused, "pause")
            .await
    }

    #[instrument(skip(self))]
    pub async fn resume(&self, id: Uuid) -> Result<Execution, EngineError> {
        self.change_status(id, ExecutionStatus::Paused, ExecutionStatus::Running, "resume")
            .await
    }

    async fn change_status(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
        action: &'static str,
    ) -> Result<Execution, EngineError> {
        let evaluation = self
            .evaluate(id, move |_, execution, _| {
                if execution.status != from {
                    return Err(EngineError::InvalidState {
                        execution_id: execution.id,
                        status: execution.status,
                        action,
                    });
                }
                Ok(vec![Transition::SetStatus {
                    status: to,
                    reason: None,
                    output: None,
                }])
            })
            .await?;
        info!(execution_id = %id, status = %to, "execution status changed");
        self.run_follow_ups(evaluation.follow_ups).await;
        Ok(evaluation.execution)
    }

    async fn terminate_one(&self, id: Uuid, reason: &str) -> Result<Evaluation, EngineError> {
        let reason = reason.to_owned();
        self.evaluate(id, move |_, execution, _| {
            if execution.status.is_terminal() {
                return Err(EngineError::InvalidState {
                    execution_id: execution.id,
                    status: execution.status,
                    action: "terminate",
                });
            }
            Ok(terminal_transitions(
                execution,
                ExecutionStatus::Terminated,
                Some(reason.clone()),
                None,
            ))
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Worker operations
    // -----------------------------------------------------------------------

    /// Lease the next task of `task_type` (optionally in `domain`).
    ///
    /// Queue entries whose task can no longer run (finished, canceled,
    /// paused execution) are dropped and the next entry is tried.
    #[instrument(skip(self))]
    pub async fn poll_task(
        &self,
        task_type: &str,
        domain: Option<&str>,
        worker_id: &str,
    ) -> Result<Option<PolledTask>, EngineError> {
        let queue_name = match domain.filter(|d| !d.is_empty()) {
            Some(domain) => format!("{task_type}:{domain}"),
            None => task_type.to_owned(),
        };

        for _ in 0..MAX_DISCARDS_PER_POLL {
            let Some(lease) = self.queue.poll(&queue_name, self.config.lease_duration()).await? else {
                return Ok(None);
            };
            let Some(execution_id) = self.store.execution_for_task(lease.task_id).await? else {
                self.discard(&lease).await;
                continue;
            };

            let granted = lease.clone();
            let worker = worker_id.to_owned();
            let evaluation = self
                .evaluate(execution_id, move |_, execution, now| start_lease(execution, &granted, &worker, now))
                .await;
            match evaluation {
                Ok(evaluation) => {
                    let task = evaluation
                        .execution
                        .task(lease.task_id)
                        .filter(|t| t.status == TaskStatus::InProgress && t.lease_id == Some(lease.lease_id))
                        .cloned();
                    self.run_follow_ups(evaluation.follow_ups).await;
                    match task {
                        Some(task) => {
                            debug!(task_id = %task.id, %execution_id, "task leased");
                            return Ok(Some(PolledTask { execution_id, task, lease }));
                        }
                        None => self.discard(&lease).await,
                    }
                }
                Err(
                    EngineError::TaskNotPollable { .. }
                    | EngineError::TaskNotFound(_)
                    | EngineError::ExecutionNotFound(_),
                ) => self.discard(&lease).await,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Acknowledge delivery. The lease receipt must be current. The task
    /// leaves the queue and is never redelivered; the worker keeps the lease
    /// alive with [`extend_lease`](Self::extend_lease) until it reports.
    #[instrument(skip(self))]
    pub async fn ack_task(&self, task_id: Uuid, lease_id: Uuid) -> Result<(), EngineError> {
        self.queue.ack(task_id, lease_id).await?;
        Ok(())
    }

    /// Heartbeat: push the lease expiry out by the configured lease duration.
    /// Works before and after [`ack_task`](Self::ack_task).
    #[instrument(skip(self))]
    pub async fn extend_lease(&self, task_id: Uuid, lease_id: Uuid) -> Result<DateTime<Utc>, EngineError> {
        let renewal = self.renew_lease(task_id, lease_id).await?;
        let execution_id = self.execution_id_for(task_id).await?;
        let evaluation = self
            .evaluate(execution_id, move |_, execution, now| {
                let task = execution.task(task_id).ok_or(EngineError::TaskNotFound(task_id))?;
                if task.status != TaskStatus::InProgress || task.lease_id != Some(lease_id) {
                    return Err(EngineError::StaleLease(task_id));
                }
                Ok(vec![renewal.transition(task, lease_id, now)?])
            })
            .await?;
        self.run_follow_ups(evaluation.follow_ups).await;
        Ok(renewal.expires_at)
    }

    /// Record a worker's result and let the decider react.
    ///
    /// Results for tasks that already finished (late reports, canceled tasks,
    /// terminated executions) are [`UpdateOutcome::Ignored`].
    ///
    /// # Errors
    /// [`EngineError::StaleLease`] if the reporter no longer holds the lease,
    /// [`EngineError::PayloadTooLarge`] above the hard output limit.
    #[instrument(skip(self, result), fields(task_id = %result.task_id, status = ?result.status))]
    pub async fn update_task(&self, result: TaskResult) -> Result<UpdateOutcome, EngineError> {
        let task_id = result.task_id;
        if let Some(output) = &result.output {
            self.payload.check(PayloadKind::TaskOutput, output)?;
        }
        let execution_id = self.execution_id_for(task_id).await?;

        let mut renewal = None;
        if let (TaskResultStatus::InProgress, Some(lease_id)) = (result.status, result.lease_id) {
            renewal = Some(self.renew_lease(task_id, lease_id).await?);
        }

        let evaluation = self
            .evaluate(execution_id, |_, execution, now| {
                result_transitions(execution, &result, renewal, now)
            })
            .await;
        match evaluation {
            Ok(evaluation) => {
                if result.status.is_terminal() {
                    self.release(task_id).await;
                }
                self.run_follow_ups(evaluation.follow_ups).await;
                Ok(UpdateOutcome::Applied)
            }
            Err(EngineError::TaskAlreadyTerminal(_)) => {
                debug!("result for a finished task ignored");
                self.release(task_id).await;
                Ok(UpdateOutcome::Ignored)
            }
            Err(err) => Err(err),
        }
    }

    // -----------------------------------------------------------------------
    // Sweeping
    // -----------------------------------------------------------------------

    pub async fn running_executions(&self) -> Result<Vec<Uuid>, EngineError> {
        Ok(self.store.running_executions().await?)
    }

    /// Time out expired tasks, pick up finished children, and re-decide.
    #[instrument(skip(self))]
    pub async fn sweep(&self, id: Uuid) -> Result<SweepOutcome, EngineError> {
        let execution = self.get_execution(id).await?;
        if execution.status != ExecutionStatus::Running {
            return Ok(SweepOutcome::Skipped);
        }

        let mut finished_children = Vec::new();
        for task in execution.open_tasks().filter(|t| t.task_type == TaskType::SubWorkflow) {
            let Some(child_id) = task.sub_workflow_id else {
                continue;
            };
            match self.store.read_execution(child_id).await {
                Ok((child, _)) if child.status.is_terminal() => finished_children.push(child),
                Ok(_) => {}
                Err(StoreError::ExecutionNotFound(_)) => {
                    warn!(%child_id, task = %task.reference_name, "linked sub-workflow is missing");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let evaluation = self
            .evaluate(id, |definition, execution, now| {
                if definition.timeout_policy == TimeoutPolicy::AlertOnly {
                    if let Some(seconds) = definition.timeout_seconds {
                        let elapsed = (now - execution.created_at).num_seconds();
                        if elapsed >= i64::try_from(seconds).unwrap_or(i64::MAX) {
                            warn!(execution_id = %execution.id, elapsed, seconds, "execution exceeded its timeout");
                        }
                    }
                }
                let mut transitions = expired_tasks(definition, execution, now);
                transitions.extend(
                    finished_children
                        .iter()
                        .filter_map(|child| child_outcome(execution, child)),
                );
                Ok(transitions)
            })
            .await?;
        self.run_follow_ups(evaluation.follow_ups).await;
        Ok(SweepOutcome::Swept {
            changed: evaluation.changed,
        })
    }

    // -----------------------------------------------------------------------
    // Core cycle
    // -----------------------------------------------------------------------

    async fn read(&self, id: Uuid) -> Result<(Execution, u64), EngineError> {
        match self.store.read_execution(id).await {
            Ok(found) => Ok(found),
            Err(StoreError::ExecutionNotFound(_)) => Err(EngineError::ExecutionNotFound(id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Extend the queue lease. An acked task has left the queue, so its lease
    /// is then tracked on the execution alone and renewed from the engine
    /// clock.
    async fn renew_lease(&self, task_id: Uuid, lease_id: Uuid) -> Result<Renewal, EngineError> {
        let duration = self.config.lease_duration();
        match self.queue.extend_lease(task_id, lease_id, duration).await {
            Ok(expires_at) => Ok(Renewal {
                expires_at,
                queued: true,
            }),
            Err(QueueError::NotQueued(_)) => Ok(Renewal {
                expires_at: after(self.clock.now(), duration),
                queued: false,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn execution_id_for(&self, task_id: Uuid) -> Result<Uuid, EngineError> {
        self.store
            .execution_for_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    /// Read, apply `event`, decide, compare-and-swap, then perform effects.
    async fn evaluate<F>(&self, id: Uuid, event: F) -> Result<Evaluation, EngineError>
    where
        F: Fn(&WorkflowDefinition, &Execution, DateTime<Utc>) -> Result<Vec<Transition>, EngineError> + Send + Sync,
    {
        let attempts = self.config.max_apply_attempts.max(1);
        for attempt in 1..=attempts {
            let (execution, version) = self.read(id).await?;
            let now = self.clock.now();
            let definition = self
                .store
                .load_definition(&execution.workflow_name, Some(execution.workflow_version))
                .await?;

            let mut set = TransitionSet::new(now);
            let mut view = execution.clone();
            match &definition {
                Some(definition) => {
                    set.transitions = event(definition, &execution, now)?;
                    view.apply(&set);
                    let decided = self.decider.decide(definition, &view, now);
                    view.apply(&decided);
                    set.transitions.extend(decided.transitions);
                    set.effects.extend(decided.effects);
                }
                None if !execution.status.is_terminal() => {
                    warn!(execution_id = %id, workflow = %execution.workflow_name, "definition missing");
                    set.transitions = terminal_transitions(
                        &execution,
                        ExecutionStatus::Failed,
                        Some(format!(
                            "workflow definition '{}' version {} not found",
                            execution.workflow_name, execution.workflow_version
                        )),
                        None,
                    );
                    view.apply(&set);
                }
                None => {}
            }

            let became_terminal = !execution.status.is_terminal() && view.status.is_terminal();
            if became_terminal {
                set.effects.extend(terminal_effects(&view));
            }

            let changed = view != execution;
            if changed {
                if let ApplyOutcome::Conflict = self.store.apply_transitions(id, version, &set).await? {
                    debug!(execution_id = %id, attempt, "lost compare-and-swap, re-deciding");
                    continue;
                }
            }

            let follow_ups = self.perform(&set.effects).await;
            if became_terminal {
                info!(
                    execution_id = %id,
                    status = %view.status,
                    reason = view.reason.as_deref().unwrap_or_default(),
                    "execution finished"
                );
                for listener in &self.listeners {
                    listener.on_terminal(&view).await;
                }
            }
            return Ok(Evaluation {
                execution: view,
                changed,
                follow_ups,
            });
        }

        warn!(execution_id = %id, attempts, "giving up after repeated write conflicts");
        Err(EngineError::Conflict {
            execution_id: id,
            attempts,
        })
    }

    /// Perform committed effects. Queue failures are logged; the next decide
    /// re-emits the enqueue.
    async fn perform(&self, effects: &[Effect]) -> Vec<FollowUp> {
        let mut follow_ups = Vec::new();
        for effect in effects {
            match effect {
                Effect::Enqueue {
                    queue_name,
                    task_id,
                    priority,
                } => {
                    if let Err(err) = self.queue.enqueue(queue_name, *task_id, *priority).await {
                        warn!(%task_id, %queue_name, error = %err, "enqueue failed");
                    }
                }
                Effect::SpawnSubWorkflow(request) => follow_ups.push(FollowUp::Spawn(request.clone())),
                Effect::TerminateSubWorkflow { child_id, reason } => follow_ups.push(FollowUp::Terminate {
                    execution_id: *child_id,
                    reason: reason.clone(),
                }),
                Effect::NotifyParent { parent, child_id } => follow_ups.push(FollowUp::ChildTerminal {
                    parent: *parent,
                    child_id: *child_id,
                }),
            }
        }
        follow_ups
    }

    async fn run_follow_ups(&self, follow_ups: Vec<FollowUp>) {
        let mut pending: VecDeque<FollowUp> = follow_ups.into();
        while let Some(follow_up) = pending.pop_front() {
            let result = match follow_up {
                FollowUp::Decide(id) => self.evaluate(id, no_event).await.map(|e| e.follow_ups),
                FollowUp::Spawn(request) => self.spawn_child(&request).await,
                FollowUp::ChildTerminal { parent, child_id } => self.sync_parent(parent, child_id).await,
                FollowUp::Terminate { execution_id, reason } => match self.terminate_one(execution_id, &reason).await {
                    Ok(evaluation) => Ok(evaluation.follow_ups),
                    Err(EngineError::InvalidState { .. }) => Ok(Vec::new()),
                    Err(err) => Err(err),
                },
            };
            match result {
                Ok(more) => pending.extend(more),
                Err(err) => warn!(error = %err, "follow-up failed; the next sweep retries it"),
            }
        }
    }

    async fn spawn_child(&self, request: &SpawnRequest) -> Result<Vec<FollowUp>, EngineError> {
        let parent_id = request.parent.execution_id;
        match self.linker.spawn(request, self.clock.now()).await {
            Ok(spawned) => {
                let link = Transition::LinkSubWorkflow {
                    task_id: request.parent.task_id,
                    child_id: spawned.child_id,
                    version: spawned.version,
                };
                let parent = self.evaluate(parent_id, move |_, _, _| Ok(vec![link.clone()])).await?;
                let mut follow_ups = parent.follow_ups;
                let still_waiting = parent
                    .execution
                    .task(request.parent.task_id)
                    .is_some_and(|t| t.sub_workflow_id == Some(spawned.child_id) && !t.status.is_terminal());
                if still_waiting {
                    follow_ups.push(FollowUp::Decide(spawned.child_id));
                } else {
                    follow_ups.push(FollowUp::Terminate {
                        execution_id: spawned.child_id,
                        reason: format!("parent {parent_id} no longer waits for it"),
                    });
                }
                Ok(follow_ups)
            }
            Err(err) if err.is_transient() => Err(err),
            Err(err) => {
                warn!(%parent_id, error = %err, "sub-workflow could not be spawned");
                let update = TaskUpdate::failed(request.parent.task_id, err.to_string(), false);
                let parent = self
                    .evaluate(parent_id, move |_, _, _| Ok(vec![Transition::UpdateTask(update.clone())]))
                    .await?;
                Ok(parent.follow_ups)
            }
        }
    }

    async fn sync_parent(
        &self,
        parent: ParentRef,
        child_id: Uuid,
    ) -> Result<Vec<FollowUp>, EngineError> {
        let child = self.get_execution(child_id).await?;
        let evaluation = self
            .evaluate(parent.execution_id, |_, execution, _| {
                Ok(child_outcome(execution, &child).into_iter().collect())
            })
            .await?;
        Ok(evaluation.follow_ups)
    }

    /// Drop a queue entry whose task can't run any more.
    async fn discard(&self, lease: &Lease) {
        debug!(task_id = %lease.task_id, queue = %lease.queue_name, "discarding stale queue entry");
        if let Err(err) = self.queue.remove(lease.task_id).await {
            warn!(task_id = %lease.task_id, error = %err, "failed to discard queue entry");
        }
    }

    async fn release(&self, task_id: Uuid) {
        if let Err(err) = self.queue.remove(task_id).await {
            debug!(%task_id, error = %err, "queue entry not released");
        }
    }
}

// ---------------------------------------------------------------------------
// Event transitions
// ---------------------------------------------------------------------------

fn start_lease(
    execution: &Execution,
    lease: &Lease,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Transition>, EngineError> {
    let task = execution
        .task(lease.task_id)
        .ok_or(EngineError::TaskNotFound(lease.task_id))?;
    let pollable = execution.status == ExecutionStatus::Running
        && match task.status {
            TaskStatus::Scheduled => task.is_due(now),
            TaskStatus::InProgress => task.lease_expired(now),
            _ => false,
        };
    if !pollable {
        return Err(EngineError::TaskNotPollable {
            task_id: task.id,
            status: task.status,
        });
    }
    Ok(vec![Transition::StartLease {
        task_id: task.id,
        lease_id: lease.lease_id,
        expires_at: lease.expires_at,
        worker_id: Some(worker_id.to_owned()),
    }])
}

/// A lease pushed out by a heartbeat.
#[derive(Debug, Clone, Copy)]
struct Renewal {
    expires_at: DateTime<Utc>,
    /// `false` once the task was acked and only the execution holds the lease.
    queued: bool,
}

impl Renewal {
    fn transition(&self, task: &TaskExecution, lease_id: Uuid, now: DateTime<Utc>) -> Result<Transition, EngineError> {
        // The queue already rejected expired receipts for entries it still holds.
        if !self.queued && task.lease_expired(now) {
            return Err(QueueError::LeaseExpired {
                task_id: task.id,
                lease_id,
            }
            .into());
        }
        Ok(Transition::ExtendLease {
            task_id: task.id,
            lease_id,
            expires_at: self.expires_at,
        })
    }
}

fn result_transitions(
    execution: &Execution,
    result: &TaskResult,
    renewal: Option<Renewal>,
    now: DateTime<Utc>,
) -> Result<Vec<Transition>, EngineError> {
    let task = execution
        .task(result.task_id)
        .ok_or(EngineError::TaskNotFound(result.task_id))?;
    if task.status.is_terminal() || execution.status.is_terminal() {
        return Err(EngineError::TaskAlreadyTerminal(task.id));
    }
    match (result.lease_id, task.lease_id) {
        (Some(presented), Some(current)) if presented != current => {
            return Err(EngineError::StaleLease(task.id))
        }
        (Some(_), None) | (None, Some(_)) => return Err(EngineError::StaleLease(task.id)),
        _ => {}
    }

    let reason = || result.reason.clone().unwrap_or_else(|| "task failed".to_owned());
    let update = match result.status {
        TaskResultStatus::Completed => {
            TaskUpdate::completed(task.id, result.output.clone().unwrap_or_else(|| json!({})))
        }
        TaskResultStatus::Failed => TaskUpdate {
            output: result.output.clone(),
            ..TaskUpdate::failed(task.id, reason(), true)
        },
        TaskResultStatus::FailedWithTerminalError => TaskUpdate {
            output: result.output.clone(),
            ..TaskUpdate::failed(task.id, reason(), false)
        },
        TaskResultStatus::InProgress => TaskUpdate {
            output: result.output.clone(),
            ..TaskUpdate::new(task.id, TaskStatus::InProgress)
        },
    };

    let mut transitions = vec![Transition::UpdateTask(update)];
    if let (Some(renewal), Some(lease_id)) = (renewal, result.lease_id) {
        transitions.push(renewal.transition(task, lease_id, now)?);
    }
    Ok(transitions)
}

/// Effects of `execution` having just become terminal.
fn terminal_effects(execution: &Execution) -> Vec<Effect> {
    let mut effects: Vec<Effect> = execution
        .tasks
        .iter()
        .filter(|task| task.task_type == TaskType::SubWorkflow && task.status == TaskStatus::Canceled)
        .filter_map(|task| task.sub_workflow_id)
        .map(|child_id| Effect::TerminateSubWorkflow {
            child_id,
            reason: format!("parent {} is {}", execution.id, execution.status),
        })
        .collect();
    if let Some(parent) = execution.parent {
        effects.push(Effect::NotifyParent {
            parent,
            child_id: execution.id,
        });
    }
    effects
}

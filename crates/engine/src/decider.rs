//! The decider: a pure function from `(definition, snapshot, now)` to the
//! transitions and effects that move the execution forward.
//!
//! It never performs I/O and never reads a clock. Each call runs passes over
//! a working copy of the snapshot until nothing changes:
//!
//! 1. workflow timeout
//! 2. failed attempts: retry, skip the rest of the branch, or fail
//! 3. WAIT timeouts
//! 4. tasks that became ready: schedule SIMPLE/SUB_WORKFLOW, evaluate
//!    DECISION/FORK/JOIN/TERMINATE inline, start WAIT
//! 5. completion once the top-level list is done
//!
//! Effects are derived from the final working copy rather than from the
//! passes, so re-deciding an unchanged snapshot re-emits the same enqueues.
//! That is how a lost enqueue gets repaired by the next sweep.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, instrument, trace, warn};

use queue::clock::after;

use crate::config::EngineConfig;
use crate::dag::{DefinitionIndex, ListId, ListOwner, NodeId};
use crate::execution::{Execution, ExecutionStatus, ParentRef, TaskExecution, TaskStatus};
use crate::input::{ResolveContext, Resolved};
use crate::linker::{child_execution_id, queue_name_for};
use crate::models::{
    FailurePolicy, JoinPolicy, TaskKind, TaskType, TerminationStatus, TimeoutPolicy, WaitTimeoutAction,
    WorkflowDefinition,
};
use crate::payload::{PayloadGuard, PayloadKind};
use crate::retry::{RetryDecision, RetryEvaluator, TaskFailure};
use crate::transition::{Effect, SpawnRequest, TaskUpdate, Transition, TransitionSet};

/// Cancel every open task, then move the execution to `status`.
pub fn terminal_transitions(
    execution: &Execution,
    status: ExecutionStatus,
    reason: Option<String>,
    output: Option<Value>,
) -> Vec<Transition> {
    let cancel_reason = format!("execution {status}");
    let mut transitions: Vec<Transition> = execution
        .open_tasks()
        .map(|task| {
            Transition::UpdateTask(TaskUpdate::new(task.id, TaskStatus::Canceled).with_reason(cancel_reason.clone()))
        })
        .collect();
    transitions.push(Transition::SetStatus { status, reason, output });
    transitions
}

#[derive(Debug, Clone, Default)]
pub struct Decider {
    retry: RetryEvaluator,
    payload: PayloadGuard,
}

impl Decider {
    pub fn new(retry: RetryEvaluator, payload: PayloadGuard) -> Self {
        Self { retry, payload }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            RetryEvaluator::new(config.max_retry_delay()),
            PayloadGuard::new(config.payload.clone()),
        )
    }

    /// Compute the next transitions for `execution`.
    ///
    /// Returns an empty set for executions that are not RUNNING. A definition
    /// that fails validation fails the execution with the validation error as
    /// its reason.
    #[instrument(level = "debug", skip_all, fields(execution_id = %execution.id))]
    pub fn decide(
        &self,
        definition: &WorkflowDefinition,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> TransitionSet {
        let mut set = TransitionSet::new(now);
        if execution.status != ExecutionStatus::Running {
            return set;
        }

        let index = match DefinitionIndex::build(definition) {
            Ok(index) => index,
            Err(err) => {
                warn!(error = %err, "workflow definition failed validation");
                set.transitions = terminal_transitions(
                    execution,
                    ExecutionStatus::Failed,
                    Some(format!("invalid workflow definition: {err}")),
                    None,
                );
                return set;
            }
        };

        let mut view = execution.clone();
        let max_passes = 2 * index.len() + 4;
        for _ in 0..max_passes {
            let transitions = Pass::new(self, definition, &index, &view, now).next();
            if transitions.is_empty() || !view.apply_all(&transitions, now) {
                break;
            }
            set.transitions.extend(transitions);
            if view.status != ExecutionStatus::Running {
                break;
            }
        }

        if view.status == ExecutionStatus::Running {
            set.effects = dispatch(&index, &view, now);
        }
        debug!(
            transitions = set.transitions.len(),
            effects = set.effects.len(),
            status = %view.status,
            "decided"
        );
        set
    }
}

/// Side effects implied by the current state of `view`.
fn dispatch(index: &DefinitionIndex<'_>, view: &Execution, now: DateTime<Utc>) -> Vec<Effect> {
    let mut effects = Vec::new();
    for task in view.open_tasks() {
        if task.status != TaskStatus::Scheduled || !task.is_due(now) {
            continue;
        }
        match task.task_type {
            TaskType::Simple => {
                if let Some(queue_name) = &task.queue_name {
                    effects.push(Effect::Enqueue {
                        queue_name: queue_name.clone(),
                        task_id: task.id,
                        priority: view.priority,
                    });
                }
            }
            TaskType::SubWorkflow if task.sub_workflow_id.is_none() => {
                let params = index
                    .lookup(&task.reference_name)
                    .and_then(|id| match &index.node(id).def.kind {
                        TaskKind::SubWorkflow { sub_workflow_param } => Some(sub_workflow_param.clone()),
                        _ => None,
                    });
                if let Some(params) = params {
                    effects.push(Effect::SpawnSubWorkflow(SpawnRequest {
                        parent: ParentRef::new(view.id, task.id),
                        child_id: child_execution_id(task.id),
                        params,
                        input: task.input.clone(),
                        inherited_domains: view.task_to_domain.clone(),
                        correlation_id: view.correlation_id.clone(),
                        priority: view.priority,
                    }));
                }
            }
            _ => {}
        }
    }
    effects
}

enum Activation {
    NotReady,
    Schedule(Vec<Transition>),
    /// Ends the execution; nothing else in the pass matters.
    Finish(Vec<Transition>),
}

/// One pass over a fixed view of the execution.
struct Pass<'a> {
    decider: &'a Decider,
    definition: &'a WorkflowDefinition,
    index: &'a DefinitionIndex<'a>,
    view: &'a Execution,
    latest: HashMap<&'a str, &'a TaskExecution>,
    now: DateTime<Utc>,
}

impl<'a> Pass<'a> {
    fn new(
        decider: &'a Decider,
        definition: &'a WorkflowDefinition,
        index: &'a DefinitionIndex<'a>,
        view: &'a Execution,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            decider,
            definition,
            index,
            view,
            latest: view.latest_attempts(),
            now,
        }
    }

    fn next(&self) -> Vec<Transition> {
        if let Some(transitions) = self.workflow_timeout() {
            return transitions;
        }

        for id in 0..self.index.len() {
            let transitions = self.handle_failure(id);
            if !transitions.is_empty() {
                return transitions;
            }
        }

        let waits = self.wait_timeouts();
        if !waits.is_empty() {
            return waits;
        }

        let mut scheduled = Vec::new();
        for id in 0..self.index.len() {
            if self.latest_of(id).is_some() {
                continue;
            }
            match self.activate(id) {
                Activation::NotReady => {}
                Activation::Schedule(mut transitions) => scheduled.append(&mut transitions),
                // Records created earlier in this pass must exist before the
                // execution ends so that they get canceled with it.
                Activation::Finish(transitions) if scheduled.is_empty() => return transitions,
                Activation::Finish(_) => {}
            }
        }
        if !scheduled.is_empty() {
            return scheduled;
        }

        self.completion().unwrap_or_default()
    }

    fn latest_of(&self, id: NodeId) -> Option<&'a TaskExecution> {
        self.latest.get(self.index.reference(id)).copied()
    }

    /// A fresh record for attempt `attempt` of node `id`.
    fn record(&self, id: NodeId, attempt: u32) -> TaskExecution {
        let def = self.index.node(id).def;
        let mut task = TaskExecution::new(
            self.view.id,
            &def.task_reference_name,
            &def.name,
            def.task_type(),
            attempt,
            self.now,
        );
        if def.task_type() == TaskType::Simple {
            let (queue_name, domain) = queue_name_for(&def.name, &self.view.task_to_domain);
            task.queue_name = Some(queue_name);
            task.domain = domain;
        }
        task
    }

    // -----------------------------------------------------------------------
    // Timeouts and failures
    // -----------------------------------------------------------------------

    fn workflow_timeout(&self) -> Option<Vec<Transition>> {
        let seconds = self.definition.timeout_seconds?;
        if self.definition.timeout_policy != TimeoutPolicy::TimeOutWorkflow {
            return None;
        }
        let deadline = after(self.view.created_at, std::time::Duration::from_secs(seconds));
        (self.now >= deadline).then(|| {
            terminal_transitions(
                self.view,
                ExecutionStatus::Failed,
                Some(format!("workflow timed out after {seconds}s")),
                None,
            )
        })
    }

    /// Retry, skip or fail for the latest attempt of `id` if it failed and
    /// hasn't been dealt with.
    fn handle_failure(&self, id: NodeId) -> Vec<Transition> {
        let Some(task) = self.latest_of(id).filter(|t| t.status.is_failure() && !t.retried) else {
            return Vec::new();
        };
        let def = self.index.node(id).def;
        let reason = task.reason.clone().unwrap_or_else(|| task.status.to_string());

        if matches!(def.task_type(), TaskType::Simple | TaskType::SubWorkflow) {
            let policy = self.definition.retry_policy_for(def);
            let failure = TaskFailure::new(reason.clone(), task.retryable);
            if let RetryDecision::Retry {
                retry_after,
                new_attempt_count,
            } = self.decider.retry.next_attempt(&policy, task.attempt, &failure)
            {
                let mut next = self.record(id, new_attempt_count);
                next.input = task.input.clone();
                if !retry_after.is_zero() {
                    next.not_before = Some(after(self.now, retry_after));
                }
                debug!(
                    task = %def.task_reference_name,
                    attempt = new_attempt_count,
                    delay_secs = retry_after.as_secs(),
                    "scheduling retry"
                );
                return vec![Transition::MarkRetried { task_id: task.id }, Transition::Schedule(next)];
            }
        }

        let message = format!("task '{}' failed: {reason}", def.task_reference_name);
        match (self.definition.failure_policy, self.index.enclosing_branch(id)) {
            (FailurePolicy::SkipBranch, Some(_)) => self.skip(
                &self.index.rest_of_branch(id),
                &format!("skipped after '{}' failed", def.task_reference_name),
            ),
            _ => terminal_transitions(self.view, ExecutionStatus::Failed, Some(message), None),
        }
    }

    fn wait_timeouts(&self) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for id in 0..self.index.len() {
            let def = self.index.node(id).def;
            let TaskKind::Wait {
                on_timeout,
                default_output,
            } = &def.kind
            else {
                continue;
            };
            let (Some(seconds), Some(task)) = (def.timeout_seconds, self.latest_of(id)) else {
                continue;
            };
            let Some(started) = task.started_at.filter(|_| task.status == TaskStatus::InProgress) else {
                continue;
            };
            if self.now < after(started, std::time::Duration::from_secs(seconds)) {
                continue;
            }
            let update = match on_timeout {
                WaitTimeoutAction::Complete => TaskUpdate::completed(task.id, Value::Object(default_output.clone())),
                WaitTimeoutAction::Fail => TaskUpdate {
                    retryable: Some(false),
                    ..TaskUpdate::new(task.id, TaskStatus::TimedOut).with_reason(format!("wait timed out after {seconds}s"))
                },
            };
            transitions.push(Transition::UpdateTask(update));
        }
        transitions
    }

    /// SKIPPED records for every node in `ids` that has none yet.
    fn skip(&self, ids: &[NodeId], reason: &str) -> Vec<Transition> {
        ids.iter()
            .filter(|&&id| self.latest_of(id).is_none())
            .map(|&id| {
                let mut task = self.record(id, 1).with_status(TaskStatus::Skipped, self.now);
                task.reason = Some(reason.to_owned());
                Transition::Schedule(task)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    /// The case list a completed decision selected.
    fn selected_list(&self, decision: NodeId, task: &TaskExecution) -> ListId {
        let case = task.output.pointer("/caseOutput/0").and_then(Value::as_str).unwrap_or_default();
        self.index.case_list(decision, case)
    }

    /// Whether node `id` is finished. Failed tasks count only when
    /// `allow_failures` is set; a decision is finished once its selected case
    /// is.
    fn finished(&self, id: NodeId, allow_failures: bool) -> bool {
        let Some(task) = self.latest_of(id) else {
            return false;
        };
        match task.status {
            TaskStatus::Skipped => true,
            TaskStatus::Completed => match self.index.node(id).def.kind {
                TaskKind::Decision { .. } => self.list_finished(self.selected_list(id, task), allow_failures),
                _ => true,
            },
            status => status.is_terminal() && allow_failures,
        }
    }

    fn list_finished(&self, list: ListId, allow_failures: bool) -> bool {
        self.index
            .list(list)
            .nodes
            .last()
            .map_or(true, |&last| self.finished(last, allow_failures))
    }

    fn predecessor_done(&self, id: NodeId) -> bool {
        if let Some(prev) = self.index.predecessor(id) {
            return self.finished(prev, false);
        }
        let list = self.index.node(id).list;
        match self.index.list(list).owner {
            ListOwner::Root => true,
            ListOwner::DecisionCase { decision, .. } => self
                .latest_of(decision)
                .is_some_and(|t| t.status == TaskStatus::Completed && self.selected_list(decision, t) == list),
            ListOwner::ForkBranch { fork, .. } => {
                self.latest_of(fork).is_some_and(|t| t.status == TaskStatus::Completed)
            }
        }
    }

    fn activate(&self, id: NodeId) -> Activation {
        if !self.predecessor_done(id) {
            return Activation::NotReady;
        }
        let def = self.index.node(id).def;
        if let TaskKind::Join { join_on } = &def.kind {
            return self.activate_join(id, join_on);
        }

        let input = match ResolveContext::new(self.view, &self.latest).resolve(&def.input_parameters) {
            Resolved::Ready(input) => input,
            Resolved::Deferred { waiting_on } => {
                trace!(task = %def.task_reference_name, %waiting_on, "input not yet available");
                return Activation::NotReady;
            }
        };

        let mut task = self.record(id, 1);
        if let Err(err) = self.decider.payload.check(PayloadKind::TaskInput, &input) {
            let mut failed = task.with_status(TaskStatus::Failed, self.now);
            failed.retryable = false;
            failed.reason = Some(err.to_string());
            return Activation::Schedule(vec![Transition::Schedule(failed)]);
        }
        task.input = input;

        match &def.kind {
            TaskKind::Simple | TaskKind::SubWorkflow { .. } => {
                Activation::Schedule(vec![Transition::Schedule(task)])
            }
            TaskKind::Wait { .. } => {
                Activation::Schedule(vec![Transition::Schedule(task.with_status(TaskStatus::InProgress, self.now))])
            }
            TaskKind::Fork { .. } => {
                Activation::Schedule(vec![Transition::Schedule(task.with_status(TaskStatus::Completed, self.now))])
            }
            TaskKind::Decision { case_value_param, .. } => {
                let case = case_value(task.input.get(case_value_param.as_str()));
                let selected = self.index.case_list(id, &case);
                task.output = json!({ "caseOutput": [case] });

                let mut transitions = vec![Transition::Schedule(task.with_status(TaskStatus::Completed, self.now))];
                for &list in &self.index.node(id).children {
                    if list != selected {
                        transitions.extend(self.skip(&self.index.descendants(list), "decision case not selected"));
                    }
                }
                Activation::Schedule(transitions)
            }
            TaskKind::Terminate { termination_status } => {
                let status = match termination_status {
                    TerminationStatus::Completed => ExecutionStatus::Completed,
                    TerminationStatus::Failed => ExecutionStatus::Failed,
                };
                let output = task
                    .input
                    .get("workflowOutput")
                    .cloned()
                    .unwrap_or_else(|| task.input.clone());
                let reason = task
                    .input
                    .get("terminationReason")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("terminated by task '{}'", def.task_reference_name));
                task.output = output.clone();

                let mut transitions = vec![Transition::Schedule(task.with_status(TaskStatus::Completed, self.now))];
                transitions.extend(terminal_transitions(self.view, status, Some(reason), Some(output)));
                Activation::Finish(transitions)
            }
            TaskKind::Join { .. } => Activation::NotReady,
        }
    }

    /// Complete or fail a JOIN once every task it waits on has settled.
    fn activate_join(&self, id: NodeId, join_on: &[String]) -> Activation {
        let mut outputs = Map::new();
        let mut degraded = false;
        let mut failed = Vec::new();

        for reference in join_on {
            let Some(target) = self.index.lookup(reference) else {
                return Activation::NotReady;
            };
            if !self.finished(target, true) {
                return Activation::NotReady;
            }
            let Some(task) = self.latest_of(target) else {
                return Activation::NotReady;
            };
            match task.status {
                TaskStatus::Completed => {
                    outputs.insert(reference.clone(), task.output.clone());
                }
                TaskStatus::Skipped => {
                    degraded = true;
                    outputs.insert(reference.clone(), Value::Null);
                }
                _ => {
                    failed.push(reference.as_str());
                    outputs.insert(reference.clone(), Value::Null);
                }
            }
        }

        // Failures isolated inside the forked branches.
        if let Some(fork) = self.index.predecessor(id) {
            for &branch in &self.index.node(fork).children {
                for node in self.index.descendants(branch) {
                    if self.latest_of(node).is_some_and(|t| t.status.is_failure()) {
                        degraded = true;
                    }
                }
            }
        }

        let mut task = self.record(id, 1);
        task.input = json!({ "join_on": join_on });
        let failure = if !failed.is_empty() && self.definition.failure_policy == FailurePolicy::FailWorkflow {
            Some(format!("joined tasks did not complete: {}", failed.join(", ")))
        } else if (degraded || !failed.is_empty()) && self.definition.join_policy == JoinPolicy::RequireCompleted {
            Some("join requires every branch to complete".to_owned())
        } else {
            None
        };

        let task = match failure {
            Some(reason) => {
                let mut task = task.with_status(TaskStatus::Failed, self.now);
                task.retryable = false;
                task.reason = Some(reason);
                task
            }
            None => {
                task.output = Value::Object(outputs);
                task.with_status(TaskStatus::Completed, self.now)
            }
        };
        Activation::Schedule(vec![Transition::Schedule(task)])
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    fn list_output(&self, list: ListId) -> Value {
        let Some(&last) = self.index.list(list).nodes.last() else {
            return Value::Null;
        };
        let Some(task) = self.latest_of(last) else {
            return Value::Null;
        };
        if let TaskKind::Decision { .. } = self.index.node(last).def.kind {
            let selected = self.selected_list(last, task);
            if !self.index.list(selected).nodes.is_empty() {
                return self.list_output(selected);
            }
        }
        task.output.clone()
    }

    fn completion(&self) -> Option<Vec<Transition>> {
        if !self.list_finished(DefinitionIndex::ROOT, false) || self.view.open_tasks().next().is_some() {
            return None;
        }

        let output = if self.definition.output_parameters.is_empty() {
            self.list_output(DefinitionIndex::ROOT)
        } else {
            ResolveContext::new(self.view, &self.latest).resolve_lenient(&self.definition.output_parameters)
        };

        if let Err(err) = self.decider.payload.check(PayloadKind::WorkflowOutput, &output) {
            return Some(terminal_transitions(
                self.view,
                ExecutionStatus::Failed,
                Some(err.to_string()),
                None,
            ));
        }
        Some(terminal_transitions(self.view, ExecutionStatus::Completed, None, Some(output)))
    }
}

/// String form of a decision's case value. `null` selects the default case.
fn case_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::execution::task_id_for;
    use crate::models::{SubWorkflowParams, TaskDefinition, WorkflowVersion};
    use crate::retry::{BackoffKind, RetryPolicy};

    fn start(definition: &WorkflowDefinition, input: Value) -> Execution {
        Execution::new(Uuid::new_v4(), definition, input, Utc::now())
    }

    /// Decide and apply, returning the set.
    fn step(decider: &Decider, definition: &WorkflowDefinition, execution: &mut Execution, now: DateTime<Utc>) -> TransitionSet {
        let set = decider.decide(definition, execution, now);
        execution.apply(&set);
        set
    }

    fn task<'e>(execution: &'e Execution, reference: &str) -> &'e TaskExecution {
        execution.latest_attempts()[reference]
    }

    fn finish(execution: &mut Execution, reference: &str, status: TaskStatus, output: Value, now: DateTime<Utc>) {
        let id = task(execution, reference).id;
        let update = TaskUpdate {
            output: Some(output),
            ..TaskUpdate::new(id, status)
        };
        execution.apply_all(&[Transition::UpdateTask(update)], now);
    }

    fn enqueued(set: &TransitionSet) -> Vec<Uuid> {
        set.effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Enqueue { task_id, .. } => Some(*task_id),
                _ => None,
            })
            .collect()
    }

    fn fork_join(retry: Option<RetryPolicy>) -> WorkflowDefinition {
        let mut definition = WorkflowDefinition::new(
            "fanout",
            1,
            vec![
                TaskDefinition::new(
                    "f",
                    "f",
                    TaskKind::Fork {
                        fork_tasks: vec![vec![TaskDefinition::simple("b1")], vec![TaskDefinition::simple("b2")]],
                    },
                ),
                TaskDefinition::new(
                    "j",
                    "j",
                    TaskKind::Join {
                        join_on: vec!["b1".into(), "b2".into()],
                    },
                ),
                TaskDefinition::simple("after"),
            ],
        );
        definition.retry = retry;
        definition
    }

    #[test]
    fn linear_workflow_runs_to_completion() {
        let decider = Decider::default();
        let definition = WorkflowDefinition::new(
            "linear",
            1,
            vec![
                TaskDefinition::simple("a").with_input("who", json!("${workflow.input.who}")),
                TaskDefinition::simple("b").with_input("prev", json!("${a.output.value}")),
            ],
        );
        let mut execution = start(&definition, json!({ "who": "ada" }));
        let now = execution.created_at;

        let set = step(&decider, &definition, &mut execution, now);
        assert_eq!(execution.tasks.len(), 1);
        assert_eq!(task(&execution, "a").input, json!({ "who": "ada" }));
        assert_eq!(task(&execution, "a").queue_name.as_deref(), Some("a"));
        assert_eq!(enqueued(&set), vec![task(&execution, "a").id]);

        // Re-deciding an unchanged snapshot changes nothing but re-emits the enqueue.
        let again = decider.decide(&definition, &execution, now);
        assert!(again.transitions.is_empty());
        assert_eq!(enqueued(&again), enqueued(&set));

        finish(&mut execution, "a", TaskStatus::Completed, json!({ "value": 7 }), now);
        step(&decider, &definition, &mut execution, now);
        assert_eq!(task(&execution, "b").input, json!({ "prev": 7 }));

        finish(&mut execution, "b", TaskStatus::Completed, json!({ "done": true }), now);
        step(&decider, &definition, &mut execution, now);
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output, json!({ "done": true }));
    }

    #[test]
    fn decisions_are_deterministic() {
        let decider = Decider::default();
        let definition = fork_join(None);
        let execution = start(&definition, json!({}));
        let now = execution.created_at;
        assert_eq!(
            decider.decide(&definition, &execution, now),
            decider.decide(&definition, &execution, now)
        );
    }

    #[test]
    fn join_waits_for_every_branch_in_any_order() {
        let decider = Decider::default();
        let definition = fork_join(None);

        for order in [["b1", "b2"], ["b2", "b1"]] {
            let mut execution = start(&definition, json!({}));
            let now = execution.created_at;
            step(&decider, &definition, &mut execution, now);
            assert_eq!(task(&execution, "f").status, TaskStatus::Completed);
            assert_eq!(task(&execution, "b1").status, TaskStatus::Scheduled);
            assert_eq!(task(&execution, "b2").status, TaskStatus::Scheduled);

            finish(&mut execution, order[0], TaskStatus::Completed, json!({ "from": order[0] }), now);
            step(&decider, &definition, &mut execution, now);
            assert!(!execution.latest_attempts().contains_key("j"));

            finish(&mut execution, order[1], TaskStatus::Completed, json!({ "from": order[1] }), now);
            step(&decider, &definition, &mut execution, now);
            assert_eq!(task(&execution, "j").status, TaskStatus::Completed);
            assert_eq!(
                task(&execution, "j").output,
                json!({ "b1": { "from": "b1" }, "b2": { "from": "b2" } })
            );
            assert_eq!(task(&execution, "after").status, TaskStatus::Scheduled);
        }
    }

    #[test]
    fn decision_skips_unselected_branches() {
        let decider = Decider::default();
        let definition = WorkflowDefinition::new(
            "route",
            1,
            vec![
                TaskDefinition::new(
                    "d",
                    "d",
                    TaskKind::Decision {
                        case_value_param: "kind".into(),
                        decision_cases: BTreeMap::from([
                            ("x".to_string(), vec![TaskDefinition::simple("x1")]),
                            ("y".to_string(), vec![TaskDefinition::simple("y1"), TaskDefinition::simple("y2")]),
                        ]),
                        default_case: vec![TaskDefinition::simple("z1")],
                    },
                )
                .with_input("kind", json!("${workflow.input.kind}")),
                TaskDefinition::simple("end"),
            ],
        );
        let mut execution = start(&definition, json!({ "kind": "x" }));
        let now = execution.created_at;

        step(&decider, &definition, &mut execution, now);
        assert_eq!(task(&execution, "d").output, json!({ "caseOutput": ["x"] }));
        for skipped in ["y1", "y2", "z1"] {
            assert_eq!(task(&execution, skipped).status, TaskStatus::Skipped, "{skipped}");
        }
        assert_eq!(task(&execution, "x1").status, TaskStatus::Scheduled);
        assert!(!execution.latest_attempts().contains_key("end"));

        finish(&mut execution, "x1", TaskStatus::Completed, json!({}), now);
        step(&decider, &definition, &mut execution, now);
        assert_eq!(task(&execution, "end").status, TaskStatus::Scheduled);
    }

    #[test]
    fn unknown_case_takes_default() {
        let decider = Decider::default();
        let definition = WorkflowDefinition::new(
            "route",
            1,
            vec![TaskDefinition::new(
                "d",
                "d",
                TaskKind::Decision {
                    case_value_param: "kind".into(),
                    decision_cases: BTreeMap::from([("x".to_string(), vec![TaskDefinition::simple("x1")])]),
                    default_case: vec![TaskDefinition::simple("z1")],
                },
            )
            .with_input("kind", json!("${workflow.input.kind}"))],
        );
        let mut execution = start(&definition, json!({ "kind": 42 }));
        let now = execution.created_at;
        step(&decider, &definition, &mut execution, now);
        assert_eq!(task(&execution, "x1").status, TaskStatus::Skipped);
        assert_eq!(task(&execution, "z1").status, TaskStatus::Scheduled);

        finish(&mut execution, "z1", TaskStatus::Completed, json!({ "z": 1 }), now);
        step(&decider, &definition, &mut execution, now);
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output, json!({ "z": 1 }));
    }

    #[test]
    fn failed_task_is_retried_with_backoff_then_fails_workflow() {
        let decider = Decider::default();
        let definition = WorkflowDefinition::new(
            "retry",
            1,
            vec![TaskDefinition::simple("a").with_retry(RetryPolicy::new(3, BackoffKind::Exponential, 1))],
        );
        let mut execution = start(&definition, json!({}));
        let t0 = execution.created_at;
        step(&decider, &definition, &mut execution, t0);

        finish(&mut execution, "a", TaskStatus::Failed, json!({}), t0);
        let set = step(&decider, &definition, &mut execution, t0);
        let second = task(&execution, "a");
        assert_eq!(second.attempt, 2);
        assert_eq!(second.not_before, Some(t0 + Duration::seconds(1)));
        assert!(enqueued(&set).is_empty(), "not due yet");
        assert!(execution.tasks[0].retried);

        let t1 = t0 + Duration::seconds(1);
        let set = step(&decider, &definition, &mut execution, t1);
        assert_eq!(enqueued(&set), vec![task(&execution, "a").id]);

        finish(&mut execution, "a", TaskStatus::Failed, json!({}), t1);
        step(&decider, &definition, &mut execution, t1);
        let third = task(&execution, "a");
        assert_eq!(third.attempt, 3);
        assert_eq!(third.not_before, Some(t1 + Duration::seconds(2)));

        finish(&mut execution, "a", TaskStatus::Failed, json!({}), t1);
        step(&decider, &definition, &mut execution, t1);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.reason.as_deref().unwrap_or_default().contains("'a' failed"));
    }

    #[test]
    fn terminal_errors_skip_retries() {
        let decider = Decider::default();
        let definition = WorkflowDefinition::new("t", 1, vec![TaskDefinition::simple("a")]);
        let mut execution = start(&definition, json!({}));
        let now = execution.created_at;
        step(&decider, &definition, &mut execution, now);

        let id = task(&execution, "a").id;
        execution.apply_all(&[Transition::UpdateTask(TaskUpdate::failed(id, "bad input", false))], now);
        step(&decider, &definition, &mut execution, now);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.tasks.len(), 1);
    }

    #[test]
    fn skip_branch_lets_the_join_complete() {
        let decider = Decider::default();
        let mut definition = fork_join(Some(RetryPolicy::none()));
        definition.failure_policy = FailurePolicy::SkipBranch;
        if let TaskKind::Fork { fork_tasks } = &mut definition.tasks[0].kind {
            fork_tasks[0].push(TaskDefinition::simple("b1_tail"));
        }
        if let TaskKind::Join { join_on } = &mut definition.tasks[1].kind {
            join_on[0] = "b1_tail".into();
        }

        let mut execution = start(&definition, json!({}));
        let now = execution.created_at;
        step(&decider, &definition, &mut execution, now);
        finish(&mut execution, "b1", TaskStatus::Failed, json!({}), now);
        finish(&mut execution, "b2", TaskStatus::Completed, json!({ "ok": true }), now);
        step(&decider, &definition, &mut execution, now);

        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(task(&execution, "b1_tail").status, TaskStatus::Skipped);
        assert_eq!(task(&execution, "j").status, TaskStatus::Completed);
        assert_eq!(task(&execution, "j").output, json!({ "b1_tail": null, "b2": { "ok": true } }));

        // The same failure with a strict join fails the workflow.
        definition.join_policy = JoinPolicy::RequireCompleted;
        let mut strict = start(&definition, json!({}));
        step(&decider, &definition, &mut strict, now);
        finish(&mut strict, "b1", TaskStatus::Failed, json!({}), now);
        finish(&mut strict, "b2", TaskStatus::Completed, json!({}), now);
        step(&decider, &definition, &mut strict, now);
        assert_eq!(task(&strict, "j").status, TaskStatus::Failed);
        assert_eq!(strict.status, ExecutionStatus::Failed);
    }

    #[test]
    fn terminate_cancels_open_tasks() {
        let decider = Decider::default();
        let definition = WorkflowDefinition::new(
            "stop",
            1,
            vec![
                TaskDefinition::new(
                    "f",
                    "f",
                    TaskKind::Fork {
                        fork_tasks: vec![
                            vec![TaskDefinition::simple("slow")],
                            vec![TaskDefinition::new(
                                "end",
                                "end",
                                TaskKind::Terminate {
                                    termination_status: TerminationStatus::Failed,
                                },
                            )
                            .with_input("workflowOutput", json!({ "why": "${workflow.input.why}" }))
                            .with_input("terminationReason", json!("stopped early"))],
                        ],
                    },
                ),
                TaskDefinition::new(
                    "j",
                    "j",
                    TaskKind::Join {
                        join_on: vec!["slow".into(), "end".into()],
                    },
                ),
            ],
        );
        let mut execution = start(&definition, json!({ "why": "because" }));
        let now = execution.created_at;
        let set = step(&decider, &definition, &mut execution, now);

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.reason.as_deref(), Some("stopped early"));
        assert_eq!(execution.output, json!({ "why": "because" }));
        assert_eq!(task(&execution, "slow").status, TaskStatus::Canceled);
        assert!(set.effects.is_empty());
    }

    #[test]
    fn wait_task_times_out_with_default_output() {
        let decider = Decider::default();
        let definition = WorkflowDefinition::new(
            "wait",
            1,
            vec![TaskDefinition::new(
                "hold",
                "hold",
                TaskKind::Wait {
                    on_timeout: WaitTimeoutAction::Complete,
                    default_output: json!({ "approved": false }).as_object().cloned().unwrap_or_default(),
                },
            )
            .with_timeout(60)],
        );
        let mut execution = start(&definition, json!({}));
        let t0 = execution.created_at;
        let set = step(&decider, &definition, &mut execution, t0);
        assert_eq!(task(&execution, "hold").status, TaskStatus::InProgress);
        assert!(set.effects.is_empty(), "wait tasks are never queued");

        step(&decider, &definition, &mut execution, t0 + Duration::seconds(59));
        assert_eq!(execution.status, ExecutionStatus::Running);

        step(&decider, &definition, &mut execution, t0 + Duration::seconds(60));
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output, json!({ "approved": false }));
    }

    #[test]
    fn invalid_definition_fails_execution() {
        let decider = Decider::default();
        let definition = WorkflowDefinition::new(
            "bad",
            1,
            vec![TaskDefinition::simple("a"), TaskDefinition::simple("a")],
        );
        let mut execution = start(&definition, json!({}));
        let now = execution.created_at;
        step(&decider, &definition, &mut execution, now);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution
            .reason
            .as_deref()
            .unwrap_or_default()
            .contains("duplicate task reference name"));
    }

    #[test]
    fn workflow_timeout_fails_execution() {
        let decider = Decider::default();
        let mut definition = WorkflowDefinition::new("slow", 1, vec![TaskDefinition::simple("a")]);
        definition.timeout_seconds = Some(10);
        let mut execution = start(&definition, json!({}));
        let t0 = execution.created_at;
        step(&decider, &definition, &mut execution, t0);
        step(&decider, &definition, &mut execution, t0 + Duration::seconds(10));
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(task(&execution, "a").status, TaskStatus::Canceled);

        definition.timeout_policy = TimeoutPolicy::AlertOnly;
        let mut alert = start(&definition, json!({}));
        step(&decider, &definition, &mut alert, t0 + Duration::seconds(10));
        assert_eq!(alert.status, ExecutionStatus::Running);
    }

    #[test]
    fn paused_executions_decide_nothing() {
        let decider = Decider::default();
        let definition = WorkflowDefinition::new("p", 1, vec![TaskDefinition::simple("a")]);
        let mut execution = start(&definition, json!({}));
        execution.status = ExecutionStatus::Paused;
        assert!(decider.decide(&definition, &execution, execution.created_at).is_empty());
    }

    #[test]
    fn domain_routing_sets_queue_names() {
        let decider = Decider::default();
        let definition = WorkflowDefinition::new(
            "routed",
            1,
            vec![
                TaskDefinition::new(
                    "f",
                    "f",
                    TaskKind::Fork {
                        fork_tasks: vec![vec![TaskDefinition::simple("email")], vec![TaskDefinition::simple("resize")]],
                    },
                ),
                TaskDefinition::new(
                    "j",
                    "j",
                    TaskKind::Join {
                        join_on: vec!["email".into(), "resize".into()],
                    },
                ),
            ],
        );
        let mut execution = start(&definition, json!({}));
        execution.task_to_domain = BTreeMap::from([("email".to_string(), "mail".to_string())]);
        let now = execution.created_at;
        step(&decider, &definition, &mut execution, now);
        assert_eq!(task(&execution, "email").queue_name.as_deref(), Some("email:mail"));
        assert_eq!(task(&execution, "resize").queue_name.as_deref(), Some("resize"));
    }

    #[test]
    fn sub_workflow_task_requests_a_spawn() {
        let decider = Decider::default();
        let definition = WorkflowDefinition::new(
            "parent",
            1,
            vec![TaskDefinition::new(
                "child",
                "child",
                TaskKind::SubWorkflow {
                    sub_workflow_param: SubWorkflowParams {
                        name: "billing".into(),
                        version: WorkflowVersion::Unspecified,
                        task_to_domain: None,
                    },
                },
            )
            .with_input("amount", json!("${workflow.input.amount}"))],
        );
        let mut execution = start(&definition, json!({ "amount": 5 }));
        let now = execution.created_at;
        let set = step(&decider, &definition, &mut execution, now);
        let task_id = task_id_for(execution.id, "child", 1);
        match set.effects.as_slice() {
            [Effect::SpawnSubWorkflow(request)] => {
                assert_eq!(request.parent, ParentRef::new(execution.id, task_id));
                assert_eq!(request.child_id, child_execution_id(task_id));
                assert_eq!(request.input, json!({ "amount": 5 }));
            }
            other => panic!("unexpected effects {other:?}"),
        }
    }
}

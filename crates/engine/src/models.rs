//! Workflow definitions.
//!
//! A definition is a nested tree of task lists: the top-level `tasks` run in
//! order, DECISION tasks own one list per case, FORK tasks own one list per
//! branch. Definitions are immutable once registered and are stored as JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DefinitionError;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// What happens when the workflow-level timeout elapses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutPolicy {
    #[default]
    TimeOutWorkflow,
    AlertOnly,
}

/// What happens once a task has exhausted its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailurePolicy {
    /// The whole execution fails.
    #[default]
    FailWorkflow,
    /// Inside a fork branch: skip the rest of that branch and let the join
    /// decide. Outside any branch this behaves like `FailWorkflow`.
    SkipBranch,
}

/// How a JOIN treats branches that ended in SKIPPED.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinPolicy {
    #[default]
    AllowSkipped,
    RequireCompleted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationStatus {
    #[default]
    Completed,
    Failed,
}

/// What a WAIT task does when its timeout elapses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitTimeoutAction {
    #[default]
    Complete,
    Fail,
}

// ---------------------------------------------------------------------------
// Sub-workflow version
// ---------------------------------------------------------------------------

/// The version a SUB_WORKFLOW task asks for, exactly as written in the
/// definition: absent, a number, or a string such as `"2"` or `"latest"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WorkflowVersion {
    #[default]
    Unspecified,
    Numeric(u32),
    Named(String),
}

/// A [`WorkflowVersion`] after parsing; resolved once, at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRequest {
    Latest,
    Exact(u32),
}

impl VersionRequest {
    pub fn exact(self) -> Option<u32> {
        match self {
            Self::Latest => None,
            Self::Exact(version) => Some(version),
        }
    }
}

impl fmt::Display for VersionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Exact(version) => write!(f, "{version}"),
        }
    }
}

impl WorkflowVersion {
    /// Parse the requested version. Empty strings and `"latest"` mean the
    /// newest registered version.
    pub fn resolve(&self) -> Result<VersionRequest, DefinitionError> {
        match self {
            Self::Unspecified => Ok(VersionRequest::Latest),
            Self::Numeric(version) => Ok(VersionRequest::Exact(*version)),
            Self::Named(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("latest") {
                    return Ok(VersionRequest::Latest);
                }
                trimmed
                    .parse::<u32>()
                    .map(VersionRequest::Exact)
                    .map_err(|_| DefinitionError::InvalidVersion(raw.clone()))
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVersion {
    Number(u32),
    Text(String),
}

impl Serialize for WorkflowVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unspecified => serializer.serialize_none(),
            Self::Numeric(version) => serializer.serialize_u32(*version),
            Self::Named(raw) => serializer.serialize_str(raw),
        }
    }
}

impl<'de> Deserialize<'de> for WorkflowVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<RawVersion>::deserialize(deserializer)? {
            None => Self::Unspecified,
            Some(RawVersion::Number(version)) => Self::Numeric(version),
            Some(RawVersion::Text(raw)) => Self::Named(raw),
        })
    }
}

// ---------------------------------------------------------------------------
// Task definitions
// ---------------------------------------------------------------------------

/// Flat discriminant of [`TaskKind`], stored on every task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Simple,
    Decision,
    Fork,
    Join,
    SubWorkflow,
    Terminate,
    Wait,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Simple => "SIMPLE",
            Self::Decision => "DECISION",
            Self::Fork => "FORK",
            Self::Join => "JOIN",
            Self::SubWorkflow => "SUB_WORKFLOW",
            Self::Terminate => "TERMINATE",
            Self::Wait => "WAIT",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubWorkflowParams {
    pub name: String,
    #[serde(default)]
    pub version: WorkflowVersion,
    /// Domain routing for the child; inherited from the parent when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_to_domain: Option<BTreeMap<String, String>>,
}

/// Type-specific part of a task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    /// Dispatched to a worker through the task queue.
    Simple,
    /// Picks one case list by the resolved value of `case_value_param`.
    Decision {
        case_value_param: String,
        #[serde(default)]
        decision_cases: BTreeMap<String, Vec<TaskDefinition>>,
        #[serde(default)]
        default_case: Vec<TaskDefinition>,
    },
    /// Runs every branch in parallel; must be followed by a JOIN.
    Fork { fork_tasks: Vec<Vec<TaskDefinition>> },
    /// Waits until every task in `join_on` is terminal.
    Join { join_on: Vec<String> },
    SubWorkflow { sub_workflow_param: SubWorkflowParams },
    /// Ends the workflow with the given status. The resolved
    /// `workflowOutput` input becomes the workflow output.
    Terminate {
        #[serde(default)]
        termination_status: TerminationStatus,
    },
    /// Stays in progress until completed externally or timed out.
    Wait {
        #[serde(default)]
        on_timeout: WaitTimeoutAction,
        #[serde(default)]
        default_output: Map<String, Value>,
    },
}

impl TaskKind {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Simple => TaskType::Simple,
            Self::Decision { .. } => TaskType::Decision,
            Self::Fork { .. } => TaskType::Fork,
            Self::Join { .. } => TaskType::Join,
            Self::SubWorkflow { .. } => TaskType::SubWorkflow,
            Self::Terminate { .. } => TaskType::Terminate,
            Self::Wait { .. } => TaskType::Wait,
        }
    }
}

/// A single step in the workflow tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task name; for SIMPLE tasks this is also the queue name.
    pub name: String,
    /// Unique within the whole workflow, nested lists included.
    pub task_reference_name: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    /// Values may contain `${workflow.input.x}` or `${ref.output.y}`
    /// expressions.
    #[serde(default)]
    pub input_parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, reference: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            task_reference_name: reference.into(),
            kind,
            input_parameters: Map::new(),
            retry: None,
            timeout_seconds: None,
        }
    }

    /// SIMPLE task whose name and reference are the same.
    pub fn simple(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(name.clone(), name, TaskKind::Simple)
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input_parameters.insert(key.into(), value);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn task_type(&self) -> TaskType {
        self.kind.task_type()
    }

    /// Directly nested task lists: decision cases (default last) or fork
    /// branches.
    pub fn child_lists(&self) -> Vec<&[TaskDefinition]> {
        match &self.kind {
            TaskKind::Decision {
                decision_cases,
                default_case,
                ..
            } => decision_cases
                .values()
                .map(Vec::as_slice)
                .chain(std::iter::once(default_case.as_slice()))
                .collect(),
            TaskKind::Fork { fork_tasks } => fork_tasks.iter().map(Vec::as_slice).collect(),
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A complete, versioned workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tasks: Vec<TaskDefinition>,
    /// Input keys a start request must supply.
    #[serde(default)]
    pub input_parameters: Vec<String>,
    /// Workflow output mapping; when empty the output is the last task's.
    #[serde(default)]
    pub output_parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
    /// Default retry policy for tasks that don't carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub join_policy: JoinPolicy,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, version: u32, tasks: Vec<TaskDefinition>) -> Self {
        Self {
            name: name.into(),
            version,
            description: None,
            tasks,
            input_parameters: Vec::new(),
            output_parameters: Map::new(),
            timeout_seconds: None,
            timeout_policy: TimeoutPolicy::default(),
            retry: None,
            failure_policy: FailurePolicy::default(),
            join_policy: JoinPolicy::default(),
        }
    }

    /// Depth-first search for a task by reference name.
    pub fn find_task(&self, reference: &str) -> Option<&TaskDefinition> {
        fn search<'a>(tasks: &'a [TaskDefinition], reference: &str) -> Option<&'a TaskDefinition> {
            tasks.iter().find_map(|task| {
                if task.task_reference_name == reference {
                    return Some(task);
                }
                task.child_lists()
                    .into_iter()
                    .find_map(|list| search(list, reference))
            })
        }
        search(&self.tasks, reference)
    }

    /// Retry policy in force for `task`.
    pub fn retry_policy_for(&self, task: &TaskDefinition) -> RetryPolicy {
        task.retry
            .clone()
            .or_else(|| self.retry.clone())
            .unwrap_or_default()
    }
}

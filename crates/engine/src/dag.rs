//! Definition indexing and validation. Run this before persisting or
//! deciding a workflow.
//!
//! The nested definition is flattened into nodes (one per task, depth-first
//! pre-order) and task lists (the root list, each decision case, each fork
//! branch). Rules enforced:
//! 1. The workflow has at least one task.
//! 2. Reference names are unique across the whole tree.
//! 3. Every FORK is immediately followed by a JOIN, every JOIN immediately
//!    follows a FORK, and the JOIN waits on at least one task of every branch
//!    and only on tasks inside the fork.
//! 4. Every `${ref...}` expression names an existing task.
//! 5. Structural plus data-dependency edges form an acyclic graph.

use std::collections::{HashMap, VecDeque};

use crate::error::DefinitionError;
use crate::input::references;
use crate::models::{TaskDefinition, TaskKind, WorkflowDefinition};

pub type NodeId = usize;
pub type ListId = usize;

/// Who owns a task list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListOwner {
    Root,
    /// `case` is `None` for the default case.
    DecisionCase {
        decision: NodeId,
        case: Option<String>,
    },
    ForkBranch { fork: NodeId, branch: usize },
}

#[derive(Debug, Clone)]
pub struct TaskList {
    pub owner: ListOwner,
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct IndexedTask<'a> {
    pub def: &'a TaskDefinition,
    /// List containing this task, and its position in it.
    pub list: ListId,
    pub position: usize,
    /// Lists owned by this task: decision cases (default last) or branches.
    pub children: Vec<ListId>,
}

/// Flattened, validated view of a [`WorkflowDefinition`].
#[derive(Debug, Clone)]
pub struct DefinitionIndex<'a> {
    nodes: Vec<IndexedTask<'a>>,
    lists: Vec<TaskList>,
    by_ref: HashMap<&'a str, NodeId>,
}

impl<'a> DefinitionIndex<'a> {
    pub const ROOT: ListId = 0;

    /// Index and validate `definition`.
    ///
    /// # Errors
    /// Any [`DefinitionError`] describing the first rule violated.
    pub fn build(definition: &'a WorkflowDefinition) -> Result<Self, DefinitionError> {
        if definition.tasks.is_empty() {
            return Err(DefinitionError::EmptyWorkflow(definition.name.clone()));
        }

        let mut index = Self {
            nodes: Vec::new(),
            lists: Vec::new(),
            by_ref: HashMap::new(),
        };
        index.add_list(&definition.tasks, ListOwner::Root)?;

        for id in 0..index.nodes.len() {
            index.check_node(id)?;
        }
        index.check_references(definition)?;
        index.check_acyclic()?;
        Ok(index)
    }

    fn add_list(&mut self, tasks: &'a [TaskDefinition], owner: ListOwner) -> Result<ListId, DefinitionError> {
        let list_id = self.lists.len();
        self.lists.push(TaskList {
            owner,
            nodes: Vec::with_capacity(tasks.len()),
        });

        for (position, def) in tasks.iter().enumerate() {
            let id = self.nodes.len();
            let reference = def.task_reference_name.as_str();
            if reference.is_empty() {
                return Err(DefinitionError::InvalidTask {
                    reference: def.name.clone(),
                    message: "task_reference_name must not be empty".into(),
                });
            }
            if self.by_ref.insert(reference, id).is_some() {
                return Err(DefinitionError::DuplicateReference(reference.to_owned()));
            }
            self.nodes.push(IndexedTask {
                def,
                list: list_id,
                position,
                children: Vec::new(),
            });
            self.lists[list_id].nodes.push(id);

            let mut children = Vec::new();
            match &def.kind {
                TaskKind::Decision {
                    decision_cases,
                    default_case,
                    ..
                } => {
                    for (case, tasks) in decision_cases {
                        let owner = ListOwner::DecisionCase {
                            decision: id,
                            case: Some(case.clone()),
                        };
                        children.push(self.add_list(tasks, owner)?);
                    }
                    let owner = ListOwner::DecisionCase {
                        decision: id,
                        case: None,
                    };
                    children.push(self.add_list(default_case, owner)?);
                }
                TaskKind::Fork { fork_tasks } => {
                    for (branch, tasks) in fork_tasks.iter().enumerate() {
                        let owner = ListOwner::ForkBranch { fork: id, branch };
                        children.push(self.add_list(tasks, owner)?);
                    }
                }
                _ => {}
            }
            self.nodes[id].children = children;
        }
        Ok(list_id)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &IndexedTask<'a> {
        &self.nodes[id]
    }

    pub fn reference(&self, id: NodeId) -> &'a str {
        self.nodes[id].def.task_reference_name.as_str()
    }

    pub fn lookup(&self, reference: &str) -> Option<NodeId> {
        self.by_ref.get(reference).copied()
    }

    pub fn list(&self, id: ListId) -> &TaskList {
        &self.lists[id]
    }

    /// The task before `id` in its list.
    pub fn predecessor(&self, id: NodeId) -> Option<NodeId> {
        let node = &self.nodes[id];
        node.position
            .checked_sub(1)
            .map(|prev| self.lists[node.list].nodes[prev])
    }

    /// The task after `id` in its list.
    pub fn successor(&self, id: NodeId) -> Option<NodeId> {
        let node = &self.nodes[id];
        self.lists[node.list].nodes.get(node.position + 1).copied()
    }

    /// The list a decision picks for `case`, falling back to the default.
    pub fn case_list(&self, decision: NodeId, case: &str) -> ListId {
        let children = &self.nodes[decision].children;
        children
            .iter()
            .copied()
            .find(|&list| {
                matches!(&self.lists[list].owner,
                    ListOwner::DecisionCase { case: Some(name), .. } if name == case)
            })
            .or_else(|| children.last().copied())
            .unwrap_or(Self::ROOT)
    }

    /// Every node inside `list`, nested lists included.
    pub fn descendants(&self, list: ListId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![list];
        while let Some(list) = stack.pop() {
            for &node in &self.lists[list].nodes {
                out.push(node);
                stack.extend(self.nodes[node].children.iter().copied());
            }
        }
        out
    }

    /// The innermost fork branch containing `id`, if any.
    pub fn enclosing_branch(&self, id: NodeId) -> Option<ListId> {
        let mut list = self.nodes[id].list;
        loop {
            match self.lists[list].owner {
                ListOwner::Root => return None,
                ListOwner::ForkBranch { .. } => return Some(list),
                ListOwner::DecisionCase { decision, .. } => list = self.nodes[decision].list,
            }
        }
    }

    /// Tasks that still lie ahead of `id` up to the end of its enclosing
    /// fork branch, nested lists included.
    pub fn rest_of_branch(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = id;
        loop {
            let node = &self.nodes[current];
            let list = &self.lists[node.list];
            for &next in &list.nodes[node.position + 1..] {
                out.push(next);
                for &child in &self.nodes[next].children {
                    out.extend(self.descendants(child));
                }
            }
            match list.owner {
                ListOwner::DecisionCase { decision, .. } => current = decision,
                ListOwner::Root | ListOwner::ForkBranch { .. } => return out,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    fn invalid(&self, id: NodeId, message: impl Into<String>) -> DefinitionError {
        DefinitionError::InvalidTask {
            reference: self.reference(id).to_owned(),
            message: message.into(),
        }
    }

    fn check_node(&self, id: NodeId) -> Result<(), DefinitionError> {
        let node = &self.nodes[id];
        match &node.def.kind {
            TaskKind::Decision { case_value_param, .. } => {
                if case_value_param.trim().is_empty() {
                    return Err(self.invalid(id, "case_value_param must not be empty"));
                }
            }
            TaskKind::Fork { fork_tasks } => {
                if fork_tasks.is_empty() {
                    return Err(self.invalid(id, "fork has no branches"));
                }
                for (branch, &list) in node.children.iter().enumerate() {
                    if self.lists[list].nodes.is_empty() {
                        return Err(DefinitionError::EmptyForkBranch {
                            fork: self.reference(id).to_owned(),
                            branch,
                        });
                    }
                }
                let join = self
                    .successor(id)
                    .filter(|&next| matches!(self.nodes[next].def.kind, TaskKind::Join { .. }));
                match join {
                    Some(join) => self.check_join(id, join)?,
                    None => return Err(DefinitionError::MissingJoin(self.reference(id).to_owned())),
                }
            }
            TaskKind::Join { .. } => {
                let follows_fork = self
                    .predecessor(id)
                    .is_some_and(|prev| matches!(self.nodes[prev].def.kind, TaskKind::Fork { .. }));
                if !follows_fork {
                    return Err(DefinitionError::OrphanJoin(self.reference(id).to_owned()));
                }
            }
            TaskKind::SubWorkflow { sub_workflow_param } => {
                if sub_workflow_param.name.trim().is_empty() {
                    return Err(self.invalid(id, "sub_workflow_param.name must not be empty"));
                }
                sub_workflow_param.version.resolve()?;
            }
            TaskKind::Simple | TaskKind::Terminate { .. } | TaskKind::Wait { .. } => {}
        }
        Ok(())
    }

    fn check_join(&self, fork: NodeId, join: NodeId) -> Result<(), DefinitionError> {
        let TaskKind::Join { join_on } = &self.nodes[join].def.kind else {
            return Ok(());
        };
        let branches: Vec<Vec<NodeId>> = self.nodes[fork]
            .children
            .iter()
            .map(|&list| self.descendants(list))
            .collect();

        let mut covered = vec![false; branches.len()];
        for reference in join_on {
            let branch = self
                .lookup(reference)
                .and_then(|target| branches.iter().position(|nodes| nodes.contains(&target)));
            match branch {
                Some(branch) => covered[branch] = true,
                None => {
                    return Err(DefinitionError::JoinOutsideFork {
                        join: self.reference(join).to_owned(),
                        fork: self.reference(fork).to_owned(),
                        reference: reference.clone(),
                    })
                }
            }
        }
        if let Some(branch) = covered.iter().position(|&c| !c) {
            return Err(DefinitionError::UnjoinedBranch {
                join: self.reference(join).to_owned(),
                fork: self.reference(fork).to_owned(),
                branch,
            });
        }
        Ok(())
    }

    fn check_references(&self, definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
        for node in &self.nodes {
            let params = serde_json::Value::Object(node.def.input_parameters.clone());
            for reference in references(&params) {
                if self.lookup(&reference).is_none() {
                    return Err(DefinitionError::UnknownReference {
                        reference,
                        referenced_by: node.def.task_reference_name.clone(),
                    });
                }
            }
        }
        let output = serde_json::Value::Object(definition.output_parameters.clone());
        for reference in references(&output) {
            if self.lookup(&reference).is_none() {
                return Err(DefinitionError::UnknownReference {
                    reference,
                    referenced_by: "workflow output".into(),
                });
            }
        }
        Ok(())
    }

    /// Structural edges: list order, owner to first child, list end to the
    /// owner's successor. Data edges: referenced task to referencing task.
    fn edges(&self) -> Vec<Vec<NodeId>> {
        let mut adjacency = vec![Vec::new(); self.nodes.len()];
        for list in &self.lists {
            for pair in list.nodes.windows(2) {
                adjacency[pair[0]].push(pair[1]);
            }
        }
        for (id, node) in self.nodes.iter().enumerate() {
            let after = self.successor(id);
            for &child in &node.children {
                let members = &self.lists[child].nodes;
                if let Some(&first) = members.first() {
                    adjacency[id].push(first);
                }
                if let (Some(&last), Some(after)) = (members.last(), after) {
                    adjacency[last].push(after);
                }
            }
            if let TaskKind::Join { join_on } = &node.def.kind {
                for target in join_on.iter().filter_map(|r| self.lookup(r)) {
                    adjacency[target].push(id);
                }
            }
            let params = serde_json::Value::Object(node.def.input_parameters.clone());
            for source in references(&params).iter().filter_map(|r| self.lookup(r)) {
                adjacency[source].push(id);
            }
        }
        adjacency
    }

    /// Kahn's algorithm over [`edges`](Self::edges).
    fn check_acyclic(&self) -> Result<(), DefinitionError> {
        let adjacency = self.edges();
        let mut in_degree = vec![0usize; self.nodes.len()];
        for targets in &adjacency {
            for &target in targets {
                in_degree[target] += 1;
            }
        }

        // Seed the queue with nodes that have no incoming edges.
        let mut queue: VecDeque<NodeId> = (0..self.nodes.len()).filter(|&id| in_degree[id] == 0).collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for &next in &adjacency[id] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        // If we didn't visit every node the graph contains a cycle.
        if visited != self.nodes.len() {
            let stuck = (0..self.nodes.len()).find(|&id| in_degree[id] > 0).unwrap_or(0);
            return Err(DefinitionError::CycleDetected(self.reference(stuck).to_owned()));
        }
        Ok(())
    }
}

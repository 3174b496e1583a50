//! Parameter expressions.
//!
//! Input parameters may contain `${...}` expressions:
//!
//! - `${workflow.input.path}`: the execution's input
//! - `${workflow.workflowId}`, `${workflow.correlationId}`
//! - `${ref.output.path}` / `${ref.input.path}`: another task's latest attempt
//!
//! Paths are dot-separated; numeric segments index arrays. A string that is
//! exactly one expression is replaced by the referenced JSON value, otherwise
//! every expression is interpolated as text.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::execution::{Execution, TaskExecution, TaskStatus};

/// Outcome of resolving a parameter map.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Ready(Value),
    /// Some expression points at a task whose output doesn't exist yet.
    Deferred { waiting_on: String },
}

/// What resolution may read.
pub struct ResolveContext<'a> {
    pub execution: &'a Execution,
    pub latest: &'a HashMap<&'a str, &'a TaskExecution>,
}

impl<'a> ResolveContext<'a> {
    pub fn new(execution: &'a Execution, latest: &'a HashMap<&'a str, &'a TaskExecution>) -> Self {
        Self { execution, latest }
    }

    /// Resolve every value of `params` into a JSON object.
    pub fn resolve(&self, params: &Map<String, Value>) -> Resolved {
        let mut resolved = Map::with_capacity(params.len());
        for (key, value) in params {
            match self.resolve_value(value, false) {
                Ok(value) => {
                    resolved.insert(key.clone(), value);
                }
                Err(waiting_on) => return Resolved::Deferred { waiting_on },
            }
        }
        Resolved::Ready(Value::Object(resolved))
    }

    /// Like [`resolve`](Self::resolve) but unresolvable references become
    /// `null`. Used for workflow output, where nothing is left to wait for.
    pub fn resolve_lenient(&self, params: &Map<String, Value>) -> Value {
        let resolved = params
            .iter()
            .map(|(key, value)| {
                let value = self.resolve_value(value, true).unwrap_or(Value::Null);
                (key.clone(), value)
            })
            .collect();
        Value::Object(resolved)
    }

    fn resolve_value(&self, value: &Value, lenient: bool) -> Result<Value, String> {
        match value {
            Value::String(text) => self.resolve_string(text, lenient),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item, lenient))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(fields) => fields
                .iter()
                .map(|(key, item)| Ok((key.clone(), self.resolve_value(item, lenient)?)))
                .collect::<Result<Map<_, _>, String>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(&self, text: &str, lenient: bool) -> Result<Value, String> {
        let segments = parse(text);
        let lookup = |expr: &str| match self.lookup(expr) {
            Err(_) if lenient => Ok(Value::Null),
            other => other,
        };

        if let [Segment::Expr(expr)] = segments.as_slice() {
            return lookup(expr);
        }
        if !segments.iter().any(|s| matches!(s, Segment::Expr(_))) {
            return Ok(Value::String(text.to_owned()));
        }

        let mut out = String::with_capacity(text.len());
        for segment in segments {
            match segment {
                Segment::Literal(literal) => out.push_str(literal),
                Segment::Expr(expr) => match lookup(expr)? {
                    Value::Null => {}
                    Value::String(s) => out.push_str(&s),
                    other => out.push_str(&other.to_string()),
                },
            }
        }
        Ok(Value::String(out))
    }

    fn lookup(&self, expr: &str) -> Result<Value, String> {
        let mut parts = expr.trim().splitn(3, '.');
        let root = parts.next().unwrap_or_default();
        let section = parts.next().unwrap_or_default();
        let path = parts.next();

        if root == "workflow" {
            let execution = self.execution;
            return Ok(match section {
                "input" => navigate(&execution.input, path),
                "workflowId" => Value::String(execution.id.to_string()),
                "correlationId" => execution
                    .correlation_id
                    .clone()
                    .map_or(Value::Null, Value::String),
                "parentWorkflowId" => execution
                    .parent
                    .map_or(Value::Null, |p| Value::String(p.execution_id.to_string())),
                _ => Value::Null,
            });
        }

        let Some(task) = self.latest.get(root) else {
            return Err(root.to_owned());
        };
        match (section, task.status) {
            ("input", _) => Ok(navigate(&task.input, path)),
            ("output", TaskStatus::Completed) => Ok(navigate(&task.output, path)),
            ("output", status) if status.is_terminal() => Ok(Value::Null),
            ("output", _) => Err(root.to_owned()),
            _ => Ok(Value::Null),
        }
    }
}

fn navigate(value: &Value, path: Option<&str>) -> Value {
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return value.clone();
    };
    let mut current = value;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(fields) => fields.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

// ---------------------------------------------------------------------------
// Expression scanning
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Literal(&'a str),
    Expr(&'a str),
}

fn parse(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        segments.push(Segment::Expr(&rest[start + 2..start + 2 + len]));
        rest = &rest[start + 3 + len..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    segments
}

/// Task references (the first path segment of every expression other than
/// `workflow`) found anywhere inside `value`.
pub fn references(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect_references(value, &mut found);
    found
}

fn collect_references(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            for segment in parse(text) {
                if let Segment::Expr(expr) = segment {
                    let root = expr.trim().split('.').next().unwrap_or_default();
                    if root != "workflow" && !found.iter().any(|r| r == root) {
                        found.push(root.to_owned());
                    }
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_references(item, found)),
        Value::Object(fields) => fields.values().for_each(|item| collect_references(item, found)),
        _ => {}
    }
}

//! `MockHandler`: a test double for `TaskHandler`.
//!
//! Useful in unit and integration tests where a real worker is either
//! unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::{HandlerError, TaskContext, TaskHandler};

/// Behaviour injected into `MockHandler` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Echo the task input back as output.
    Echo,
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
}

/// A mock handler that records every call it receives and returns a
/// programmer-specified result.
pub struct MockHandler {
    /// Label used in test assertions.
    pub name: String,
    /// What the handler will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// All inputs seen by this handler (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
}

impl MockHandler {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that returns its input unchanged.
    pub fn echo(name: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::Echo)
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Number of times this handler has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
    }
}

#[async_trait]
impl TaskHandler for MockHandler {
    async fn execute(&self, input: Value, ctx: &TaskContext) -> Result<Value, HandlerError> {
        debug!(handler = %self.name, task_id = %ctx.task_id, attempt = ctx.attempt, "mock handler invoked");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(input.clone());
        }

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => {
                // Tag the output with the handler name so tests can trace which
                // handler produced it.
                let mut out = json!({ "handler": self.name });
                if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
                    for (k, val) in v_obj {
                        out_obj.insert(k.clone(), val.clone());
                    }
                }
                Ok(out)
            }
            MockBehaviour::Echo => Ok(input),
            MockBehaviour::FailRetryable(msg) => Err(HandlerError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(HandlerError::Fatal(msg.clone())),
        }
    }
}

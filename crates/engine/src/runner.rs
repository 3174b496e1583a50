//! In-process workers.
//!
//! A [`WorkerPool`] runs one polling loop per registered handler. Each loop
//! leases a task, runs the handler on the resolved input, and reports the
//! result back through the executor, so in-process handlers follow exactly
//! the same lease protocol as remote workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use workers::{TaskContext, TaskHandler};

use crate::error::EngineError;
use crate::executor::{PolledTask, TaskResult, UpdateOutcome, WorkflowExecutor};
use crate::modules::HandlerRegistry;

pub struct WorkerPool {
    executor: Arc<WorkflowExecutor>,
    handlers: HandlerRegistry,
    poll_interval: Duration,
    worker_id: String,
}

impl WorkerPool {
    pub fn new(executor: Arc<WorkflowExecutor>, handlers: HandlerRegistry, worker_id: impl Into<String>) -> Self {
        Self {
            poll_interval: executor.config().worker_poll_interval(),
            executor,
            handlers,
            worker_id: worker_id.into(),
        }
    }

    /// Start one polling loop per handler. Loops exit when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let pool = Arc::new(self);
        pool.handlers
            .iter()
            .map(|(queue_name, handler)| {
                let pool = pool.clone();
                let handler = handler.clone();
                let cancel = cancel.clone();
                let span = tracing::info_span!("worker", queue = %queue_name, worker_id = %pool.worker_id);
                let queue_name = queue_name.clone();
                tokio::spawn(
                    async move {
                        info!("worker started");
                        pool.poll_loop(&queue_name, handler, cancel).await;
                        info!("worker stopped");
                    }
                    .instrument(span),
                )
            })
            .collect()
    }

    async fn poll_loop(&self, queue_name: &str, handler: Arc<dyn TaskHandler>, cancel: CancellationToken) {
        loop {
            let worked = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.run_once(queue_name, handler.as_ref()) => result,
            };
            match worked {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => warn!(error = %err, "worker iteration failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Poll `queue_name` once and run the task if there was one.
    ///
    /// `queue_name` is `<task name>` or `<task name>:<domain>`.
    pub async fn run_once(&self, queue_name: &str, handler: &dyn TaskHandler) -> Result<bool, EngineError> {
        let (task_type, domain) = match queue_name.split_once(':') {
            Some((task_type, domain)) => (task_type, Some(domain)),
            None => (queue_name, None),
        };
        let Some(polled) = self.executor.poll_task(task_type, domain, &self.worker_id).await? else {
            return Ok(false);
        };
        self.execute_one(handler, polled).await?;
        Ok(true)
    }

    /// Run `handler` for a leased task and report the outcome.
    pub async fn execute_one(&self, handler: &dyn TaskHandler, polled: PolledTask) -> Result<UpdateOutcome, EngineError> {
        let PolledTask { execution_id, task, lease } = polled;
        let ctx = TaskContext {
            execution_id,
            task_id: task.id,
            reference_name: task.reference_name.clone(),
            attempt: task.attempt,
            lease_id: lease.lease_id,
        };

        let result = match handler.execute(task.input.clone(), &ctx).await {
            Ok(output) => TaskResult::completed(task.id, Some(lease.lease_id), output),
            Err(err) => {
                debug!(task_id = %task.id, error = %err, "handler failed");
                TaskResult::failed(task.id, Some(lease.lease_id), err.reason(), err.is_retryable())
            }
        };
        let outcome = self.executor.update_task(result).await?;
        if outcome == UpdateOutcome::Ignored {
            debug!(task_id = %task.id, "result arrived after the task finished");
        }
        Ok(outcome)
    }
}

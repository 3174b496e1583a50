//! Periodic repair of running executions.
//!
//! Each sweep re-evaluates every RUNNING execution: tasks whose lease or
//! timeout ran out become TIMED_OUT (and go through the retry policy),
//! children that finished while their parent missed the notification are
//! picked up, and lost enqueues are re-emitted by the decider. Sweeping an
//! execution that needs nothing is a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use queue::clock::after;

use crate::config::{EngineConfig, ServerIdentity};
use crate::execution::{Execution, TaskStatus};
use crate::executor::{SweepOutcome, WorkflowExecutor};
use crate::models::{TaskType, WorkflowDefinition};
use crate::transition::{TaskUpdate, Transition};

/// TIMED_OUT transitions for leased SIMPLE tasks that ran out of time.
///
/// A task times out when its lease expired without a heartbeat, or when it
/// has been in progress longer than its definition's `timeout_seconds`.
pub fn expired_tasks(
    definition: &WorkflowDefinition,
    execution: &Execution,
    now: DateTime<Utc>,
) -> Vec<Transition> {
    execution
        .open_tasks()
        .filter(|task| task.task_type == TaskType::Simple && task.status == TaskStatus::InProgress)
        .filter_map(|task| {
            let reason = if task.lease_expired(now) {
                "lease expired without a result".to_owned()
            } else {
                let limit = definition
                    .find_task(&task.reference_name)
                    .and_then(|def| def.timeout_seconds)?;
                let started = task.started_at?;
                if after(started, Duration::from_secs(limit)) > now {
                    return None;
                }
                format!("task timed out after {limit}s")
            };
            debug!(task_id = %task.id, reference = %task.reference_name, %reason, "task expired");
            Some(Transition::UpdateTask(TaskUpdate {
                retryable: Some(true),
                ..TaskUpdate::new(task.id, TaskStatus::TimedOut).with_reason(reason)
            }))
        })
        .collect()
}

/// Counts from one pass over the running executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Executions whose state changed.
    pub swept: usize,
    /// Executions evaluated with nothing to do, or no longer running.
    pub skipped: usize,
    pub failed: usize,
}

pub struct Sweeper {
    executor: Arc<WorkflowExecutor>,
    interval: Duration,
    disabled: bool,
    identity: ServerIdentity,
}

impl Sweeper {
    pub fn new(executor: Arc<WorkflowExecutor>, config: &EngineConfig) -> Self {
        Self {
            executor,
            interval: config.sweep_interval(),
            disabled: config.sweep_disabled,
            identity: config.identity.clone(),
        }
    }

    /// Sweep every running execution once. A failure on one execution is
    /// logged and does not stop the others.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let ids = match self.executor.running_executions().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "could not list running executions");
                report.failed += 1;
                return report;
            }
        };

        for id in ids {
            match self.executor.sweep(id).await {
                Ok(SweepOutcome::Swept { changed: true }) => report.swept += 1,
                Ok(_) => report.skipped += 1,
                Err(err) => {
                    warn!(execution_id = %id, error = %err, "sweep failed");
                    report.failed += 1;
                }
            }
        }
        if report.swept > 0 || report.failed > 0 {
            info!(swept = report.swept, skipped = report.skipped, failed = report.failed, "sweep finished");
        }
        report
    }

    /// Sweep on a fixed interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        if self.disabled {
            info!("sweeper disabled");
            return;
        }
        info!(
            server_id = %self.identity.server_id,
            stack = %self.identity.stack,
            interval_secs = self.interval.as_secs(),
            "sweeper started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
        info!("sweeper stopped");
    }
}

// ===========================================================================
// Unit tests
// ===========================================================================

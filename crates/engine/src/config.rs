//! Engine configuration.
//!
//! Every knob has a default; the CLI overlays flags and environment variables
//! on top of [`EngineConfig::default`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::modules::ModuleFactory;
use crate::payload::PayloadKind;

// ---------------------------------------------------------------------------
// Payload thresholds
// ---------------------------------------------------------------------------

/// Soft and hard payload limits, in kilobytes.
///
/// Crossing a soft limit logs a warning; crossing a hard limit rejects the
/// operation (or fails the task/workflow when the decider produced the value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadThresholds {
    pub workflow_input_kb: u64,
    pub max_workflow_input_kb: u64,
    pub workflow_output_kb: u64,
    pub max_workflow_output_kb: u64,
    pub task_input_kb: u64,
    pub max_task_input_kb: u64,
    pub task_output_kb: u64,
    pub max_task_output_kb: u64,
}

impl Default for PayloadThresholds {
    fn default() -> Self {
        Self {
            workflow_input_kb: 5120,
            max_workflow_input_kb: 10240,
            workflow_output_kb: 5120,
            max_workflow_output_kb: 10240,
            task_input_kb: 3072,
            max_task_input_kb: 10240,
            task_output_kb: 3072,
            max_task_output_kb: 10240,
        }
    }
}

impl PayloadThresholds {
    /// `(soft, hard)` limits for one kind of payload.
    pub fn limits(&self, kind: PayloadKind) -> (u64, u64) {
        match kind {
            PayloadKind::WorkflowInput => (self.workflow_input_kb, self.max_workflow_input_kb),
            PayloadKind::WorkflowOutput => (self.workflow_output_kb, self.max_workflow_output_kb),
            PayloadKind::TaskInput => (self.task_input_kb, self.max_task_input_kb),
            PayloadKind::TaskOutput => (self.task_output_kb, self.max_task_output_kb),
        }
    }
}

// ---------------------------------------------------------------------------
// Server identity
// ---------------------------------------------------------------------------

/// Where this engine instance runs. Only used to label logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerIdentity {
    pub server_id: String,
    pub environment: String,
    pub stack: String,
    pub app_id: String,
    pub region: String,
    pub availability_zone: String,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            server_id: "unknown".into(),
            environment: "test".into(),
            stack: "test".into(),
            app_id: "conductor".into(),
            region: "us-east-1".into(),
            availability_zone: "us-east-1c".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor, sweeper and worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between sweeper passes.
    pub sweep_interval_seconds: u64,
    pub sweep_disabled: bool,
    /// Turns off the in-process worker pool.
    pub async_workers_disabled: bool,
    pub payload: PayloadThresholds,
    pub identity: ServerIdentity,
    /// Lease granted to a worker per poll, in seconds.
    pub lease_seconds: u64,
    /// How many compare-and-swap races one evaluation may lose.
    pub max_apply_attempts: u32,
    /// Ceiling on any computed retry delay, in seconds.
    pub max_retry_delay_seconds: u64,
    /// Idle sleep of an in-process worker with nothing to do.
    pub worker_poll_interval_ms: u64,
    /// Runtime modules loaded at startup, in order.
    #[serde(skip)]
    pub additional_modules: Vec<ModuleFactory>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 30,
            sweep_disabled: false,
            async_workers_disabled: false,
            payload: PayloadThresholds::default(),
            identity: ServerIdentity::default(),
            lease_seconds: 60,
            max_apply_attempts: 5,
            max_retry_delay_seconds: 3600,
            worker_poll_interval_ms: 500,
            additional_modules: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_seconds.max(1))
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_seconds)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms.max(1))
    }
}

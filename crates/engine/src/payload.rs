//! Payload size guard.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::config::PayloadThresholds;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    WorkflowInput,
    WorkflowOutput,
    TaskInput,
    TaskOutput,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::WorkflowInput => "workflow input",
            Self::WorkflowOutput => "workflow output",
            Self::TaskInput => "task input",
            Self::TaskOutput => "task output",
        };
        f.write_str(label)
    }
}

/// Outcome of a successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadCheck {
    WithinLimits,
    OverSoftLimit { size_kb: u64 },
}

/// Measures serialized JSON payloads against [`PayloadThresholds`].
#[derive(Debug, Clone, Default)]
pub struct PayloadGuard {
    thresholds: PayloadThresholds,
}

impl PayloadGuard {
    pub fn new(thresholds: PayloadThresholds) -> Self {
        Self { thresholds }
    }

    /// Size of `value` once serialized, rounded up to whole kilobytes.
    pub fn size_kb(value: &Value) -> u64 {
        let bytes = serde_json::to_vec(value).map_or(0, |encoded| encoded.len() as u64);
        bytes.div_ceil(1024)
    }

    /// Warns above the soft limit, errors above the hard limit.
    pub fn check(&self, kind: PayloadKind, value: &Value) -> Result<PayloadCheck, EngineError> {
        let (soft_kb, max_kb) = self.thresholds.limits(kind);
        let size_kb = Self::size_kb(value);
        if size_kb > max_kb {
            return Err(EngineError::PayloadTooLarge {
                kind,
                size_kb,
                max_kb,
            });
        }
        if size_kb > soft_kb {
            warn!(%kind, size_kb, soft_kb, "payload above the soft threshold");
            return Ok(PayloadCheck::OverSoftLimit { size_kb });
        }
        Ok(PayloadCheck::WithinLimits)
    }
}

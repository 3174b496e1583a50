//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models and carry no domain behaviour.
//! Domain types live in the `engine` crate and travel through the JSONB
//! columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// workflow_definitions
// ---------------------------------------------------------------------------

/// A persisted workflow definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DefinitionRow {
    pub name: String,
    pub version: i32,
    /// Full JSON workflow definition (tasks, policies, output mapping, …)
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// workflow_executions
// ---------------------------------------------------------------------------

/// A persisted workflow execution row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_name: String,
    /// Denormalised from the snapshot so the sweeper can filter on it.
    pub status: String,
    pub snapshot: serde_json::Value,
    /// Optimistic concurrency token; bumped on every successful write.
    pub version: i64,
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// task_queue
// ---------------------------------------------------------------------------

/// A queue entry row. Leased while `lease_expires_at` lies in the future.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueueEntryRow {
    pub task_id: Uuid,
    pub queue_name: String,
    pub priority: i32,
    pub seq: i64,
    pub lease_id: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

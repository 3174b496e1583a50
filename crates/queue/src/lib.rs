//! `queue` crate: per-task-type lease queues.
//!
//! Workers poll a named queue and receive a [`Lease`]: a time-bounded claim
//! identified by a receipt (`lease_id`). An entry whose lease expires becomes
//! pollable again without the original holder being reachable, which gives
//! at-least-once delivery. Acks and lease extensions must present the
//! current receipt; stale holders are rejected.

pub mod clock;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::QueueError;
pub use memory::MemoryQueue;
pub use postgres::PgTaskQueue;
pub use traits::{Lease, TaskQueue};

//! Route handlers, one module per resource.

pub mod executions;
pub mod tasks;
pub mod workflows;

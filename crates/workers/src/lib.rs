//! `workers` crate: the worker-side contract for executing scheduled tasks.
//!
//! Every in-process task handler must implement [`TaskHandler`]. Remote
//! workers speak the same contract over the HTTP transport; the engine's
//! worker pool dispatches in-process execution through this trait object.

pub mod error;
pub mod traits;
pub mod mock;

pub use error::HandlerError;
pub use traits::{TaskContext, TaskHandler};

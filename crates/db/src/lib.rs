//! `db` crate: pure persistence layer.
//!
//! Provides a connection pool, typed row structs, and repository functions
//! for every table in the rusty-conductor schema. No business logic lives
//! here: snapshots and definitions are opaque JSON to this crate.

pub mod error;
pub mod pool;
pub mod repository;
pub mod models;

pub use pool::DbPool;
pub use error::DbError;

//! Errors raised by the repository layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    /// Unique key violation on insert.
    #[error("row already exists")]
    AlreadyExists,

    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    /// Whether running the same statement again later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlx(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed) => true,
            // serialization_failure, deadlock_detected
            Self::Sqlx(sqlx::Error::Database(err)) => matches!(err.code().as_deref(), Some("40001" | "40P01")),
            _ => false,
        }
    }
}

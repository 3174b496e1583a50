//! Postgres connection pool and schema migrations.

use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// Definitions, execution snapshots and the task queue.
static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// A poller or sweeper waiting longer than this for a connection reports a
/// transient error instead of stalling its loop.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared by the store, the queue and every background loop of one server.
pub type DbPool = PgPool;

/// Connect to `database_url`. `max_connections` bounds the database
/// concurrency of the whole process.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    info!(max_connections, "connecting to postgres");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply any migration under `migrations/` that has not run yet.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!(known = MIGRATOR.iter().count(), "applying schema migrations");
    MIGRATOR.run(pool).await?;
    Ok(())
}

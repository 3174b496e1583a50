//! Workflow definition operations.

use chrono::Utc;
use sqlx::PgPool;

use crate::{DbError, models::DefinitionRow};

/// Insert a new workflow definition.
///
/// `definition` must be a valid JSON object produced by serialising the
/// domain `WorkflowDefinition` type from the `engine` crate. Definitions are
/// immutable: registering an existing `(name, version)` pair returns
/// `DbError::AlreadyExists`.
pub async fn insert_definition(
    pool: &PgPool,
    name: &str,
    version: i32,
    definition: serde_json::Value,
) -> Result<DefinitionRow, DbError> {
    let row = sqlx::query_as::<_, DefinitionRow>(
        r#"
        INSERT INTO workflow_definitions (name, version, definition, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (name, version) DO NOTHING
        RETURNING name, version, definition, created_at
        "#,
    )
    .bind(name)
    .bind(version)
    .bind(definition)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::AlreadyExists)?;

    Ok(row)
}

/// Fetch one exact version of a definition.
pub async fn get_definition(
    pool: &PgPool,
    name: &str,
    version: i32,
) -> Result<Option<DefinitionRow>, DbError> {
    let row = sqlx::query_as::<_, DefinitionRow>(
        r#"
        SELECT name, version, definition, created_at
        FROM workflow_definitions
        WHERE name = $1 AND version = $2
        "#,
    )
    .bind(name)
    .bind(version)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Fetch the highest registered version of a definition.
pub async fn get_latest_definition(
    pool: &PgPool,
    name: &str,
) -> Result<Option<DefinitionRow>, DbError> {
    let row = sqlx::query_as::<_, DefinitionRow>(
        r#"
        SELECT name, version, definition, created_at
        FROM workflow_definitions
        WHERE name = $1
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

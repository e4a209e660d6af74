//! Database query functions for the `backup` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Backup, BackupStatus};

/// Insert a new backup row in `pending` status.
pub async fn insert_backup(pool: &PgPool, organization_id: Uuid) -> Result<Backup> {
    let backup = sqlx::query_as::<_, Backup>(
        "INSERT INTO backup (organization_id) VALUES ($1) RETURNING *",
    )
    .bind(organization_id)
    .fetch_one(pool)
    .await
    .context("failed to insert backup")?;

    Ok(backup)
}

/// Fetch a single backup by ID.
pub async fn get_backup(pool: &PgPool, id: Uuid) -> Result<Option<Backup>> {
    let backup = sqlx::query_as::<_, Backup>("SELECT * FROM backup WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch backup")?;

    Ok(backup)
}

/// Mark a backup in progress, stamping `started_at`.
pub async fn mark_started(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE backup SET status = 'in_progress', started_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark backup started")?;

    Ok(())
}

/// Record a completed backup with its archive path and counts.
#[allow(clippy::too_many_arguments)]
pub async fn mark_completed(
    pool: &PgPool,
    id: Uuid,
    archive_path: &str,
    size_bytes: i64,
    pg_entities: i64,
    graph_entities: i64,
    graph_relationships: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE backup \
         SET status = 'completed', \
             archive_path = $2, \
             size_bytes = $3, \
             pg_entities = $4, \
             graph_entities = $5, \
             graph_relationships = $6, \
             completed_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(archive_path)
    .bind(size_bytes)
    .bind(pg_entities)
    .bind(graph_entities)
    .bind(graph_relationships)
    .execute(pool)
    .await
    .context("failed to mark backup completed")?;

    Ok(())
}

/// Record a failed backup with its error.
pub async fn mark_failed(pool: &PgPool, id: Uuid, error: &str) -> Result<()> {
    sqlx::query("UPDATE backup SET status = 'failed', error = $2, completed_at = NOW() WHERE id = $1")
        .bind(id)
        .bind(error)
        .execute(pool)
        .await
        .context("failed to mark backup failed")?;

    Ok(())
}

/// List completed backups older than the cutoff, for retention cleanup.
pub async fn list_completed_before(
    pool: &PgPool,
    organization_id: Uuid,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Backup>> {
    let backups = sqlx::query_as::<_, Backup>(
        "SELECT * FROM backup \
         WHERE organization_id = $1 AND status = 'completed' AND created_at < $2 \
         ORDER BY created_at ASC",
    )
    .bind(organization_id)
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list old backups")?;

    Ok(backups)
}

/// Delete a backup row.
pub async fn delete_backup(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM backup WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete backup row")?;

    Ok(())
}

/// Backups for an org, newest first. `status` narrows when provided.
pub async fn list_for_org(
    pool: &PgPool,
    organization_id: Uuid,
    status: Option<BackupStatus>,
    limit: i64,
) -> Result<Vec<Backup>> {
    let backups = sqlx::query_as::<_, Backup>(
        "SELECT * FROM backup \
         WHERE organization_id = $1 AND ($2::text IS NULL OR status = $2) \
         ORDER BY created_at DESC \
         LIMIT $3",
    )
    .bind(organization_id)
    .bind(status.map(|s| s.to_string()))
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list backups")?;

    Ok(backups)
}
